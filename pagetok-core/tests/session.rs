mod common;

use std::{fs, path::Path};

use candle_core::{Device, Tensor};
use common::word_level_tokenizer;
use indexmap::IndexMap;
use pagetok_core::{
    BackendContext, ChatMessage, DecodeOptions, EncodeOptions, HfTokenizerGraph,
    HfTokenizersBackend, TokenizerSession, CHAT_TEMPLATE_KEY, PAD_TOKEN_ID_KEY,
};

fn ctx() -> BackendContext<HfTokenizersBackend> {
    BackendContext::new(HfTokenizersBackend)
}

fn hf_session(config_dir: Option<&Path>) -> TokenizerSession {
    let (tok, detok) = HfTokenizerGraph::pair(word_level_tokenizer());
    TokenizerSession::new(&ctx(), Some(&tok), Some(&detok), config_dir).unwrap()
}

fn ids(session: &TokenizerSession, text: &str, opts: &EncodeOptions) -> Vec<Vec<i64>> {
    session
        .encode(text, opts)
        .unwrap()
        .input_ids
        .to_vec2::<i64>()
        .unwrap()
}

fn message(role: &str, content: &str) -> ChatMessage {
    IndexMap::from([
        ("role".to_string(), role.to_string()),
        ("content".to_string(), content.to_string()),
    ])
}

#[test]
fn encode_then_decode_round_trips() {
    let session = hf_session(None);
    let encoded = ids(&session, "hello world", &EncodeOptions::default());
    assert_eq!(encoded, vec![vec![1, 4, 5, 2]]);

    let text = session
        .decode(&encoded[0], &DecodeOptions::default())
        .unwrap();
    assert_eq!(text, "hello world");
    let raw = session
        .decode(
            &encoded[0],
            &DecodeOptions::new().with_skip_special_tokens(false),
        )
        .unwrap();
    assert_eq!(raw, "<s> hello world </s>");
}

#[test]
fn add_special_tokens_toggles_per_call() {
    let session = hf_session(None);
    let plain = EncodeOptions::new().with_add_special_tokens(false);
    assert_eq!(ids(&session, "how are you", &plain), vec![vec![6, 7, 8]]);
    assert_eq!(
        ids(&session, "how are you", &EncodeOptions::default()),
        vec![vec![1, 6, 7, 8, 2]]
    );
    assert_eq!(ids(&session, "how are you", &plain), vec![vec![6, 7, 8]]);
}

#[test]
fn batches_are_right_padded_with_a_mask() {
    let session = hf_session(None);
    let out = session
        .encode(
            vec!["hello world".to_string(), "you".to_string()],
            &EncodeOptions::new().with_add_special_tokens(false),
        )
        .unwrap();
    assert_eq!(
        out.input_ids.to_vec2::<i64>().unwrap(),
        vec![vec![4, 5], vec![8, 0]]
    );
    assert_eq!(
        out.attention_mask.to_vec2::<i64>().unwrap(),
        vec![vec![1, 1], vec![1, 0]]
    );
    assert!(out.token_type_ids.is_none());
}

#[test]
fn max_length_truncates_and_pads() {
    let session = hf_session(None);
    let truncated = EncodeOptions::new()
        .with_add_special_tokens(false)
        .with_max_length(2);
    assert_eq!(ids(&session, "how are you", &truncated), vec![vec![6, 7]]);

    let padded = EncodeOptions::new()
        .with_add_special_tokens(false)
        .with_max_length(5)
        .with_pad_to_max_length(true);
    let out = session.encode("how are", &padded).unwrap();
    assert_eq!(
        out.input_ids.to_vec2::<i64>().unwrap(),
        vec![vec![6, 7, 0, 0, 0]]
    );
    assert_eq!(
        out.attention_mask.to_vec2::<i64>().unwrap(),
        vec![vec![1, 1, 0, 0, 0]]
    );

    // Back to defaults: no truncation.
    assert_eq!(
        ids(&session, "how are you", &EncodeOptions::default()),
        vec![vec![1, 6, 7, 8, 2]]
    );
}

#[test]
fn pairs_produce_token_type_ids() {
    let session = hf_session(None);
    let out = session
        .encode(
            vec![("hello".to_string(), "world".to_string())],
            &EncodeOptions::default(),
        )
        .unwrap();
    assert_eq!(
        out.input_ids.to_vec2::<i64>().unwrap(),
        vec![vec![1, 4, 2, 5, 2]]
    );
    assert_eq!(
        out.token_type_ids.unwrap().to_vec2::<i64>().unwrap(),
        vec![vec![0, 0, 0, 1, 1]]
    );

    // A single first text pairs with every second text.
    let out = session
        .encode(
            (
                vec!["hello".to_string()],
                vec!["world".to_string(), "you".to_string()],
            ),
            &EncodeOptions::default(),
        )
        .unwrap();
    assert_eq!(
        out.input_ids.to_vec2::<i64>().unwrap(),
        vec![vec![1, 4, 2, 5, 2], vec![1, 4, 2, 8, 2]]
    );
}

#[test]
fn batch_decode_matches_single_decodes() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("config.json"),
        r#"{"pad_token_id": 0, "bos_token_id": 1, "eos_token_id": 2}"#,
    )
    .unwrap();
    let session = hf_session(Some(dir.path()));
    assert_eq!(session.pad_token_id(), 0);

    let lines = vec![vec![4, 5, 6], vec![4, 5]];
    let batch = session
        .decode_batch(&lines, &DecodeOptions::default())
        .unwrap();
    let single = lines
        .iter()
        .map(|l| session.decode(l, &DecodeOptions::default()).unwrap())
        .collect::<Vec<_>>();
    assert_eq!(batch, single);
    assert_eq!(batch, vec!["hello world how", "hello world"]);
}

#[test]
fn batch_decode_keeping_special_tokens_matches_single_decodes() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("config.json"),
        r#"{"pad_token_id": 0, "bos_token_id": 1, "eos_token_id": 2}"#,
    )
    .unwrap();
    let session = hf_session(Some(dir.path()));

    let keep = DecodeOptions::new().with_skip_special_tokens(false);
    let lines = vec![vec![1, 2, 3], vec![1, 2]];
    let batch = session.decode_batch(&lines, &keep).unwrap();
    let single = lines
        .iter()
        .map(|l| session.decode(l, &keep).unwrap())
        .collect::<Vec<_>>();
    assert_eq!(batch, single);
    assert_eq!(batch, vec!["<s> </s> <unk>", "<s> </s>"]);
}

#[test]
fn trailing_eos_survives_when_it_doubles_as_pad() {
    let (tok, detok) = HfTokenizerGraph::pair(word_level_tokenizer());
    let detok = detok.with_runtime_info(PAD_TOKEN_ID_KEY, 2);
    let session = TokenizerSession::new(&ctx(), Some(&tok), Some(&detok), None).unwrap();
    assert_eq!(session.pad_token_id(), 2);

    let keep = DecodeOptions::new().with_skip_special_tokens(false);
    assert_eq!(session.decode(&[1, 4, 2], &keep).unwrap(), "<s> hello </s>");
    let batch = session
        .decode_batch(&[vec![1, 4, 5, 2], vec![1, 8, 2], vec![1]], &keep)
        .unwrap();
    assert_eq!(batch, vec!["<s> hello world </s>", "<s> you </s>", "<s>"]);
}

#[test]
fn decode_tensor_decodes_every_row() {
    let session = hf_session(None);
    let tokens = Tensor::new(&[[4i64, 5], [6, 7]], &Device::Cpu).unwrap();
    assert_eq!(
        session
            .decode_tensor(&tokens, &DecodeOptions::default())
            .unwrap(),
        vec!["hello world", "how are"]
    );
}

#[test]
fn special_token_ids_are_found_by_encoding_their_strings() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("special_tokens_map.json"),
        r#"{"bos_token": "<s>", "eos_token": {"content": "</s>"}, "pad_token": "<pad>"}"#,
    )
    .unwrap();
    let session = hf_session(Some(dir.path()));
    assert_eq!(session.bos_token_id(), 1);
    assert_eq!(session.eos_token_id(), 2);
    assert_eq!(session.pad_token_id(), 0);
    assert_eq!(session.pad_token(), "<pad>");
}

#[test]
fn special_token_strings_are_found_by_decoding_their_ids() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("config.json"),
        r#"{"bos_token_id": 1, "eos_token_id": [2, 3]}"#,
    )
    .unwrap();
    let session = hf_session(Some(dir.path()));
    assert_eq!(session.bos_token(), "<s>");
    assert_eq!(session.eos_token(), "</s>");
    assert_eq!(session.pad_token_id(), 2);
    assert_eq!(session.pad_token(), "</s>");
}

#[test]
fn unresolved_tokens_report_unknown() {
    let session = hf_session(None);
    assert_eq!(session.bos_token_id(), pagetok_core::UNKNOWN_TOKEN_ID);
    assert_eq!(session.bos_token(), "");
}

#[test]
fn vocab_comes_from_the_detokenizer() {
    let session = hf_session(None);
    let vocab = session.vocab().unwrap();
    assert_eq!(vocab.len(), 12);
    assert_eq!(vocab[4], "hello");
    assert_eq!(session.vocab_map().unwrap()["</s>"], 2);
}

#[test]
fn chat_template_from_config_is_patched_and_rendered() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("tokenizer_config.json"),
        r#"{
            "bos_token": "<s>",
            "eos_token": "</s>",
            "chat_template": "{{ bos_token }}{% for m in messages %}{{ m['role'] }}: {{ m['content'].strip() }}\n{% endfor %}{% if add_generation_prompt %}assistant:{% endif %}"
        }"#,
    )
    .unwrap();
    let session = hf_session(Some(dir.path()));
    assert!(session.chat_template().unwrap().contains("|trim"));

    let prompt = session
        .apply_chat_template(&[message("user", " hello ")], true, None)
        .unwrap();
    assert_eq!(prompt, "<s>user: hello\nassistant:");
}

#[test]
fn override_and_replacement_templates() {
    let mut session = hf_session(None);
    assert!(session
        .apply_chat_template(&[message("user", "hi")], false, None)
        .is_err());

    let prompt = session
        .apply_chat_template(
            &[message("user", "hi")],
            false,
            Some("{{ messages[0]['content'].upper() }}"),
        )
        .unwrap();
    assert_eq!(prompt, "HI");

    session.set_chat_template("{% for m in messages[1:] %}{{ m['content'] }}{% endfor %}");
    assert!(session
        .chat_template()
        .unwrap()
        .contains("slice(messages, 1)"));
    let prompt = session
        .apply_chat_template(&[message("system", "x"), message("user", "y")], false, Some(""))
        .unwrap();
    assert_eq!(prompt, "y");
}

#[test]
fn metadata_template_takes_precedence() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("chat_template.json"),
        r#"{"chat_template": "file"}"#,
    )
    .unwrap();
    let (tok, detok) = HfTokenizerGraph::pair(word_level_tokenizer());
    let tok = tok.with_runtime_info(CHAT_TEMPLATE_KEY, "metadata");
    let session = TokenizerSession::new(&ctx(), Some(&tok), Some(&detok), Some(dir.path())).unwrap();
    assert_eq!(session.chat_template(), Some("metadata"));
}

#[test]
fn session_from_tokenizer_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tokenizer.json");
    fs::write(&path, common::TOKENIZER_JSON).unwrap();
    let (tok, detok) = HfTokenizerGraph::from_file(&path).unwrap();
    let session = TokenizerSession::new(&ctx(), Some(&tok), Some(&detok), Some(dir.path())).unwrap();
    assert_eq!(
        ids(&session, "hello", &EncodeOptions::default()),
        vec![vec![1, 4, 2]]
    );
}
