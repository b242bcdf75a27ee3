//! Special token ids and strings, resolved from graph metadata and the
//! HuggingFace config files next to a tokenizer.

use std::{collections::HashMap, path::Path};

use either::Either;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::{backend::RuntimeInfo, utils::json::read_json_file};

/// Id returned by accessors for a token that could not be resolved.
pub const UNKNOWN_TOKEN_ID: i64 = -1;

pub const PAD_TOKEN_ID_KEY: &str = "pad_token_id";
pub const BOS_TOKEN_ID_KEY: &str = "bos_token_id";
pub const EOS_TOKEN_ID_KEY: &str = "eos_token_id";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpecialTokens {
    pub pad_token_id: Option<i64>,
    pub bos_token_id: Option<i64>,
    pub eos_token_id: Option<i64>,
    pub pad_token: Option<String>,
    pub bos_token: Option<String>,
    pub eos_token: Option<String>,
}

/// A source of special tokens tried after the ones before it.
///
/// Gets the tokens resolved so far and returns whatever it can add.
type Resolver = fn(&Path, &SpecialTokens) -> Option<SpecialTokens>;

const CONFIG_RESOLVERS: [(&str, Resolver); 3] = [
    ("config.json", from_model_config),
    ("special_tokens_map.json", from_special_tokens_map),
    ("tokenizer_config.json", from_tokenizer_config),
];

impl SpecialTokens {
    pub fn ids_complete(&self) -> bool {
        self.pad_token_id.is_some() && self.bos_token_id.is_some() && self.eos_token_id.is_some()
    }

    pub fn strings_complete(&self) -> bool {
        self.pad_token.is_some() && self.bos_token.is_some() && self.eos_token.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.ids_complete() && self.strings_complete()
    }

    /// Take every field of `other` that is still unknown here.
    pub fn fill_from(&mut self, other: SpecialTokens) {
        fn fill<T>(slot: &mut Option<T>, value: Option<T>) {
            if slot.is_none() {
                *slot = value;
            }
        }
        fill(&mut self.pad_token_id, other.pad_token_id);
        fill(&mut self.bos_token_id, other.bos_token_id);
        fill(&mut self.eos_token_id, other.eos_token_id);
        fill(&mut self.pad_token, other.pad_token);
        fill(&mut self.bos_token, other.bos_token);
        fill(&mut self.eos_token, other.eos_token);
    }

    /// Many models ship without a pad token and pad with eos.
    pub fn apply_pad_fallback(&mut self) {
        if self.pad_token_id.is_none() {
            self.pad_token_id = self.eos_token_id;
        }
        if self.pad_token.is_none() {
            self.pad_token = self.eos_token.clone();
        }
    }

    /// Ids stored in graph metadata. Negative ids mean unknown.
    pub fn from_runtime_info(info: &RuntimeInfo) -> Self {
        let id = |key| info.get_i64(key).filter(|id| *id >= 0);
        Self {
            pad_token_id: id(PAD_TOKEN_ID_KEY),
            bos_token_id: id(BOS_TOKEN_ID_KEY),
            eos_token_id: id(EOS_TOKEN_ID_KEY),
            ..Default::default()
        }
    }

    /// Run the config file resolvers in order, stopping once everything is known.
    pub fn resolve_from_dir(&mut self, dir: &Path) {
        for (file, resolver) in CONFIG_RESOLVERS {
            if self.is_complete() {
                return;
            }
            if let Some(found) = resolver(&dir.join(file), self) {
                debug!("Special tokens from `{file}`: {found:?}");
                self.fill_from(found);
            }
        }
    }
}

/// `config.json`: ids, where `eos_token_id` may be a list (the first entry is used).
fn from_model_config(path: &Path, resolved: &SpecialTokens) -> Option<SpecialTokens> {
    if resolved.ids_complete() {
        return None;
    }
    let config = read_json_file(path)?;
    let id = |key: &str| match config.get(key)? {
        Value::Array(ids) => ids.first().and_then(Value::as_i64),
        other => other.as_i64(),
    };
    Some(SpecialTokens {
        pad_token_id: id(PAD_TOKEN_ID_KEY),
        bos_token_id: id(BOS_TOKEN_ID_KEY),
        eos_token_id: id(EOS_TOKEN_ID_KEY),
        ..Default::default()
    })
}

/// An added token either spelled out or described by an object with `content`.
#[derive(Deserialize)]
struct AddedTokenContent {
    content: String,
}

#[derive(Deserialize)]
struct TokenRepr(#[serde(with = "either::serde_untagged")] Either<String, AddedTokenContent>);

impl TokenRepr {
    fn into_content(self) -> String {
        match self.0 {
            Either::Left(s) => s,
            Either::Right(t) => t.content,
        }
    }
}

#[derive(Deserialize, Default)]
struct SpecialTokenStrings {
    pad_token: Option<TokenRepr>,
    bos_token: Option<TokenRepr>,
    eos_token: Option<TokenRepr>,
}

impl SpecialTokenStrings {
    fn from_value(value: Value) -> Self {
        serde_json::from_value(value).unwrap_or_default()
    }

    fn into_tokens(self) -> SpecialTokens {
        SpecialTokens {
            pad_token: self.pad_token.map(TokenRepr::into_content),
            bos_token: self.bos_token.map(TokenRepr::into_content),
            eos_token: self.eos_token.map(TokenRepr::into_content),
            ..Default::default()
        }
    }
}

/// `special_tokens_map.json`: strings only.
fn from_special_tokens_map(path: &Path, resolved: &SpecialTokens) -> Option<SpecialTokens> {
    if resolved.strings_complete() {
        return None;
    }
    let map = read_json_file(path)?;
    Some(SpecialTokenStrings::from_value(map).into_tokens())
}

/// `tokenizer_config.json`: strings, then ids by matching strings against
/// `added_tokens_decoder`.
fn from_tokenizer_config(path: &Path, resolved: &SpecialTokens) -> Option<SpecialTokens> {
    let config = read_json_file(path)?;
    let mut found = SpecialTokenStrings::from_value(config.clone()).into_tokens();
    if found.pad_token.is_none() {
        found.pad_token = found.eos_token.clone();
    }

    let mut known = resolved.clone();
    known.fill_from(found.clone());
    if known.ids_complete() {
        return Some(found);
    }

    let decoder = config
        .get("added_tokens_decoder")
        .cloned()
        .and_then(|v| serde_json::from_value::<HashMap<String, AddedTokenContent>>(v).ok())
        .unwrap_or_default();
    let id_of = |token: &Option<String>| {
        let token = token.as_deref()?;
        decoder
            .iter()
            .find(|(_, added)| added.content == token)
            .and_then(|(id, _)| id.parse::<i64>().ok())
    };
    found.pad_token_id = id_of(&known.pad_token);
    found.bos_token_id = id_of(&known.bos_token);
    found.eos_token_id = id_of(&known.eos_token);
    if found.pad_token_id.is_none() {
        found.pad_token_id = found.eos_token_id.or(known.eos_token_id);
    }
    Some(found)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn write(dir: &Path, file: &str, contents: &str) {
        fs::write(dir.join(file), contents).unwrap();
    }

    #[test]
    fn metadata_ids_win_over_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "config.json", r#"{"eos_token_id": 7, "bos_token_id": 6}"#);
        let mut info = RuntimeInfo::new();
        info.insert(EOS_TOKEN_ID_KEY, 2);
        info.insert(PAD_TOKEN_ID_KEY, -1);

        let mut tokens = SpecialTokens::from_runtime_info(&info);
        assert_eq!(tokens.pad_token_id, None);
        tokens.resolve_from_dir(dir.path());
        assert_eq!(tokens.eos_token_id, Some(2));
        assert_eq!(tokens.bos_token_id, Some(6));
    }

    #[test]
    fn config_ids_win_over_tokenizer_config() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "config.json", r#"{"eos_token_id": 2}"#);
        write(
            dir.path(),
            "tokenizer_config.json",
            r#"{
                "bos_token": "<s>",
                "eos_token": "</s>",
                "added_tokens_decoder": {
                    "1": {"content": "<s>", "special": true},
                    "9": {"content": "</s>", "special": true}
                }
            }"#,
        );
        let mut tokens = SpecialTokens::default();
        tokens.resolve_from_dir(dir.path());
        assert_eq!(tokens.eos_token_id, Some(2));
        assert_eq!(tokens.eos_token.as_deref(), Some("</s>"));
        // Gaps left by config.json are still filled further down the chain.
        assert_eq!(tokens.bos_token_id, Some(1));
    }

    #[test]
    fn eos_list_uses_first_entry() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "config.json", r#"{"eos_token_id": [11, 12], "pad_token_id": null}"#);
        let mut tokens = SpecialTokens::default();
        tokens.resolve_from_dir(dir.path());
        assert_eq!(tokens.eos_token_id, Some(11));
        assert_eq!(tokens.pad_token_id, None);
    }

    #[test]
    fn strings_accept_plain_and_object_forms() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "special_tokens_map.json",
            r#"{"bos_token": "<s>", "eos_token": {"content": "</s>", "lstrip": false}}"#,
        );
        let mut tokens = SpecialTokens::default();
        tokens.resolve_from_dir(dir.path());
        assert_eq!(tokens.bos_token.as_deref(), Some("<s>"));
        assert_eq!(tokens.eos_token.as_deref(), Some("</s>"));
        assert_eq!(tokens.pad_token, None);
    }

    #[test]
    fn added_tokens_decoder_supplies_ids() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "tokenizer_config.json",
            r#"{
                "bos_token": "<s>",
                "eos_token": "</s>",
                "added_tokens_decoder": {
                    "1": {"content": "<s>", "special": true},
                    "2": {"content": "</s>", "special": true}
                }
            }"#,
        );
        let mut tokens = SpecialTokens::default();
        tokens.resolve_from_dir(dir.path());
        assert_eq!(tokens.bos_token_id, Some(1));
        assert_eq!(tokens.eos_token_id, Some(2));
        // Pad falls back to eos in both forms.
        assert_eq!(tokens.pad_token_id, Some(2));
        assert_eq!(tokens.pad_token.as_deref(), Some("</s>"));
    }

    #[test]
    fn missing_and_malformed_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "config.json", "{ not json");
        let mut tokens = SpecialTokens::default();
        tokens.resolve_from_dir(dir.path());
        assert_eq!(tokens, SpecialTokens::default());
    }

    #[test]
    fn pad_fallback_only_fills_gaps() {
        let mut tokens = SpecialTokens {
            pad_token_id: Some(0),
            eos_token_id: Some(2),
            eos_token: Some("</s>".to_string()),
            ..Default::default()
        };
        tokens.apply_pad_fallback();
        assert_eq!(tokens.pad_token_id, Some(0));
        assert_eq!(tokens.pad_token.as_deref(), Some("</s>"));
    }
}
