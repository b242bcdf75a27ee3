use std::{collections::HashMap, path::Path};

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    backend::{Backend, BackendContext, TensorValue, TokenizerGraph, TOKENIZERS_VERSION_KEY},
    chat_template::{
        apply_chat_template_to, remap_and_patch, resolve_chat_template, ChatMessage,
        ChatTemplateError,
    },
    hf_backend::{
        ATTENTION_MASK, INPUT_IDS, SEQUENCE_LENGTHS_INPUT, STRING_OUTPUT, TOKEN_TYPE_IDS,
    },
    options::{DecodeOptions, EncodeOptions, RequestFlags},
    pool::{PooledRequest, RequestPool},
    special_tokens::{SpecialTokens, UNKNOWN_TOKEN_ID},
    utils::log::once_log_info,
};

const WARMUP_TEXT: &str = "non empty string";
const WARMUP_TOKENS: [i64; 5] = [1, 33, 199, 42, 42];

#[derive(Error, Debug)]
pub enum TokenizerError {
    #[error("Neither a tokenizer nor a detokenizer graph was provided.")]
    NoGraphs,
    #[error("This session has no tokenizer graph, so it cannot encode.")]
    EncoderUnavailable,
    #[error("This session has no detokenizer graph, so it cannot decode.")]
    DecoderUnavailable,
    #[error(
        "Paired inputs need the same number of texts on both sides, or a single text on one \
         side; got {0} and {1}."
    )]
    PairLengthMismatch(usize, usize),
    #[error("Token ids must be a rank 2 I64 tensor, got {dtype:?} with shape {shape:?}.")]
    InvalidTokenTensor { dtype: DType, shape: Vec<usize> },
    #[error("`max_length` {0} does not fit in a 32-bit state value.")]
    MaxLengthOverflow(usize),
    #[error("The detokenizer graph does not carry a vocabulary.")]
    EmptyVocab,
    #[error("Backend output `{0}` is missing or has an unexpected type.")]
    BadOutput(&'static str),
}

/// What [`TokenizerSession::encode`] accepts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EncodeInput {
    Single(String),
    Batch(Vec<String>),
    /// Two parallel lists of texts; either side may hold a single text that pairs with every row.
    Paired(Vec<String>, Vec<String>),
}

impl From<&str> for EncodeInput {
    fn from(text: &str) -> Self {
        Self::Single(text.to_string())
    }
}

impl From<String> for EncodeInput {
    fn from(text: String) -> Self {
        Self::Single(text)
    }
}

impl From<Vec<String>> for EncodeInput {
    fn from(texts: Vec<String>) -> Self {
        Self::Batch(texts)
    }
}

impl From<&[&str]> for EncodeInput {
    fn from(texts: &[&str]) -> Self {
        Self::Batch(texts.iter().map(|t| t.to_string()).collect())
    }
}

impl From<(Vec<String>, Vec<String>)> for EncodeInput {
    fn from((first, second): (Vec<String>, Vec<String>)) -> Self {
        Self::Paired(first, second)
    }
}

impl From<Vec<(String, String)>> for EncodeInput {
    fn from(pairs: Vec<(String, String)>) -> Self {
        let (first, second) = pairs.into_iter().unzip();
        Self::Paired(first, second)
    }
}

#[derive(Clone, Debug)]
pub struct TokenizedInputs {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
    /// Only produced for paired inputs.
    pub token_type_ids: Option<Tensor>,
}

/// A compiled tokenizer and/or detokenizer with pools of reusable requests.
///
/// `encode` and `decode` may be called concurrently from many threads; each call
/// holds one pooled request for its duration.
pub struct TokenizerSession {
    encoder: Option<RequestPool>,
    decoder: Option<RequestPool>,
    /// Graphs without runtime flag support ignore per-call options.
    legacy_flags: bool,
    special_tokens: SpecialTokens,
    chat_template: Option<String>,
    vocab: Vec<String>,
}

impl TokenizerSession {
    /// Compile the given graphs and resolve special tokens and the chat template.
    ///
    /// `config_dir` is the HuggingFace model directory, if any; its files fill in
    /// whatever the graph metadata leaves unknown.
    pub fn new<B: Backend>(
        ctx: &BackendContext<B>,
        tokenizer: Option<&B::Graph>,
        detokenizer: Option<&B::Graph>,
        config_dir: Option<&Path>,
    ) -> Result<Self> {
        let graphs = [tokenizer, detokenizer]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>();
        let Some(primary) = graphs.first() else {
            return Err(TokenizerError::NoGraphs.into());
        };
        let legacy_flags = !primary.runtime_info().contains(TOKENIZERS_VERSION_KEY);
        if legacy_flags {
            once_log_info(
                "Tokenizer graphs predate runtime flags; encode/decode options will be ignored.",
            );
        }

        let mut special_tokens = SpecialTokens::default();
        for graph in &graphs {
            special_tokens.fill_from(SpecialTokens::from_runtime_info(graph.runtime_info()));
        }
        if let Some(dir) = config_dir {
            special_tokens.resolve_from_dir(dir);
        }
        special_tokens.apply_pad_fallback();

        let infos = graphs.iter().map(|g| g.runtime_info()).collect::<Vec<_>>();
        let chat_template = resolve_chat_template(&infos, config_dir);

        let mut session = Self {
            encoder: None,
            decoder: None,
            legacy_flags,
            special_tokens,
            chat_template,
            vocab: Vec::new(),
        };

        if let Some(graph) = tokenizer {
            let compiled = ctx.compile(graph)?;
            session.encoder = Some(RequestPool::new("tokenizer", compiled.as_ref())?);
            session.encode(WARMUP_TEXT, &EncodeOptions::default())?;
        }
        if let Some(graph) = detokenizer {
            let compiled = ctx.compile(graph)?;
            session.decoder = Some(RequestPool::new("detokenizer", compiled.as_ref())?);
            session.decode(&WARMUP_TOKENS, &DecodeOptions::default())?;
            session.vocab = graph.vocab().unwrap_or_default();
        }

        session.infer_special_token_ids()?;
        session.infer_special_token_strings()?;
        session.special_tokens.apply_pad_fallback();

        info!(
            "Tokenizer session ready on `{}`: {} encode / {} decode requests, bos = {:?}, eos = {:?}, pad = {:?}.",
            ctx.backend().name(),
            session.encoder.as_ref().map_or(0, RequestPool::capacity),
            session.decoder.as_ref().map_or(0, RequestPool::capacity),
            session.special_tokens.bos_token,
            session.special_tokens.eos_token,
            session.special_tokens.pad_token,
        );
        Ok(session)
    }

    /// Ids still unknown are looked up by encoding their string form.
    fn infer_special_token_ids(&mut self) -> Result<()> {
        if self.encoder.is_none() || self.special_tokens.ids_complete() {
            return Ok(());
        }
        let opts = EncodeOptions::new().with_add_special_tokens(false);
        let lookup = |token: &Option<String>| -> Result<Option<i64>> {
            let Some(token) = token.as_deref() else {
                return Ok(None);
            };
            let ids = self.encode(token, &opts)?.input_ids.to_vec2::<i64>()?;
            Ok(ids.first().and_then(|row| row.last()).copied())
        };

        let tokens = &self.special_tokens;
        let pad = match tokens.pad_token_id {
            Some(id) => Some(id),
            None => lookup(&tokens.pad_token)?,
        };
        let bos = match tokens.bos_token_id {
            Some(id) => Some(id),
            None => lookup(&tokens.bos_token)?,
        };
        let eos = match tokens.eos_token_id {
            Some(id) => Some(id),
            None => lookup(&tokens.eos_token)?,
        };
        self.special_tokens.pad_token_id = pad;
        self.special_tokens.bos_token_id = bos;
        self.special_tokens.eos_token_id = eos;
        self.special_tokens.apply_pad_fallback();
        Ok(())
    }

    /// Strings still unknown are recovered by decoding their ids.
    fn infer_special_token_strings(&mut self) -> Result<()> {
        if self.decoder.is_none() || self.special_tokens.strings_complete() {
            return Ok(());
        }
        let opts = DecodeOptions::new().with_skip_special_tokens(false);
        let lookup = |id: Option<i64>, known: &Option<String>| -> Result<Option<String>> {
            match (known, id) {
                (Some(known), _) => Ok(Some(known.clone())),
                (None, Some(id)) => Ok(Some(self.decode(&[id], &opts)?).filter(|s| !s.is_empty())),
                (None, None) => Ok(None),
            }
        };

        let tokens = &self.special_tokens;
        let pad = lookup(tokens.pad_token_id, &tokens.pad_token)?;
        let bos = lookup(tokens.bos_token_id, &tokens.bos_token)?;
        let eos = lookup(tokens.eos_token_id, &tokens.eos_token)?;
        self.special_tokens.pad_token = pad;
        self.special_tokens.bos_token = bos;
        self.special_tokens.eos_token = eos;
        Ok(())
    }

    fn sync_flags(&self, request: &mut PooledRequest<'_>, flags: &dyn RequestFlags) -> Result<()> {
        if self.legacy_flags {
            return Ok(());
        }
        let managed = &mut **request;
        managed.flags.sync(managed.request.as_mut(), flags)
    }

    pub fn encode(
        &self,
        input: impl Into<EncodeInput>,
        options: &EncodeOptions,
    ) -> Result<TokenizedInputs> {
        let pool = self
            .encoder
            .as_ref()
            .ok_or(TokenizerError::EncoderUnavailable)?;
        let input = input.into();
        let (first, second) = match input {
            EncodeInput::Single(text) => (vec![text], None),
            EncodeInput::Batch(texts) => (texts, None),
            EncodeInput::Paired(first, second) => {
                let (a, b) = (first.len(), second.len());
                if a != b && a != 1 && b != 1 {
                    return Err(TokenizerError::PairLengthMismatch(a, b).into());
                }
                (first, Some(second))
            }
        };
        let paired = second.is_some();

        let mut request = pool.acquire();
        self.sync_flags(&mut request, options)?;
        request.request.set_input(0, TensorValue::Strings(first))?;
        if pool.input_count() > 1 {
            request
                .request
                .set_input(1, TensorValue::Strings(second.unwrap_or_default()))?;
        }
        request.request.infer()?;

        let tensor = |name: &'static str| -> Result<Tensor> {
            let value = request.request.output(name)?;
            Ok(value
                .into_tensor()
                .map_err(|_| TokenizerError::BadOutput(name))?)
        };
        let token_type_ids = if paired && pool.has_output(TOKEN_TYPE_IDS) {
            Some(tensor(TOKEN_TYPE_IDS)?)
        } else {
            None
        };
        Ok(TokenizedInputs {
            input_ids: tensor(INPUT_IDS)?,
            attention_mask: tensor(ATTENTION_MASK)?,
            token_type_ids,
        })
    }

    pub fn decode(&self, tokens: &[i64], options: &DecodeOptions) -> Result<String> {
        let tokens = Tensor::from_slice(tokens, (1, tokens.len()), &Device::Cpu)?;
        self.decode_tensor(&tokens, options)?
            .into_iter()
            .next()
            .ok_or_else(|| TokenizerError::BadOutput(STRING_OUTPUT).into())
    }

    /// Decode a `[batch, seq]` `I64` tensor, one string per row.
    pub fn decode_tensor(&self, tokens: &Tensor, options: &DecodeOptions) -> Result<Vec<String>> {
        self.decode_rows(tokens, None, options)
    }

    /// `lengths`, when the detokenizer accepts it, bounds how much of each row is decoded.
    fn decode_rows(
        &self,
        tokens: &Tensor,
        lengths: Option<Tensor>,
        options: &DecodeOptions,
    ) -> Result<Vec<String>> {
        let pool = self
            .decoder
            .as_ref()
            .ok_or(TokenizerError::DecoderUnavailable)?;
        if tokens.dtype() != DType::I64 || tokens.rank() != 2 {
            return Err(TokenizerError::InvalidTokenTensor {
                dtype: tokens.dtype(),
                shape: tokens.dims().to_vec(),
            }
            .into());
        }

        let mut request = pool.acquire();
        self.sync_flags(&mut request, options)?;
        request
            .request
            .set_input(0, TensorValue::Tensor(tokens.clone()))?;
        if let Some(lengths) = lengths.filter(|_| pool.input_count() > SEQUENCE_LENGTHS_INPUT) {
            request
                .request
                .set_input(SEQUENCE_LENGTHS_INPUT, TensorValue::Tensor(lengths))?;
        }
        request.request.infer()?;
        Ok(request
            .request
            .output(STRING_OUTPUT)?
            .into_strings()
            .map_err(|_| TokenizerError::BadOutput(STRING_OUTPUT))?)
    }

    /// Decode rows of different lengths in one call.
    ///
    /// Rows are right-padded with the pad id and sent with their own lengths, so each
    /// string matches what [`Self::decode`] gives for that row alone.
    pub fn decode_batch(&self, lines: &[Vec<i64>], options: &DecodeOptions) -> Result<Vec<String>> {
        let width = lines.iter().map(Vec::len).max().unwrap_or(0);
        let pad = self.pad_token_id();
        let mut flat = Vec::with_capacity(lines.len() * width);
        for line in lines {
            flat.extend_from_slice(line);
            flat.extend(std::iter::repeat(pad).take(width - line.len()));
        }
        let tokens = Tensor::from_vec(flat, (lines.len(), width), &Device::Cpu)?;
        let lengths = lines.iter().map(|l| l.len() as i64).collect::<Vec<_>>();
        let lengths = Tensor::from_vec(lengths, lines.len(), &Device::Cpu)?;
        self.decode_rows(&tokens, Some(lengths), options)
    }

    /// Render `history` into a prompt.
    ///
    /// A non-empty `chat_template` overrides the session's template for this call
    /// and goes through the same remapping and patching.
    pub fn apply_chat_template(
        &self,
        history: &[ChatMessage],
        add_generation_prompt: bool,
        chat_template: Option<&str>,
    ) -> Result<String> {
        let overridden = chat_template
            .filter(|t| !t.is_empty())
            .map(remap_and_patch);
        let template = overridden
            .as_deref()
            .or(self.chat_template.as_deref())
            .ok_or(ChatTemplateError::Missing)?;
        Ok(apply_chat_template_to(
            history,
            add_generation_prompt,
            template,
            &self.special_tokens,
        )?)
    }

    pub fn chat_template(&self) -> Option<&str> {
        self.chat_template.as_deref()
    }

    /// Replace the session's chat template. The template is remapped and patched first.
    pub fn set_chat_template(&mut self, chat_template: &str) {
        if chat_template.is_empty() {
            warn!("Ignoring an empty chat template.");
            return;
        }
        debug!("Chat template replaced.");
        self.chat_template = Some(remap_and_patch(chat_template));
    }

    pub fn special_tokens(&self) -> &SpecialTokens {
        &self.special_tokens
    }

    /// [`UNKNOWN_TOKEN_ID`] when unresolved.
    pub fn pad_token_id(&self) -> i64 {
        self.special_tokens.pad_token_id.unwrap_or(UNKNOWN_TOKEN_ID)
    }

    /// [`UNKNOWN_TOKEN_ID`] when unresolved.
    pub fn bos_token_id(&self) -> i64 {
        self.special_tokens.bos_token_id.unwrap_or(UNKNOWN_TOKEN_ID)
    }

    /// [`UNKNOWN_TOKEN_ID`] when unresolved.
    pub fn eos_token_id(&self) -> i64 {
        self.special_tokens.eos_token_id.unwrap_or(UNKNOWN_TOKEN_ID)
    }

    /// Empty when unresolved.
    pub fn pad_token(&self) -> &str {
        self.special_tokens.pad_token.as_deref().unwrap_or_default()
    }

    pub fn bos_token(&self) -> &str {
        self.special_tokens.bos_token.as_deref().unwrap_or_default()
    }

    pub fn eos_token(&self) -> &str {
        self.special_tokens.eos_token.as_deref().unwrap_or_default()
    }

    /// Token strings indexed by id, from the detokenizer graph.
    pub fn vocab(&self) -> Result<&[String]> {
        if self.vocab.is_empty() {
            return Err(TokenizerError::EmptyVocab.into());
        }
        Ok(&self.vocab)
    }

    pub fn vocab_map(&self) -> Result<HashMap<String, i64>> {
        Ok(self
            .vocab()?
            .iter()
            .enumerate()
            .map(|(id, token)| (token.clone(), id as i64))
            .collect())
    }

    pub fn has_encoder(&self) -> bool {
        self.encoder.is_some()
    }

    pub fn has_decoder(&self) -> bool {
        self.decoder.is_some()
    }

    /// Number of pooled requests per direction, `(encode, decode)`.
    pub fn pool_sizes(&self) -> (usize, usize) {
        (
            self.encoder.as_ref().map_or(0, RequestPool::capacity),
            self.decoder.as_ref().map_or(0, RequestPool::capacity),
        )
    }
}
