//! A [`Backend`] that runs tokenization with the HuggingFace `tokenizers` crate.
//!
//! A `tokenizer.json` yields two graphs: one that encodes string batches into
//! `input_ids` / `attention_mask` (plus `token_type_ids` for pairs), and one that
//! decodes `I64` id batches back into strings. The detokenizer takes an optional
//! second input with the length of each row, and ignores ids past that length.
//! Requests expose the usual runtime flags as state variables.

use std::{collections::HashMap, path::Path, sync::Arc, thread};

use anyhow::{anyhow, bail, Result};
use candle_core::{DType, Device, Tensor};
use serde::Deserialize;
use serde_json::Value;
use tokenizers::Tokenizer;

use crate::{
    backend::{
        Backend, CompileOptions, CompiledModel, InferRequest, RuntimeInfo, StateValue,
        TensorValue, TokenizerGraph, TOKENIZERS_VERSION_KEY,
    },
    options::{
        ADD_SPECIAL_TOKENS, IS_MAX_LENGTH_SET, MAX_LENGTH, PAD_TO_MAX_LENGTH, SKIP_SPECIAL_TOKENS,
    },
    special_tokens::PAD_TOKEN_ID_KEY,
};

pub const INPUT_IDS: &str = "input_ids";
pub const ATTENTION_MASK: &str = "attention_mask";
pub const TOKEN_TYPE_IDS: &str = "token_type_ids";
pub const STRING_OUTPUT: &str = "string_output";
/// Detokenizer input index of the per-row `I64` lengths.
pub const SEQUENCE_LENGTHS_INPUT: usize = 1;

const ENCODER_STATES: [(&str, StateValue); 4] = [
    (ADD_SPECIAL_TOKENS, StateValue::Bool(true)),
    (MAX_LENGTH, StateValue::I32(-1)),
    (PAD_TO_MAX_LENGTH, StateValue::Bool(false)),
    (IS_MAX_LENGTH_SET, StateValue::Bool(false)),
];
const DECODER_STATES: [(&str, StateValue); 1] = [(SKIP_SPECIAL_TOKENS, StateValue::Bool(true))];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GraphKind {
    Tokenizer,
    Detokenizer,
}

impl GraphKind {
    fn states(self) -> &'static [(&'static str, StateValue)] {
        match self {
            Self::Tokenizer => &ENCODER_STATES,
            Self::Detokenizer => &DECODER_STATES,
        }
    }
}

#[derive(Clone)]
pub struct HfTokenizerGraph {
    tokenizer: Arc<Tokenizer>,
    kind: GraphKind,
    runtime_info: RuntimeInfo,
}

impl HfTokenizerGraph {
    pub fn new(tokenizer: Arc<Tokenizer>, kind: GraphKind) -> Self {
        let mut runtime_info = RuntimeInfo::new();
        runtime_info.insert(TOKENIZERS_VERSION_KEY, env!("CARGO_PKG_VERSION"));
        if let Some(padding) = tokenizer.get_padding() {
            runtime_info.insert(PAD_TOKEN_ID_KEY, padding.pad_id);
        }
        Self {
            tokenizer,
            kind,
            runtime_info,
        }
    }

    /// A tokenizer/detokenizer pair sharing one `tokenizer.json`.
    pub fn pair(tokenizer: Tokenizer) -> (Self, Self) {
        let tokenizer = Arc::new(tokenizer);
        (
            Self::new(tokenizer.clone(), GraphKind::Tokenizer),
            Self::new(tokenizer, GraphKind::Detokenizer),
        )
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<(Self, Self)> {
        Ok(Self::pair(load_tokenizer(path)?))
    }

    pub fn kind(&self) -> GraphKind {
        self.kind
    }

    pub fn runtime_info_mut(&mut self) -> &mut RuntimeInfo {
        &mut self.runtime_info
    }

    pub fn with_runtime_info(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.runtime_info.insert(key, value);
        self
    }

    fn pad_token_id(&self) -> Option<i64> {
        self.runtime_info.get_i64(PAD_TOKEN_ID_KEY)
    }
}

impl TokenizerGraph for HfTokenizerGraph {
    fn runtime_info(&self) -> &RuntimeInfo {
        &self.runtime_info
    }

    fn vocab(&self) -> Option<Vec<String>> {
        let vocab = self.tokenizer.get_vocab(true);
        let len = vocab.values().max().map_or(0, |max| *max as usize + 1);
        let mut by_id = vec![String::new(); len];
        for (token, id) in vocab {
            by_id[id as usize] = token;
        }
        Some(by_id)
    }
}

#[derive(Deserialize)]
struct AddedToken {
    id: usize,
    content: String,
}

/// Load a `tokenizer.json`, making sure every added token is also part of the model vocab.
pub fn load_tokenizer(path: impl AsRef<Path>) -> Result<Tokenizer> {
    let raw = std::fs::read(path.as_ref()).map_err(anyhow::Error::msg)?;
    let mut tokenizer: Value = serde_json::from_slice(&raw)?;
    let added_tokens: Vec<AddedToken> =
        serde_json::from_value(tokenizer["added_tokens"].clone()).unwrap_or_default();
    if let Some(vocab) = tokenizer["model"]["vocab"].as_object_mut() {
        for token in added_tokens {
            if !vocab.contains_key(&token.content) {
                vocab.insert(token.content, token.id.into());
            }
        }
    }
    let raw_fixed = serde_json::to_vec(&tokenizer)?;
    Tokenizer::from_bytes(&raw_fixed).map_err(anyhow::Error::msg)
}

#[derive(Clone, Copy, Debug, Default)]
pub struct HfTokenizersBackend;

impl Backend for HfTokenizersBackend {
    type Graph = HfTokenizerGraph;

    fn name(&self) -> &str {
        "hf-tokenizers"
    }

    fn compile(
        &self,
        graph: &HfTokenizerGraph,
        device: &Device,
        options: &CompileOptions,
    ) -> Result<Box<dyn CompiledModel>> {
        let concurrency = match options.concurrency {
            Some(n) => n.get(),
            None => thread::available_parallelism().map_or(1, |n| n.get()),
        };
        Ok(Box::new(HfCompiledModel {
            tokenizer: graph.tokenizer.clone(),
            kind: graph.kind,
            pad_token_id: graph.pad_token_id(),
            device: device.clone(),
            concurrency,
        }))
    }
}

struct HfCompiledModel {
    tokenizer: Arc<Tokenizer>,
    kind: GraphKind,
    pad_token_id: Option<i64>,
    device: Device,
    concurrency: usize,
}

impl CompiledModel for HfCompiledModel {
    fn optimal_concurrency(&self) -> usize {
        self.concurrency
    }

    fn create_request(&self) -> Result<Box<dyn InferRequest>> {
        Ok(Box::new(HfInferRequest {
            tokenizer: self.tokenizer.clone(),
            kind: self.kind,
            pad_token_id: self.pad_token_id,
            device: self.device.clone(),
            inputs: Vec::new(),
            outputs: HashMap::new(),
            states: self.kind.states().iter().copied().collect(),
        }))
    }

    fn input_count(&self) -> usize {
        match self.kind {
            GraphKind::Tokenizer | GraphKind::Detokenizer => 2,
        }
    }

    fn output_names(&self) -> Vec<String> {
        let names: &[&str] = match self.kind {
            GraphKind::Tokenizer => &[INPUT_IDS, ATTENTION_MASK, TOKEN_TYPE_IDS],
            GraphKind::Detokenizer => &[STRING_OUTPUT],
        };
        names.iter().map(|n| n.to_string()).collect()
    }
}

struct HfInferRequest {
    tokenizer: Arc<Tokenizer>,
    kind: GraphKind,
    pad_token_id: Option<i64>,
    device: Device,
    inputs: Vec<Option<TensorValue>>,
    outputs: HashMap<&'static str, TensorValue>,
    states: HashMap<&'static str, StateValue>,
}

impl HfInferRequest {
    fn bool_state(&self, name: &str) -> bool {
        matches!(self.states.get(name), Some(StateValue::Bool(true)))
    }

    fn max_length(&self) -> Option<usize> {
        if !self.bool_state(IS_MAX_LENGTH_SET) {
            return None;
        }
        match self.states.get(MAX_LENGTH) {
            Some(StateValue::I32(len)) => usize::try_from(*len).ok(),
            _ => None,
        }
    }

    fn string_input(&self, index: usize) -> Result<Vec<String>> {
        match self.inputs.get(index) {
            Some(Some(value)) => Ok(value.clone().into_strings()?),
            _ => Ok(Vec::new()),
        }
    }

    fn encode(&mut self) -> Result<()> {
        let first = self.string_input(0)?;
        let second = self.string_input(1)?;
        let add_special_tokens = self.bool_state(ADD_SPECIAL_TOKENS);
        let paired = !second.is_empty();

        let encodings = if paired {
            let rows = first.len().max(second.len());
            let pick = |side: &[String], i: usize| {
                let idx = if side.len() == 1 { 0 } else { i };
                side.get(idx).cloned().ok_or_else(|| {
                    anyhow!(
                        "Cannot pair {} texts with {} texts.",
                        first.len(),
                        second.len()
                    )
                })
            };
            let pairs = (0..rows)
                .map(|i| Ok((pick(&first, i)?, pick(&second, i)?)))
                .collect::<Result<Vec<_>>>()?;
            self.tokenizer
                .encode_batch(pairs, add_special_tokens)
                .map_err(anyhow::Error::msg)?
        } else {
            self.tokenizer
                .encode_batch(first, add_special_tokens)
                .map_err(anyhow::Error::msg)?
        };

        let max_length = self.max_length();
        let longest = encodings
            .iter()
            .map(|e| max_length.map_or(e.len(), |max| e.len().min(max)))
            .max()
            .unwrap_or(0);
        let width = match max_length {
            Some(max) if self.bool_state(PAD_TO_MAX_LENGTH) => max,
            _ => longest,
        };
        let pad_id = self.pad_token_id.unwrap_or(0);

        let rows = encodings.len();
        let mut ids = Vec::with_capacity(rows * width);
        let mut mask = Vec::with_capacity(rows * width);
        let mut type_ids = Vec::with_capacity(rows * width);
        for encoding in &encodings {
            push_row(&mut ids, encoding.get_ids(), width, pad_id);
            push_row(&mut mask, encoding.get_attention_mask(), width, 0);
            push_row(&mut type_ids, encoding.get_type_ids(), width, 0);
        }

        self.outputs.clear();
        let tensor = |data: Vec<i64>| Tensor::from_vec(data, (rows, width), &self.device);
        self.outputs
            .insert(INPUT_IDS, TensorValue::Tensor(tensor(ids)?));
        self.outputs
            .insert(ATTENTION_MASK, TensorValue::Tensor(tensor(mask)?));
        if paired {
            self.outputs
                .insert(TOKEN_TYPE_IDS, TensorValue::Tensor(tensor(type_ids)?));
        }
        Ok(())
    }

    fn decode(&mut self) -> Result<()> {
        let tokens = match self.inputs.first() {
            Some(Some(value)) => value.clone().into_tensor()?,
            _ => bail!("Detokenizer input was not set."),
        };
        if tokens.dtype() != DType::I64 {
            bail!("Detokenizer expects I64 ids, got {:?}.", tokens.dtype());
        }
        let rows = tokens.to_vec2::<i64>()?;
        let lengths = match self.inputs.get(SEQUENCE_LENGTHS_INPUT) {
            Some(Some(value)) => {
                let lengths = value.clone().into_tensor()?.to_vec1::<i64>()?;
                if lengths.len() != rows.len() {
                    bail!(
                        "Got {} sequence lengths for {} rows of ids.",
                        lengths.len(),
                        rows.len()
                    );
                }
                Some(lengths)
            }
            _ => None,
        };
        let skip_special_tokens = self.bool_state(SKIP_SPECIAL_TOKENS);

        let mut texts = Vec::with_capacity(rows.len());
        for (i, mut row) in rows.into_iter().enumerate() {
            if let Some(len) = lengths.as_ref().map(|l| l[i]) {
                row.truncate(usize::try_from(len).unwrap_or(0));
            }
            let ids = row
                .into_iter()
                .filter_map(|id| u32::try_from(id).ok())
                .collect::<Vec<_>>();
            texts.push(
                self.tokenizer
                    .decode(&ids, skip_special_tokens)
                    .map_err(anyhow::Error::msg)?,
            );
        }
        self.outputs.clear();
        self.outputs.insert(STRING_OUTPUT, TensorValue::Strings(texts));
        Ok(())
    }
}

/// Append `values` truncated or padded to `width`.
fn push_row(out: &mut Vec<i64>, values: &[u32], width: usize, pad: i64) {
    out.extend(values.iter().take(width).map(|v| i64::from(*v)));
    out.extend(std::iter::repeat(pad).take(width.saturating_sub(values.len())));
}

impl InferRequest for HfInferRequest {
    fn set_input(&mut self, index: usize, value: TensorValue) -> Result<()> {
        if self.inputs.len() <= index {
            self.inputs.resize(index + 1, None);
        }
        self.inputs[index] = Some(value);
        Ok(())
    }

    fn infer(&mut self) -> Result<()> {
        let result = match self.kind {
            GraphKind::Tokenizer => self.encode(),
            GraphKind::Detokenizer => self.decode(),
        };
        self.inputs.clear();
        result
    }

    fn output(&self, name: &str) -> Result<TensorValue> {
        self.outputs
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("No output named `{name}`."))
    }

    fn state_names(&self) -> Vec<String> {
        self.kind
            .states()
            .iter()
            .map(|(name, _)| name.to_string())
            .collect()
    }

    fn set_state(&mut self, name: &str, value: StateValue) -> Result<()> {
        let (key, default) = self
            .kind
            .states()
            .iter()
            .find(|(n, _)| *n == name)
            .ok_or_else(|| anyhow!("Unknown state `{name}`."))?;
        if std::mem::discriminant(default) != std::mem::discriminant(&value) {
            bail!("State `{name}` expects a value like {default:?}, got {value:?}.");
        }
        self.states.insert(*key, value);
        Ok(())
    }

    fn reset_state(&mut self, name: &str) -> Result<()> {
        let (key, default) = self
            .kind
            .states()
            .iter()
            .find(|(n, _)| *n == name)
            .ok_or_else(|| anyhow!("Unknown state `{name}`."))?;
        self.states.insert(*key, *default);
        Ok(())
    }
}
