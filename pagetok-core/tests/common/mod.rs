#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use candle_core::{Device, Tensor};
use pagetok_core::{
    Backend, CompileOptions, CompiledModel, InferRequest, RuntimeInfo, StateValue, TensorValue,
    TokenizerGraph, ADD_SPECIAL_TOKENS, ATTENTION_MASK, INPUT_IDS, IS_MAX_LENGTH_SET, MAX_LENGTH,
    PAD_TO_MAX_LENGTH, SKIP_SPECIAL_TOKENS, STRING_OUTPUT, TOKENIZERS_VERSION_KEY,
};
use tokenizers::Tokenizer;

pub const TOKENIZER_JSON: &str = r#"{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [
    {"id": 0, "content": "<pad>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
    {"id": 1, "content": "<s>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
    {"id": 2, "content": "</s>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
    {"id": 3, "content": "<unk>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}
  ],
  "normalizer": null,
  "pre_tokenizer": {"type": "Whitespace"},
  "post_processor": {
    "type": "TemplateProcessing",
    "single": [
      {"SpecialToken": {"id": "<s>", "type_id": 0}},
      {"Sequence": {"id": "A", "type_id": 0}},
      {"SpecialToken": {"id": "</s>", "type_id": 0}}
    ],
    "pair": [
      {"SpecialToken": {"id": "<s>", "type_id": 0}},
      {"Sequence": {"id": "A", "type_id": 0}},
      {"SpecialToken": {"id": "</s>", "type_id": 0}},
      {"Sequence": {"id": "B", "type_id": 1}},
      {"SpecialToken": {"id": "</s>", "type_id": 1}}
    ],
    "special_tokens": {
      "<s>": {"id": "<s>", "ids": [1], "tokens": ["<s>"]},
      "</s>": {"id": "</s>", "ids": [2], "tokens": ["</s>"]}
    }
  },
  "decoder": null,
  "model": {
    "type": "WordLevel",
    "vocab": {
      "<pad>": 0, "<s>": 1, "</s>": 2, "<unk>": 3,
      "hello": 4, "world": 5, "how": 6, "are": 7, "you": 8,
      "non": 9, "empty": 10, "string": 11
    },
    "unk_token": "<unk>"
  }
}"#;

pub fn word_level_tokenizer() -> Tokenizer {
    Tokenizer::from_bytes(TOKENIZER_JSON.as_bytes()).unwrap()
}

/// Calls observed across every request a [`MockBackend`] created.
#[derive(Default)]
pub struct MockStats {
    pub set_calls: AtomicUsize,
    pub reset_calls: AtomicUsize,
    pub infer_calls: AtomicUsize,
    pub requests_created: AtomicUsize,
    in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
    /// State values seen by the most recent `infer`.
    pub last_states: Mutex<HashMap<String, StateValue>>,
}

impl MockStats {
    pub fn sets(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.reset_calls.load(Ordering::SeqCst)
    }

    pub fn last_state(&self, name: &str) -> Option<StateValue> {
        self.last_states.lock().unwrap().get(name).copied()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum MockKind {
    Encode,
    Decode,
}

pub struct MockGraph {
    kind: MockKind,
    runtime_info: RuntimeInfo,
}

impl MockGraph {
    pub fn new(kind: MockKind) -> Self {
        let mut runtime_info = RuntimeInfo::new();
        runtime_info.insert(TOKENIZERS_VERSION_KEY, "0.1.0");
        Self { kind, runtime_info }
    }

    /// A graph built before runtime flags existed.
    pub fn legacy(kind: MockKind) -> Self {
        Self {
            kind,
            runtime_info: RuntimeInfo::new(),
        }
    }

    pub fn with_runtime_info(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.runtime_info.insert(key, value);
        self
    }
}

impl TokenizerGraph for MockGraph {
    fn runtime_info(&self) -> &RuntimeInfo {
        &self.runtime_info
    }
}

/// Encodes each whitespace-separated word as its length; decodes ids as space-joined numbers.
pub struct MockBackend {
    pub stats: Arc<MockStats>,
    pub concurrency: usize,
    /// Time each `infer` takes.
    pub latency: Duration,
}

impl MockBackend {
    pub fn new(concurrency: usize) -> Self {
        Self {
            stats: Arc::new(MockStats::default()),
            concurrency,
            latency: Duration::ZERO,
        }
    }
}

impl Backend for MockBackend {
    type Graph = MockGraph;

    fn name(&self) -> &str {
        "mock"
    }

    fn compile(
        &self,
        graph: &MockGraph,
        _device: &Device,
        _options: &CompileOptions,
    ) -> Result<Box<dyn CompiledModel>> {
        Ok(Box::new(MockCompiled {
            kind: graph.kind,
            stats: self.stats.clone(),
            concurrency: self.concurrency,
            latency: self.latency,
        }))
    }
}

struct MockCompiled {
    kind: MockKind,
    stats: Arc<MockStats>,
    concurrency: usize,
    latency: Duration,
}

impl CompiledModel for MockCompiled {
    fn optimal_concurrency(&self) -> usize {
        self.concurrency
    }

    fn create_request(&self) -> Result<Box<dyn InferRequest>> {
        self.stats.requests_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockRequest {
            kind: self.kind,
            stats: self.stats.clone(),
            latency: self.latency,
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            states: HashMap::new(),
        }))
    }

    fn input_count(&self) -> usize {
        match self.kind {
            MockKind::Encode => 2,
            MockKind::Decode => 1,
        }
    }

    fn output_names(&self) -> Vec<String> {
        match self.kind {
            MockKind::Encode => vec![INPUT_IDS.to_string(), ATTENTION_MASK.to_string()],
            MockKind::Decode => vec![STRING_OUTPUT.to_string()],
        }
    }
}

struct MockRequest {
    kind: MockKind,
    stats: Arc<MockStats>,
    latency: Duration,
    inputs: HashMap<usize, TensorValue>,
    outputs: HashMap<String, TensorValue>,
    states: HashMap<String, StateValue>,
}

impl MockRequest {
    fn state_defaults(&self) -> &'static [(&'static str, StateValue)] {
        match self.kind {
            MockKind::Encode => &[
                (ADD_SPECIAL_TOKENS, StateValue::Bool(true)),
                (MAX_LENGTH, StateValue::I32(-1)),
                (PAD_TO_MAX_LENGTH, StateValue::Bool(false)),
                (IS_MAX_LENGTH_SET, StateValue::Bool(false)),
            ],
            MockKind::Decode => &[(SKIP_SPECIAL_TOKENS, StateValue::Bool(true))],
        }
    }

    fn run(&mut self) -> Result<()> {
        match self.kind {
            MockKind::Encode => {
                let texts = self
                    .inputs
                    .get(&0)
                    .cloned()
                    .ok_or_else(|| anyhow!("no input"))?
                    .into_strings()?;
                if texts.iter().any(|t| t == "fail") {
                    bail!("mock inference failure");
                }
                let rows = texts
                    .iter()
                    .map(|t| t.split_whitespace().map(|w| w.len() as i64).collect::<Vec<_>>())
                    .collect::<Vec<_>>();
                let width = rows.iter().map(Vec::len).max().unwrap_or(0);
                let mut ids = Vec::new();
                let mut mask = Vec::new();
                for row in &rows {
                    ids.extend(row.iter().copied());
                    mask.extend(std::iter::repeat(1i64).take(row.len()));
                    ids.extend(std::iter::repeat(0i64).take(width - row.len()));
                    mask.extend(std::iter::repeat(0i64).take(width - row.len()));
                }
                let shape = (rows.len(), width);
                self.outputs.insert(
                    INPUT_IDS.to_string(),
                    TensorValue::Tensor(Tensor::from_vec(ids, shape, &Device::Cpu)?),
                );
                self.outputs.insert(
                    ATTENTION_MASK.to_string(),
                    TensorValue::Tensor(Tensor::from_vec(mask, shape, &Device::Cpu)?),
                );
            }
            MockKind::Decode => {
                let ids = self
                    .inputs
                    .get(&0)
                    .cloned()
                    .ok_or_else(|| anyhow!("no input"))?
                    .into_tensor()?
                    .to_vec2::<i64>()?;
                let texts = ids
                    .iter()
                    .map(|row| {
                        row.iter()
                            .map(|id| id.to_string())
                            .collect::<Vec<_>>()
                            .join(" ")
                    })
                    .collect();
                self.outputs
                    .insert(STRING_OUTPUT.to_string(), TensorValue::Strings(texts));
            }
        }
        Ok(())
    }
}

impl InferRequest for MockRequest {
    fn set_input(&mut self, index: usize, value: TensorValue) -> Result<()> {
        self.inputs.insert(index, value);
        Ok(())
    }

    fn infer(&mut self) -> Result<()> {
        self.stats.infer_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        *self.stats.last_states.lock().unwrap() = self
            .state_defaults()
            .iter()
            .map(|(name, default)| {
                let value = self.states.get(*name).copied().unwrap_or(*default);
                (name.to_string(), value)
            })
            .collect();
        let result = self.run();
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn output(&self, name: &str) -> Result<TensorValue> {
        self.outputs
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("no output `{name}`"))
    }

    fn state_names(&self) -> Vec<String> {
        self.state_defaults()
            .iter()
            .map(|(name, _)| name.to_string())
            .collect()
    }

    fn set_state(&mut self, name: &str, value: StateValue) -> Result<()> {
        self.stats.set_calls.fetch_add(1, Ordering::SeqCst);
        self.states.insert(name.to_string(), value);
        Ok(())
    }

    fn reset_state(&mut self, name: &str) -> Result<()> {
        self.stats.reset_calls.fetch_add(1, Ordering::SeqCst);
        self.states.remove(name);
        Ok(())
    }
}
