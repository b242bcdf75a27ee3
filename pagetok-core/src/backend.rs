//! The inference backend seen by a tokenizer session.
//!
//! A backend compiles a tokenizer or detokenizer graph into a [`CompiledModel`],
//! which hands out [`InferRequest`]s. Requests carry a few named state variables
//! (e.g. `add_special_tokens`) that can be set or reset to their compiled default
//! between calls.

use std::{collections::HashMap, num::NonZeroUsize, sync::Arc};

use anyhow::Result;
use candle_core::{Device, Tensor};
use serde_json::{Map, Value};
use thiserror::Error;

/// Metadata key whose presence marks a graph built with runtime-togglable flags.
pub const TOKENIZERS_VERSION_KEY: &str = "tokenizers_version";

/// Free-form metadata embedded in a graph (special token ids, chat template, versions).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuntimeInfo(Map<String, Value>);

impl RuntimeInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }
}

impl From<Map<String, Value>> for RuntimeInfo {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// A graph a [`Backend`] can compile.
pub trait TokenizerGraph: Send + Sync {
    fn runtime_info(&self) -> &RuntimeInfo;

    /// Token strings indexed by id, if the graph embeds its vocabulary.
    fn vocab(&self) -> Option<Vec<String>> {
        None
    }
}

#[derive(Clone, Debug, Default)]
pub struct CompileOptions {
    /// Number of parallel requests the compiled model should be sized for.
    pub concurrency: Option<NonZeroUsize>,
    /// Backend-specific properties, passed through verbatim.
    pub properties: HashMap<String, String>,
}

pub trait Backend: Send + Sync {
    type Graph: TokenizerGraph;

    fn name(&self) -> &str;

    fn compile(
        &self,
        graph: &Self::Graph,
        device: &Device,
        options: &CompileOptions,
    ) -> Result<Box<dyn CompiledModel>>;
}

pub trait CompiledModel: Send + Sync {
    /// How many requests can usefully run at once. Always at least 1.
    fn optimal_concurrency(&self) -> usize;
    fn create_request(&self) -> Result<Box<dyn InferRequest>>;
    fn input_count(&self) -> usize;
    fn output_names(&self) -> Vec<String>;
}

/// Scalar stored in a request state variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateValue {
    Bool(bool),
    I32(i32),
}

/// A value passed to or read from a request.
#[derive(Clone, Debug)]
pub enum TensorValue {
    /// A batch of strings, the only string tensor shape tokenizers need.
    Strings(Vec<String>),
    Tensor(Tensor),
}

#[derive(Error, Debug)]
pub enum TensorValueError {
    #[error("Expected a string batch, got a numeric tensor.")]
    NotStrings,
    #[error("Expected a numeric tensor, got a string batch.")]
    NotTensor,
}

impl TensorValue {
    pub fn into_strings(self) -> std::result::Result<Vec<String>, TensorValueError> {
        match self {
            Self::Strings(s) => Ok(s),
            Self::Tensor(_) => Err(TensorValueError::NotStrings),
        }
    }

    pub fn into_tensor(self) -> std::result::Result<Tensor, TensorValueError> {
        match self {
            Self::Tensor(t) => Ok(t),
            Self::Strings(_) => Err(TensorValueError::NotTensor),
        }
    }
}

pub trait InferRequest: Send {
    fn set_input(&mut self, index: usize, value: TensorValue) -> Result<()>;
    /// Run to completion. There is no cancellation.
    fn infer(&mut self) -> Result<()>;
    fn output(&self, name: &str) -> Result<TensorValue>;
    fn state_names(&self) -> Vec<String>;
    fn set_state(&mut self, name: &str, value: StateValue) -> Result<()>;
    /// Restore the compiled default of a state variable.
    fn reset_state(&mut self, name: &str) -> Result<()>;
}

/// An explicitly owned backend plus the device and options sessions compile with.
///
/// Sessions borrow the context only while compiling; several contexts with
/// different devices can coexist in one process.
pub struct BackendContext<B: Backend> {
    backend: Arc<B>,
    device: Device,
    options: CompileOptions,
}

impl<B: Backend> BackendContext<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
            device: Device::Cpu,
            options: CompileOptions::default(),
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_options(mut self, options: CompileOptions) -> Self {
        self.options = options;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    pub fn compile(&self, graph: &B::Graph) -> Result<Box<dyn CompiledModel>> {
        self.backend.compile(graph, &self.device, &self.options)
    }
}

impl<B: Backend> Clone for BackendContext<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            device: self.device.clone(),
            options: self.options.clone(),
        }
    }
}
