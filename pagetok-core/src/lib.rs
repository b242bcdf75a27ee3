//! Pooled tokenizer sessions for LLM runtimes.
//!
//! A [`TokenizerSession`] compiles tokenizer and detokenizer graphs through a
//! [`Backend`], keeps a fixed pool of requests per direction, and resolves the
//! special tokens and chat template that come with a model.
//!
//! ```no_run
//! use pagetok_core::{
//!     BackendContext, DecodeOptions, EncodeOptions, HfTokenizerGraph, HfTokenizersBackend,
//!     TokenizerSession,
//! };
//! use std::path::Path;
//!
//! # fn main() -> anyhow::Result<()> {
//! let dir = Path::new("models/my-model");
//! let (tok, detok) = HfTokenizerGraph::from_file(dir.join("tokenizer.json"))?;
//! let ctx = BackendContext::new(HfTokenizersBackend);
//! let session = TokenizerSession::new(&ctx, Some(&tok), Some(&detok), Some(dir))?;
//!
//! let encoded = session.encode("Hello!", &EncodeOptions::default())?;
//! let ids = encoded.input_ids.to_vec2::<i64>()?;
//! let text = session.decode(&ids[0], &DecodeOptions::default())?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod chat_template;
mod hf_backend;
mod known_templates;
mod options;
mod pool;
mod special_tokens;
mod tokenizer;
mod utils;

pub use backend::{
    Backend, BackendContext, CompileOptions, CompiledModel, InferRequest, RuntimeInfo,
    StateValue, TensorValue, TensorValueError, TokenizerGraph, TOKENIZERS_VERSION_KEY,
};
pub use chat_template::{
    apply_chat_template_to, patch_chat_template, remap_and_patch, resolve_chat_template,
    ChatMessage, ChatTemplateError, CHAT_TEMPLATE_KEY, SIMPLIFIED_CHAT_TEMPLATE_KEY,
};
pub use hf_backend::{
    load_tokenizer, GraphKind, HfTokenizerGraph, HfTokenizersBackend, ATTENTION_MASK, INPUT_IDS,
    SEQUENCE_LENGTHS_INPUT, STRING_OUTPUT, TOKEN_TYPE_IDS,
};
pub use known_templates::remap_known_template;
pub use options::{
    DecodeOptions, EncodeOptions, RequestFlags, Requested, StateFlags, ADD_SPECIAL_TOKENS,
    IS_MAX_LENGTH_SET, MAX_LENGTH, PAD_TO_MAX_LENGTH, SKIP_SPECIAL_TOKENS,
};
pub use pool::{ManagedRequest, PooledRequest, RequestPool};
pub use special_tokens::{
    SpecialTokens, BOS_TOKEN_ID_KEY, EOS_TOKEN_ID_KEY, PAD_TOKEN_ID_KEY, UNKNOWN_TOKEN_ID,
};
pub use tokenizer::{EncodeInput, TokenizedInputs, TokenizerError, TokenizerSession};
pub use utils::debug::{initialize_logging, DEBUG_ENV_VAR};
pub use utils::log::once_log_info;
