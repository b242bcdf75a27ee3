//! Paged-attention support for stateful attention graphs.
//!
//! [`apply_paged_attention_transformations`] turns a graph that keeps its KV
//! history in state variables into one that reads and writes externally managed
//! cache blocks, and returns the per-layer [`KvHeadConfig`] table a runtime needs to
//! allocate those blocks (see [`CacheEngine`]).

mod cache_engine;
mod error;
pub mod graph;
mod kv_head_config;
mod sdpa_to_paged;
mod transform;

pub use cache_engine::{CacheConfig, CacheEngine, KVCache, PagedCacheType};
pub use error::{PagedAttnError, Result};
pub use graph::{
    Dim, ElementType, Graph, GraphOutput, GraphPass, ModelGraph, Node, Op, Parameter,
    PartialShape, Source, TensorDesc, Variable,
};
pub use kv_head_config::{
    extract_kv_head_configs, key_cache_name, value_cache_name, KvHeadConfig, KEY_CACHE_PREFIX,
    VALUE_CACHE_PREFIX,
};
pub use sdpa_to_paged::{
    SdpaToPagedAttention, BEAM_IDX, BLOCK_INDICES, BLOCK_INDICES_BEGINS, MAX_CONTEXT_LEN,
    PAST_LENS, ROTATION_TRIG_LUT, SUBSEQUENCE_BEGINS,
};
pub use transform::{
    apply_paged_attention_transformations, apply_paged_attention_transformations_with,
    PagedAttentionFlags,
};
