use thiserror::Error;

/// Errors raised while rewriting a graph for paged attention or allocating its cache.
#[derive(Error, Debug)]
pub enum PagedAttnError {
    #[error("Model is supposed to be stateful: it declares no state variables.")]
    NotStateful,

    #[error("No `key_cache.*`/`value_cache.*` parameters were found in the graph.")]
    NoCacheParameters,

    #[error("Found {keys} key cache parameters but {values} value cache parameters.")]
    CacheCountMismatch { keys: usize, values: usize },

    #[error("Cache parameter `{0}` does not end with a layer index.")]
    MalformedCacheName(String),

    #[error("Cache parameter `{0}` is declared more than once.")]
    DuplicateCacheParameter(String),

    #[error("Cache parameters are not contiguous: `{0}` is missing.")]
    MissingCacheLayer(String),

    #[error("Cache parameter `{name}` has rank {rank}, expected at least 3 before the rewrite.")]
    CacheRank { name: String, rank: usize },

    #[error("Dimension {dim} of cache parameter `{name}` must be statically known and positive, got `{shape}`.")]
    NonStaticCacheDim {
        name: String,
        dim: usize,
        shape: String,
    },

    #[error("Unknown parameter `{0}`.")]
    UnknownParameter(String),

    #[error("Unknown state variable `{0}`.")]
    UnknownVariable(String),

    #[error("Node `{node}` references `{source_name}` which is not defined before it.")]
    DanglingInput { node: String, source_name: String },

    #[error("Shape inference failed at node `{node}`: {reason}")]
    ShapeInference { node: String, reason: String },

    #[error("Graph rewrite `{pass}` failed: {reason}")]
    Rewrite { pass: &'static str, reason: String },

    #[error("Invalid cache configuration: {0}")]
    InvalidCacheConfig(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, PagedAttnError>;
