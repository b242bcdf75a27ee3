use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    error::{PagedAttnError, Result},
    graph::Parameter,
};

pub const KEY_CACHE_PREFIX: &str = "key_cache.";
pub const VALUE_CACHE_PREFIX: &str = "value_cache.";

/// Attention head geometry of one decoder layer, as seen by its KV cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvHeadConfig {
    pub num_k_heads: usize,
    pub k_head_size: usize,
    pub num_v_heads: usize,
    pub v_head_size: usize,
}

impl KvHeadConfig {
    /// Elements one token occupies in this layer's key and value caches together.
    pub fn elements_per_token(&self) -> usize {
        self.num_k_heads * self.k_head_size + self.num_v_heads * self.v_head_size
    }
}

pub fn key_cache_name(layer: usize) -> String {
    format!("{KEY_CACHE_PREFIX}{layer}")
}

pub fn value_cache_name(layer: usize) -> String {
    format!("{VALUE_CACHE_PREFIX}{layer}")
}

/// Build the per-layer head table from the `key_cache.N` / `value_cache.N`
/// parameters. Dimensions 1 and 2 of each cache parameter are read as
/// `(num_heads, head_size)` and must be static.
///
/// The result is indexed by layer. Fails when there are no cache parameters, when
/// key and value counts differ, or when layer indices are not `0..N`.
pub fn extract_kv_head_configs(parameters: &[Parameter]) -> Result<Vec<KvHeadConfig>> {
    let mut keys = BTreeMap::new();
    let mut values = BTreeMap::new();

    for param in parameters {
        let (suffix, table) = if let Some(suffix) = param.name.strip_prefix(KEY_CACHE_PREFIX) {
            (suffix, &mut keys)
        } else if let Some(suffix) = param.name.strip_prefix(VALUE_CACHE_PREFIX) {
            (suffix, &mut values)
        } else {
            continue;
        };
        let layer: usize = suffix
            .parse()
            .map_err(|_| PagedAttnError::MalformedCacheName(param.name.clone()))?;
        if table.insert(layer, param).is_some() {
            return Err(PagedAttnError::DuplicateCacheParameter(param.name.clone()));
        }
    }

    if keys.is_empty() && values.is_empty() {
        return Err(PagedAttnError::NoCacheParameters);
    }
    if keys.len() != values.len() {
        return Err(PagedAttnError::CacheCountMismatch {
            keys: keys.len(),
            values: values.len(),
        });
    }

    (0..keys.len())
        .map(|layer| {
            let k = keys
                .get(&layer)
                .ok_or_else(|| PagedAttnError::MissingCacheLayer(key_cache_name(layer)))?;
            let v = values
                .get(&layer)
                .ok_or_else(|| PagedAttnError::MissingCacheLayer(value_cache_name(layer)))?;
            let (num_k_heads, k_head_size) = head_geometry(k)?;
            let (num_v_heads, v_head_size) = head_geometry(v)?;
            Ok(KvHeadConfig {
                num_k_heads,
                k_head_size,
                num_v_heads,
                v_head_size,
            })
        })
        .collect()
}

fn head_geometry(param: &Parameter) -> Result<(usize, usize)> {
    let shape = param.partial_shape();
    match shape.rank() {
        Some(rank) if rank >= 3 => {}
        rank => {
            return Err(PagedAttnError::CacheRank {
                name: param.name.clone(),
                rank: rank.unwrap_or(0),
            })
        }
    }
    let static_dim = |dim: usize| {
        shape
            .dim(dim)
            .and_then(|d| d.get_length())
            .filter(|n| *n > 0)
            .ok_or_else(|| PagedAttnError::NonStaticCacheDim {
                name: param.name.clone(),
                dim,
                shape: shape.to_string(),
            })
    };
    Ok((static_dim(1)?, static_dim(2)?))
}
