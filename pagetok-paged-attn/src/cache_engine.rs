use std::str::FromStr;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::{
    error::{PagedAttnError, Result},
    kv_head_config::KvHeadConfig,
};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PagedCacheType {
    #[default]
    Auto,
    F16,
    BF16,
    F32,
}

impl PagedCacheType {
    pub fn to_dtype(&self, act_dtype: DType) -> DType {
        match self {
            PagedCacheType::Auto => act_dtype,
            PagedCacheType::F16 => DType::F16,
            PagedCacheType::BF16 => DType::BF16,
            PagedCacheType::F32 => DType::F32,
        }
    }
}

impl FromStr for PagedCacheType {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "f16" => Ok(Self::F16),
            "bf16" => Ok(Self::BF16),
            "f32" => Ok(Self::F32),
            other => Err(format!(
                "Unexpected `PagedCacheType`, got `{other}` but expected one of `auto`, `f16`, `bf16`, `f32`."
            )),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Tokens per block.
    pub block_size: usize,
    pub num_blocks: usize,
    pub cache_type: PagedCacheType,
}

impl CacheConfig {
    /// Size the pool so that all layers together fit in `budget_bytes`.
    pub fn from_memory_budget(
        head_configs: &[KvHeadConfig],
        block_size: usize,
        cache_type: PagedCacheType,
        act_dtype: DType,
        budget_bytes: usize,
    ) -> Result<Self> {
        let per_block =
            CacheEngine::bytes_per_block(head_configs, cache_type.to_dtype(act_dtype), block_size);
        if per_block == 0 {
            return Err(PagedAttnError::InvalidCacheConfig(
                "a cache block would occupy zero bytes".to_string(),
            ));
        }
        Ok(Self {
            block_size,
            num_blocks: budget_bytes / per_block,
            cache_type,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.num_blocks == 0 {
            return Err(PagedAttnError::InvalidCacheConfig(format!(
                "block_size ({}) and num_blocks ({}) must be positive",
                self.block_size, self.num_blocks
            )));
        }
        Ok(())
    }
}

pub type KVCache = (Tensor, Tensor);

/// Owns the key/value block tensors of every layer.
///
/// Each layer is sized from its own [`KvHeadConfig`], so layers with different
/// head counts or sizes share one block table without sharing a shape.
pub struct CacheEngine {
    cache: Vec<KVCache>,
    block_size: usize,
    num_blocks: usize,
}

impl CacheEngine {
    pub fn new(
        head_configs: &[KvHeadConfig],
        cache_config: &CacheConfig,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        cache_config.validate()?;
        let dtype = cache_config.cache_type.to_dtype(dtype);
        let mut cache = Vec::with_capacity(head_configs.len());
        for head in head_configs {
            let (kh, kd, bs, x) = Self::calculate_key_block_shape(head, dtype, cache_config.block_size)?;
            let key_blocks = Tensor::zeros((cache_config.num_blocks, kh, kd, bs, x), dtype, device)?;
            let (vh, vd, bs) = Self::calculate_value_block_shape(head, cache_config.block_size);
            let value_blocks = Tensor::zeros((cache_config.num_blocks, vh, vd, bs), dtype, device)?;
            cache.push((key_blocks, value_blocks));
        }
        Ok(Self {
            cache,
            block_size: cache_config.block_size,
            num_blocks: cache_config.num_blocks,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.cache.len()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn layer(&self, layer: usize) -> Option<&KVCache> {
        self.cache.get(layer)
    }

    pub fn kv_caches(&self) -> &[KVCache] {
        &self.cache
    }

    pub fn bytes_per_block(head_configs: &[KvHeadConfig], dtype: DType, block_size: usize) -> usize {
        head_configs
            .iter()
            .map(|h| h.elements_per_token() * block_size * dtype.size_in_bytes())
            .sum()
    }

    /// `(heads, head_size / x, block_size, x)` with `x` elements packing 16 bytes.
    pub fn calculate_key_block_shape(
        head: &KvHeadConfig,
        dtype: DType,
        block_size: usize,
    ) -> Result<(usize, usize, usize, usize)> {
        let x = 16 / dtype.size_in_bytes();
        if head.k_head_size % x != 0 {
            return Err(PagedAttnError::InvalidCacheConfig(format!(
                "key head size {} is not a multiple of {x} for {dtype:?}",
                head.k_head_size
            )));
        }
        Ok((head.num_k_heads, head.k_head_size / x, block_size, x))
    }

    pub fn calculate_value_block_shape(
        head: &KvHeadConfig,
        block_size: usize,
    ) -> (usize, usize, usize) {
        (head.num_v_heads, head.v_head_size, block_size)
    }
}
