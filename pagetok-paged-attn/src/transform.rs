use tracing::info;

use crate::{
    error::{PagedAttnError, Result},
    graph::{ElementType, Graph, GraphPass, ModelGraph, PartialShape},
    kv_head_config::{
        extract_kv_head_configs, key_cache_name, value_cache_name, KvHeadConfig,
    },
    sdpa_to_paged::SdpaToPagedAttention,
};

/// Options for [`apply_paged_attention_transformations`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PagedAttentionFlags {
    /// Per-layer block index inputs and per-layer attention score outputs.
    pub per_layer_cache_control: bool,
    /// Inputs for rotating cache entries, e.g. after positional compaction.
    pub allow_cache_rotation: bool,
}

impl From<PagedAttentionFlags> for SdpaToPagedAttention {
    fn from(flags: PagedAttentionFlags) -> Self {
        SdpaToPagedAttention::new(
            flags.per_layer_cache_control,
            flags.per_layer_cache_control,
            flags.allow_cache_rotation,
        )
    }
}

/// Rewrite a stateful attention graph into paged form with the built-in SDPA pass.
///
/// Returns the per-layer head table captured before the cache parameters lose
/// their shapes. The caller hands it to whatever allocates cache blocks.
pub fn apply_paged_attention_transformations(
    graph: &mut Graph,
    flags: PagedAttentionFlags,
) -> Result<Vec<KvHeadConfig>> {
    let pass = SdpaToPagedAttention::from(flags);
    apply_paged_attention_transformations_with(graph, &pass)
}

/// Same as [`apply_paged_attention_transformations`] with a caller-provided structural pass.
pub fn apply_paged_attention_transformations_with<G, P>(
    graph: &mut G,
    pass: &P,
) -> Result<Vec<KvHeadConfig>>
where
    G: ModelGraph + ?Sized,
    P: GraphPass<G> + ?Sized,
{
    if graph.variables().is_empty() {
        return Err(PagedAttnError::NotStateful);
    }

    pass.run_on_graph(graph)?;

    let kv_head_configs = extract_kv_head_configs(graph.parameters())?;

    // The backend picks precision and axis order of the cache blocks.
    for layer in 0..kv_head_configs.len() {
        for name in [key_cache_name(layer), value_cache_name(layer)] {
            let param = graph
                .parameter_mut(&name)
                .ok_or_else(|| PagedAttnError::UnknownParameter(name.clone()))?;
            param.set_element_type(ElementType::Dynamic);
            param.set_partial_shape(PartialShape::dynamic(4));
        }
    }

    graph.validate_and_infer_types()?;

    info!(
        "Applied `{}`: {} decoder layers use paged KV cache.",
        pass.name(),
        kv_head_configs.len()
    );
    Ok(kv_head_configs)
}
