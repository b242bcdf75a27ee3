//! Structural rewrite from stateful scaled-dot-product attention to paged attention.
//!
//! A layer is recognised when an SDPA node takes its key and value from a
//! `Concat(ReadValue(var), new)` pair. Each recognised layer gets a
//! `key_cache.N` / `value_cache.N` parameter shaped `[?, heads, head_size, ?]`
//! from the state variable `[batch, heads, seq, head_size]`, and the SDPA node is
//! replaced by a `PagedAttention` node reading those caches through block tables.

use std::collections::HashSet;

use tracing::debug;

use crate::{
    error::{PagedAttnError, Result},
    graph::{Dim, ElementType, Graph, GraphPass, Op, Parameter, PartialShape, Source},
    kv_head_config::{key_cache_name, value_cache_name},
};

pub const PAST_LENS: &str = "past_lens";
pub const SUBSEQUENCE_BEGINS: &str = "subsequence_begins";
pub const BLOCK_INDICES: &str = "block_indices";
pub const BLOCK_INDICES_BEGINS: &str = "block_indices_begins";
pub const MAX_CONTEXT_LEN: &str = "max_context_len";
pub const ROTATION_TRIG_LUT: &str = "rotation_trig_lut";
pub const BEAM_IDX: &str = "beam_idx";

/// Configured instance of the SDPA to paged-attention rewrite.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SdpaToPagedAttention {
    /// Give every layer its own `block_indices.N` input instead of the shared one.
    pub use_block_indices_inputs: bool,
    /// Expose per-layer attention scores as `scores.N` results.
    pub use_score_outputs: bool,
    /// Add per-layer rotation inputs and the shared rotation lookup table.
    pub allow_cache_rotation: bool,
}

struct MatchedLayer {
    sdpa: String,
    key_concat: String,
    value_concat: String,
    key_var: String,
    value_var: String,
}

/// A matched layer with its cache parameters and attention inputs resolved.
struct PreparedLayer {
    layer: usize,
    matched: MatchedLayer,
    key_cache: Parameter,
    value_cache: Parameter,
    query: Source,
    new_key: Source,
    new_value: Source,
}

impl SdpaToPagedAttention {
    pub fn new(
        use_block_indices_inputs: bool,
        use_score_outputs: bool,
        allow_cache_rotation: bool,
    ) -> Self {
        Self {
            use_block_indices_inputs,
            use_score_outputs,
            allow_cache_rotation,
        }
    }

    /// Follow `Concat(ReadValue(var), new)` back to the variable id.
    fn state_variable_of(graph: &Graph, source: &Source) -> Option<(String, String)> {
        let Source::Node { name, .. } = source else {
            return None;
        };
        let concat = graph.node(name)?;
        if !matches!(concat.op, Op::Concat { .. }) {
            return None;
        }
        let Source::Node { name: read, .. } = concat.inputs.first()? else {
            return None;
        };
        match &graph.node(read)?.op {
            Op::ReadValue { variable } => Some((concat.name.clone(), variable.clone())),
            _ => None,
        }
    }

    fn match_layers(graph: &Graph) -> Vec<MatchedLayer> {
        graph
            .nodes
            .iter()
            .filter(|n| matches!(n.op, Op::ScaledDotProductAttention))
            .filter_map(|node| {
                let (key_concat, key_var) = Self::state_variable_of(graph, node.inputs.get(1)?)?;
                let (value_concat, value_var) =
                    Self::state_variable_of(graph, node.inputs.get(2)?)?;
                Some(MatchedLayer {
                    sdpa: node.name.clone(),
                    key_concat,
                    value_concat,
                    key_var,
                    value_var,
                })
            })
            .collect()
    }

    fn cache_parameter(&self, graph: &Graph, name: String, variable: &str) -> Result<Parameter> {
        let var = graph
            .variable(variable)
            .ok_or_else(|| PagedAttnError::UnknownVariable(variable.to_string()))?;
        let (heads, head_size) = match var.desc.shape.dims() {
            Some(dims) if dims.len() == 4 => (dims[1], dims[3]),
            _ => {
                return Err(PagedAttnError::Rewrite {
                    pass: self.name(),
                    reason: format!(
                        "state variable `{variable}` has shape {}, expected [batch, heads, seq, head_size]",
                        var.desc.shape
                    ),
                })
            }
        };
        Ok(Parameter::new(
            name,
            var.desc.element_type,
            PartialShape::new(vec![Dim::Dynamic, heads, head_size, Dim::Dynamic]),
        ))
    }

    fn prepare_layer(
        &self,
        graph: &Graph,
        layer: usize,
        matched: MatchedLayer,
    ) -> Result<PreparedLayer> {
        let key_cache = self.cache_parameter(graph, key_cache_name(layer), &matched.key_var)?;
        let value_cache =
            self.cache_parameter(graph, value_cache_name(layer), &matched.value_var)?;

        let new_key = graph
            .node(&matched.key_concat)
            .and_then(|n| n.inputs.get(1).cloned());
        let new_value = graph
            .node(&matched.value_concat)
            .and_then(|n| n.inputs.get(1).cloned());
        let (Some(new_key), Some(new_value)) = (new_key, new_value) else {
            return Err(PagedAttnError::Rewrite {
                pass: self.name(),
                reason: format!("cache concat of `{}` has no new-token input", matched.sdpa),
            });
        };
        let query = graph
            .node(&matched.sdpa)
            .and_then(|n| n.inputs.first().cloned())
            .ok_or_else(|| PagedAttnError::Rewrite {
                pass: self.name(),
                reason: format!("`{}` has no query input", matched.sdpa),
            })?;

        Ok(PreparedLayer {
            layer,
            matched,
            key_cache,
            value_cache,
            query,
            new_key,
            new_value,
        })
    }

    /// Nothing that survives the rewrite may read a node that is about to be removed.
    fn check_no_remaining_users(
        &self,
        graph: &Graph,
        prepared: &[PreparedLayer],
        removed: &HashSet<String>,
    ) -> Result<()> {
        let is_removed =
            |src: &Source| matches!(src, Source::Node { name, .. } if removed.contains(name));
        let rewritten = prepared
            .iter()
            .map(|p| p.matched.sdpa.as_str())
            .collect::<HashSet<_>>();

        let kept_user = graph
            .nodes
            .iter()
            .filter(|n| !removed.contains(&n.name) && !rewritten.contains(n.name.as_str()))
            .find(|n| n.inputs.iter().any(is_removed))
            .map(|n| n.name.clone());
        let rewritten_user = prepared
            .iter()
            .find(|p| [&p.query, &p.new_key, &p.new_value].into_iter().any(is_removed))
            .map(|p| p.matched.sdpa.clone());
        let result_user = graph
            .results
            .iter()
            .find(|r| is_removed(&r.source))
            .map(|r| r.name.clone());

        match kept_user.or(rewritten_user).or(result_user) {
            Some(user) => Err(PagedAttnError::Rewrite {
                pass: self.name(),
                reason: format!("`{user}` still consumes removed cache state"),
            }),
            None => Ok(()),
        }
    }

    fn add_index_input(graph: &mut Graph, name: impl Into<String>, rank: usize) {
        graph.add_parameter(Parameter::new(
            name,
            ElementType::I32,
            PartialShape::dynamic(rank),
        ));
    }
}

impl GraphPass<Graph> for SdpaToPagedAttention {
    fn name(&self) -> &'static str {
        "SdpaToPagedAttention"
    }

    fn run_on_graph(&self, graph: &mut Graph) -> Result<bool> {
        let layers = Self::match_layers(graph);
        if layers.is_empty() {
            debug!("{}: no stateful SDPA nodes found", self.name());
            return Ok(false);
        }

        // Everything that can fail is checked before the graph is touched.
        let prepared = layers
            .into_iter()
            .enumerate()
            .map(|(layer, matched)| self.prepare_layer(graph, layer, matched))
            .collect::<Result<Vec<_>>>()?;
        let removed_vars = prepared
            .iter()
            .flat_map(|p| [p.matched.key_var.clone(), p.matched.value_var.clone()])
            .collect::<HashSet<_>>();
        let mut removed_nodes = prepared
            .iter()
            .flat_map(|p| [p.matched.key_concat.clone(), p.matched.value_concat.clone()])
            .collect::<HashSet<_>>();
        for node in &graph.nodes {
            match &node.op {
                Op::ReadValue { variable } | Op::Assign { variable }
                    if removed_vars.contains(variable) =>
                {
                    removed_nodes.insert(node.name.clone());
                }
                _ => {}
            }
        }
        self.check_no_remaining_users(graph, &prepared, &removed_nodes)?;

        Self::add_index_input(graph, PAST_LENS, 1);
        Self::add_index_input(graph, SUBSEQUENCE_BEGINS, 1);
        if !self.use_block_indices_inputs {
            Self::add_index_input(graph, BLOCK_INDICES, 1);
        }
        Self::add_index_input(graph, BLOCK_INDICES_BEGINS, 1);
        Self::add_index_input(graph, MAX_CONTEXT_LEN, 0);
        if self.allow_cache_rotation {
            graph.add_parameter(Parameter::new(
                ROTATION_TRIG_LUT,
                ElementType::F32,
                PartialShape::dynamic(2),
            ));
        }

        let converted = prepared.len();
        for PreparedLayer {
            layer,
            matched,
            key_cache,
            value_cache,
            query,
            new_key,
            new_value,
        } in prepared
        {
            graph.add_parameter(key_cache);
            graph.add_parameter(value_cache);

            let block_indices = if self.use_block_indices_inputs {
                let name = format!("{BLOCK_INDICES}.{layer}");
                Self::add_index_input(graph, name.clone(), 1);
                name
            } else {
                BLOCK_INDICES.to_string()
            };

            let mut inputs = Vec::with_capacity(13);
            inputs.push(query);
            inputs.push(new_key);
            inputs.push(new_value);
            inputs.push(Source::parameter(key_cache_name(layer)));
            inputs.push(Source::parameter(value_cache_name(layer)));
            inputs.push(Source::parameter(PAST_LENS));
            inputs.push(Source::parameter(SUBSEQUENCE_BEGINS));
            inputs.push(Source::parameter(block_indices));
            inputs.push(Source::parameter(BLOCK_INDICES_BEGINS));
            inputs.push(Source::parameter(MAX_CONTEXT_LEN));
            if self.allow_cache_rotation {
                let rotated = format!("rotated_block_indices.{layer}");
                let deltas = format!("rotation_deltas.{layer}");
                Self::add_index_input(graph, rotated.clone(), 1);
                Self::add_index_input(graph, deltas.clone(), 2);
                inputs.push(Source::parameter(rotated));
                inputs.push(Source::parameter(deltas));
                inputs.push(Source::parameter(ROTATION_TRIG_LUT));
            }

            if let Some(node) = graph.node_mut(&matched.sdpa) {
                node.op = Op::PagedAttention {
                    layer,
                    with_scores: self.use_score_outputs,
                    with_rotation: self.allow_cache_rotation,
                };
                node.inputs = inputs;
            }
            if self.use_score_outputs {
                graph.add_result(
                    format!("scores.{layer}"),
                    Source::Node {
                        name: matched.sdpa.clone(),
                        port: 1,
                    },
                );
            }
        }

        graph.nodes.retain(|n| !removed_nodes.contains(&n.name));
        graph.variables.retain(|v| !removed_vars.contains(&v.id));

        let beam_idx_used = graph
            .nodes
            .iter()
            .any(|n| n.inputs.contains(&Source::parameter(BEAM_IDX)));
        if !beam_idx_used {
            graph.parameters.retain(|p| p.name != BEAM_IDX);
        }

        debug!(
            "{}: converted {} attention layers",
            self.name(),
            converted
        );
        Ok(true)
    }
}
