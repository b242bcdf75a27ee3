//! A small in-memory attention graph.
//!
//! Only what the paged-attention rewrite needs is modelled: named input
//! parameters with partial shapes, state variables, a flat list of nodes kept in
//! topological order, and named results. Element types and dimensions may be left
//! dynamic so a backend can pick them at compile time.

use std::{collections::HashMap, fmt};

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::error::{PagedAttnError, Result};

/// Element type of a graph value. `Dynamic` leaves the choice to the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Dynamic,
    Boolean,
    I32,
    I64,
    U8,
    U32,
    F16,
    Bf16,
    F32,
    F64,
    String,
}

impl ElementType {
    pub fn is_dynamic(&self) -> bool {
        matches!(self, Self::Dynamic)
    }

    /// The candle dtype for this element type, if candle can hold it.
    pub fn to_dtype(&self) -> Option<DType> {
        match self {
            Self::U8 | Self::Boolean => Some(DType::U8),
            Self::U32 => Some(DType::U32),
            Self::I64 => Some(DType::I64),
            Self::F16 => Some(DType::F16),
            Self::Bf16 => Some(DType::BF16),
            Self::F32 => Some(DType::F32),
            Self::F64 => Some(DType::F64),
            Self::Dynamic | Self::I32 | Self::String => None,
        }
    }

    /// Unify two element types, `Dynamic` being compatible with everything.
    pub fn merge(self, other: Self) -> Option<Self> {
        match (self, other) {
            (Self::Dynamic, t) | (t, Self::Dynamic) => Some(t),
            (a, b) if a == b => Some(a),
            _ => None,
        }
    }
}

impl From<DType> for ElementType {
    fn from(dtype: DType) -> Self {
        match dtype {
            DType::U8 => Self::U8,
            DType::U32 => Self::U32,
            DType::I64 => Self::I64,
            DType::F16 => Self::F16,
            DType::BF16 => Self::Bf16,
            DType::F32 => Self::F32,
            DType::F64 => Self::F64,
        }
    }
}

/// One dimension of a [`PartialShape`]. Serialized as a number or `null`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Option<usize>", into = "Option<usize>")]
pub enum Dim {
    Static(usize),
    Dynamic,
}

impl Dim {
    pub fn get_length(&self) -> Option<usize> {
        match self {
            Self::Static(n) => Some(*n),
            Self::Dynamic => None,
        }
    }

    pub fn is_static(&self) -> bool {
        matches!(self, Self::Static(_))
    }

    fn merge(self, other: Self) -> Option<Self> {
        match (self, other) {
            (Self::Dynamic, d) | (d, Self::Dynamic) => Some(d),
            (Self::Static(a), Self::Static(b)) if a == b => Some(Self::Static(a)),
            _ => None,
        }
    }
}

impl From<Option<usize>> for Dim {
    fn from(value: Option<usize>) -> Self {
        value.map_or(Self::Dynamic, Self::Static)
    }
}

impl From<Dim> for Option<usize> {
    fn from(value: Dim) -> Self {
        value.get_length()
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(n) => write!(f, "{n}"),
            Self::Dynamic => write!(f, "?"),
        }
    }
}

/// A shape whose rank and dimensions may each be unknown. `None` means dynamic rank.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartialShape(Option<Vec<Dim>>);

impl PartialShape {
    pub fn new(dims: Vec<Dim>) -> Self {
        Self(Some(dims))
    }

    pub fn from_static(dims: &[usize]) -> Self {
        Self(Some(dims.iter().copied().map(Dim::Static).collect()))
    }

    /// A shape of known rank where every dimension is unknown.
    pub fn dynamic(rank: usize) -> Self {
        Self(Some(vec![Dim::Dynamic; rank]))
    }

    pub fn dynamic_rank() -> Self {
        Self(None)
    }

    pub fn rank(&self) -> Option<usize> {
        self.0.as_ref().map(Vec::len)
    }

    pub fn dims(&self) -> Option<&[Dim]> {
        self.0.as_deref()
    }

    pub fn dim(&self, idx: usize) -> Option<Dim> {
        self.0.as_ref().and_then(|dims| dims.get(idx).copied())
    }

    pub fn is_static(&self) -> bool {
        self.0
            .as_ref()
            .is_some_and(|dims| dims.iter().all(Dim::is_static))
    }

    /// True when the rank is known and no dimension is.
    pub fn is_fully_dynamic(&self) -> bool {
        self.0
            .as_ref()
            .is_some_and(|dims| dims.iter().all(|d| !d.is_static()))
    }

    pub fn merge(&self, other: &Self) -> Option<Self> {
        match (&self.0, &other.0) {
            (None, _) => Some(other.clone()),
            (_, None) => Some(self.clone()),
            (Some(a), Some(b)) if a.len() == b.len() => a
                .iter()
                .zip(b)
                .map(|(x, y)| x.merge(*y))
                .collect::<Option<Vec<_>>>()
                .map(Self::new),
            _ => None,
        }
    }
}

impl fmt::Display for PartialShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            None => write!(f, "[...]"),
            Some(dims) => {
                let dims = dims.iter().map(Dim::to_string).collect::<Vec<_>>();
                write!(f, "[{}]", dims.join(","))
            }
        }
    }
}

/// Element type and partial shape of one value flowing through the graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDesc {
    pub element_type: ElementType,
    pub shape: PartialShape,
}

impl TensorDesc {
    pub fn new(element_type: ElementType, shape: PartialShape) -> Self {
        Self {
            element_type,
            shape,
        }
    }

    fn merge(&self, other: &Self) -> Option<Self> {
        Some(Self {
            element_type: self.element_type.merge(other.element_type)?,
            shape: self.shape.merge(&other.shape)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(flatten)]
    pub desc: TensorDesc,
}

impl Parameter {
    pub fn new(name: impl Into<String>, element_type: ElementType, shape: PartialShape) -> Self {
        Self {
            name: name.into(),
            desc: TensorDesc::new(element_type, shape),
        }
    }

    pub fn element_type(&self) -> ElementType {
        self.desc.element_type
    }

    pub fn partial_shape(&self) -> &PartialShape {
        &self.desc.shape
    }

    pub fn set_element_type(&mut self, element_type: ElementType) {
        self.desc.element_type = element_type;
    }

    pub fn set_partial_shape(&mut self, shape: PartialShape) {
        self.desc.shape = shape;
    }
}

/// A state variable persisted across inference calls.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub id: String,
    #[serde(flatten)]
    pub desc: TensorDesc,
}

/// Where a node input comes from.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Parameter(String),
    Node {
        name: String,
        #[serde(default)]
        port: usize,
    },
}

impl Source {
    pub fn node(name: impl Into<String>) -> Self {
        Self::Node {
            name: name.into(),
            port: 0,
        }
    }

    pub fn parameter(name: impl Into<String>) -> Self {
        Self::Parameter(name.into())
    }

    fn label(&self) -> String {
        match self {
            Self::Parameter(name) => name.clone(),
            Self::Node { name, port } => format!("{name}:{port}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Op {
    /// Reads the current value of a state variable.
    ReadValue { variable: String },
    /// Stores its single input into a state variable.
    Assign { variable: String },
    Concat { axis: usize },
    /// Inputs: query, key, value, optional mask.
    ScaledDotProductAttention,
    /// Inputs follow [`PAGED_ATTENTION_INPUTS`], followed by [`ROTATION_INPUTS`]
    /// when `with_rotation` is set.
    PagedAttention {
        layer: usize,
        with_scores: bool,
        with_rotation: bool,
    },
    /// Any other operation. Its declared outputs are kept as-is.
    Opaque { kind: String },
}

/// Input order of a paged attention node.
pub const PAGED_ATTENTION_INPUTS: [&str; 10] = [
    "query",
    "key",
    "value",
    "key_cache",
    "value_cache",
    "past_lens",
    "subsequence_begins",
    "block_indices",
    "block_indices_begins",
    "max_context_len",
];

pub const ROTATION_INPUTS: [&str; 3] = [
    "rotated_block_indices",
    "rotation_deltas",
    "rotation_trig_lut",
];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub op: Op,
    #[serde(default)]
    pub inputs: Vec<Source>,
    #[serde(default)]
    pub outputs: Vec<TensorDesc>,
}

impl Node {
    pub fn new(name: impl Into<String>, op: Op, inputs: Vec<Source>) -> Self {
        Self {
            name: name.into(),
            op,
            inputs,
            outputs: Vec::new(),
        }
    }

    pub fn with_outputs(mut self, outputs: Vec<TensorDesc>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn references(&self, node: &str) -> bool {
        self.inputs
            .iter()
            .any(|s| matches!(s, Source::Node { name, .. } if name == node))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphOutput {
    pub name: String,
    pub source: Source,
}

/// Operations a paged-attention rewrite needs from a model graph.
pub trait ModelGraph {
    fn variables(&self) -> &[Variable];
    fn parameters(&self) -> &[Parameter];
    fn parameter_mut(&mut self, name: &str) -> Option<&mut Parameter>;
    /// Recompute every node's output types and shapes, failing on conflicts.
    fn validate_and_infer_types(&mut self) -> Result<()>;
}

/// A structural transformation over a graph. Returns whether the graph changed.
pub trait GraphPass<G: ModelGraph + ?Sized> {
    fn name(&self) -> &'static str;
    fn run_on_graph(&self, graph: &mut G) -> Result<bool>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub variables: Vec<Variable>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub results: Vec<GraphOutput>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.name == name)
    }

    pub fn variable(&self, id: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.id == id)
    }

    pub fn add_parameter(&mut self, parameter: Parameter) {
        self.parameters.push(parameter);
    }

    pub fn add_node(&mut self, node: Node) {
        self.nodes.push(node);
    }

    pub fn add_result(&mut self, name: impl Into<String>, source: Source) {
        self.results.push(GraphOutput {
            name: name.into(),
            source,
        });
    }

    fn infer_node(
        &self,
        node: &Node,
        inputs: &[TensorDesc],
    ) -> std::result::Result<Vec<TensorDesc>, String> {
        match &node.op {
            Op::ReadValue { variable } => self
                .variable(variable)
                .map(|v| vec![v.desc.clone()])
                .ok_or_else(|| format!("unknown state variable `{variable}`")),
            Op::Assign { variable } => {
                let var = self
                    .variable(variable)
                    .ok_or_else(|| format!("unknown state variable `{variable}`"))?;
                let [value] = inputs else {
                    return Err(format!("expected 1 input, got {}", inputs.len()));
                };
                var.desc.merge(value).ok_or_else(|| {
                    format!(
                        "value {} is incompatible with variable {}",
                        value.shape, var.desc.shape
                    )
                })?;
                Ok(Vec::new())
            }
            Op::Concat { axis } => infer_concat(*axis, inputs).map(|d| vec![d]),
            Op::ScaledDotProductAttention => {
                if !(3..=4).contains(&inputs.len()) {
                    return Err(format!("expected 3 or 4 inputs, got {}", inputs.len()));
                }
                let (q, v) = (&inputs[0], &inputs[2]);
                let element_type = q
                    .element_type
                    .merge(v.element_type)
                    .ok_or("query and value element types differ")?;
                let shape = match (q.shape.dims(), v.shape.dims()) {
                    (Some(q_dims), Some(v_dims)) if !q_dims.is_empty() && !v_dims.is_empty() => {
                        let mut dims = q_dims.to_vec();
                        let last = dims.len() - 1;
                        dims[last] = v_dims[v_dims.len() - 1];
                        PartialShape::new(dims)
                    }
                    _ => q.shape.clone(),
                };
                Ok(vec![TensorDesc::new(element_type, shape)])
            }
            Op::PagedAttention {
                with_scores,
                with_rotation,
                ..
            } => infer_paged_attention(inputs, *with_scores, *with_rotation),
            Op::Opaque { .. } => Ok(node.outputs.clone()),
        }
    }
}

fn infer_concat(axis: usize, inputs: &[TensorDesc]) -> std::result::Result<TensorDesc, String> {
    let (first, rest) = inputs.split_first().ok_or("concat needs inputs")?;
    let mut element_type = first.element_type;
    let mut dims = match first.shape.dims() {
        Some(d) => d.to_vec(),
        None => return Ok(TensorDesc::new(element_type, PartialShape::dynamic_rank())),
    };
    if axis >= dims.len() {
        return Err(format!("axis {axis} out of range for rank {}", dims.len()));
    }
    for input in rest {
        element_type = element_type
            .merge(input.element_type)
            .ok_or("concat inputs have different element types")?;
        let Some(other) = input.shape.dims() else {
            return Ok(TensorDesc::new(element_type, PartialShape::dynamic_rank()));
        };
        if other.len() != dims.len() {
            return Err(format!("rank mismatch {} vs {}", dims.len(), other.len()));
        }
        for (i, (d, o)) in dims.iter_mut().zip(other).enumerate() {
            if i == axis {
                *d = match (d.get_length(), o.get_length()) {
                    (Some(a), Some(b)) => Dim::Static(a + b),
                    _ => Dim::Dynamic,
                };
            } else {
                let merged = d
                    .merge(*o)
                    .ok_or_else(|| format!("dimension {i} differs: {d} vs {o}"))?;
                *d = merged;
            }
        }
    }
    Ok(TensorDesc::new(element_type, PartialShape::new(dims)))
}

fn infer_paged_attention(
    inputs: &[TensorDesc],
    with_scores: bool,
    with_rotation: bool,
) -> std::result::Result<Vec<TensorDesc>, String> {
    let expected = PAGED_ATTENTION_INPUTS.len()
        + if with_rotation {
            ROTATION_INPUTS.len()
        } else {
            0
        };
    if inputs.len() != expected {
        return Err(format!("expected {expected} inputs, got {}", inputs.len()));
    }
    for (idx, name) in [(3, "key_cache"), (4, "value_cache")] {
        if let Some(rank) = inputs[idx].shape.rank() {
            if rank != 4 {
                return Err(format!("{name} must have rank 4, got {rank}"));
            }
        }
    }
    for (offset, name) in PAGED_ATTENTION_INPUTS.iter().enumerate().skip(5) {
        let element_type = inputs[offset].element_type;
        if !matches!(element_type, ElementType::I32 | ElementType::Dynamic) {
            return Err(format!("{name} must be i32, got {element_type:?}"));
        }
    }
    let query = &inputs[0];
    let mut outputs = vec![query.clone()];
    if with_scores {
        outputs.push(TensorDesc::new(ElementType::F32, PartialShape::dynamic(1)));
    }
    Ok(outputs)
}

impl ModelGraph for Graph {
    fn variables(&self) -> &[Variable] {
        &self.variables
    }

    fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    fn parameter_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.parameters.iter_mut().find(|p| p.name == name)
    }

    fn validate_and_infer_types(&mut self) -> Result<()> {
        let mut computed: HashMap<String, Vec<TensorDesc>> = HashMap::new();
        let mut inferred = Vec::with_capacity(self.nodes.len());

        for node in &self.nodes {
            let inputs = node
                .inputs
                .iter()
                .map(|source| self.resolve(source, &computed, &node.name))
                .collect::<Result<Vec<_>>>()?;
            let outputs =
                self.infer_node(node, &inputs)
                    .map_err(|reason| PagedAttnError::ShapeInference {
                        node: node.name.clone(),
                        reason,
                    })?;
            computed.insert(node.name.clone(), outputs.clone());
            inferred.push(outputs);
        }
        for result in &self.results {
            self.resolve(&result.source, &computed, &result.name)?;
        }

        for (node, outputs) in self.nodes.iter_mut().zip(inferred) {
            node.outputs = outputs;
        }
        Ok(())
    }
}

impl Graph {
    fn resolve(
        &self,
        source: &Source,
        computed: &HashMap<String, Vec<TensorDesc>>,
        consumer: &str,
    ) -> Result<TensorDesc> {
        let dangling = || PagedAttnError::DanglingInput {
            node: consumer.to_string(),
            source_name: source.label(),
        };
        match source {
            Source::Parameter(name) => self
                .parameter(name)
                .map(|p| p.desc.clone())
                .ok_or_else(dangling),
            Source::Node { name, port } => computed
                .get(name)
                .and_then(|outputs| outputs.get(*port))
                .cloned()
                .ok_or_else(dangling),
        }
    }
}
