//! Plan nodes and operator parameters.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::types::{Field, FieldType, Value};

use super::field::Fields;
use super::function::Function;

/// Stable node identity, the 64-bit hash of the node name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Derives the id of the node called `name`.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        Self(fxhash::hash64(name))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Whether a filter keeps the lineage of the rows it passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Linking {
    /// Output rows carry their input's lineage.
    #[default]
    Linked,
    /// Output rows carry no lineage.
    Unlinked,
}

/// How strongly an invalidation reaches its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvalidationStrength {
    /// Load the target state from storage if it is not cached.
    #[default]
    Strong,
    /// Only invalidate target states already cached in the context.
    Weak,
}

/// A plan-authored invalidation edge from a stateful node to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation {
    /// Name of the stateful node to invalidate.
    pub target: String,
    /// Maps this node's fields onto the target's id fields. Empty means
    /// target ids are resolved through lineage.
    pub key_fields: Vec<(String, String)>,
    /// Fire only when one of these fields changed. `None` fires on any update.
    pub update_mask: Option<Vec<String>>,
    /// Reach of the invalidation.
    pub strength: InvalidationStrength,
}

impl Invalidation {
    /// Lineage-resolved, strong invalidation of `target`.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            key_fields: Vec::new(),
            update_mask: None,
            strength: InvalidationStrength::Strong,
        }
    }

    /// Resolves target ids by mapping `source_field` to `target_field`.
    #[must_use]
    pub fn key_field(mut self, source_field: impl Into<String>, target_field: impl Into<String>) -> Self {
        self.key_fields.push((source_field.into(), target_field.into()));
        self
    }

    /// Restricts firing to updates touching `fields`.
    #[must_use]
    pub fn update_mask<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.update_mask = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the strength.
    #[must_use]
    pub fn strength(mut self, strength: InvalidationStrength) -> Self {
        self.strength = strength;
        self
    }
}

/// Leaf read of an external table.
#[derive(Debug, Clone)]
pub struct ScanNode {
    /// Catalog table name.
    pub table: String,
    /// Declared output schema.
    pub fields: Vec<Field>,
    /// Fields forming the row id.
    pub id_fields: Vec<String>,
    /// Plan-authored invalidation edges.
    pub invalidations: Vec<Invalidation>,
}

/// Row predicate.
#[derive(Debug, Clone)]
pub struct FilterNode {
    /// Input node name.
    pub source: String,
    /// Boolean predicate.
    pub predicate: Function,
    /// Input fields passed to the predicate.
    pub args: Vec<String>,
    /// Lineage handling.
    pub linking: Linking,
}

/// One output column of a projection.
#[derive(Debug, Clone)]
pub enum Projected {
    /// Copy of an input field.
    Field(String),
    /// Typed constant.
    Constant(Value, FieldType),
    /// Function of input fields.
    Function {
        /// Function to apply.
        function: Function,
        /// Input fields passed to it.
        args: Vec<String>,
    },
}

/// Column projection.
#[derive(Debug, Clone)]
pub struct ProjectNode {
    /// Input node name.
    pub source: String,
    /// Output name -> computation, in output order.
    pub projections: Vec<(String, Projected)>,
}

/// One side of an equijoin.
#[derive(Debug, Clone)]
pub struct JoinBranch {
    /// Input node name.
    pub source: String,
    /// Join fields, positionally matched across branches.
    pub fields: Vec<String>,
}

/// Inner equality join over two or more branches.
#[derive(Debug, Clone)]
pub struct EquijoinNode {
    /// Joined branches.
    pub branches: Vec<JoinBranch>,
}

/// Cross product flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrossJoinMode {
    /// Empty when any input is empty.
    #[default]
    Inner,
    /// Empty inputs contribute a single all-null row.
    Full,
}

/// Cartesian product of its sources.
#[derive(Debug, Clone)]
pub struct CrossJoinNode {
    /// Input node names.
    pub sources: Vec<String>,
    /// Product flavour.
    pub mode: CrossJoinMode,
}

/// A branch looked up once per driving row.
#[derive(Debug, Clone)]
pub struct LookupBranch {
    /// Branch node name.
    pub source: String,
    /// `(driving field, branch field)` pairs forming the lookup key.
    pub fields: Vec<(String, String)>,
}

/// Left lookup join: each driving row is extended with matching branch rows.
#[derive(Debug, Clone)]
pub struct LookupJoinNode {
    /// Driving input.
    pub source: String,
    /// Looked-up branches.
    pub branches: Vec<LookupBranch>,
}

/// Concatenation of same-schema sources.
#[derive(Debug, Clone)]
pub struct UnionNode {
    /// Input node names.
    pub sources: Vec<String>,
    /// Optional `long` field recording the source position.
    pub index_field: Option<String>,
}

/// Expands a list field into one row per element.
#[derive(Debug, Clone)]
pub struct UnnestNode {
    /// Input node name.
    pub source: String,
    /// List field to expand.
    pub list_field: String,
    /// Output field holding the element.
    pub element_field: String,
    /// Optional `long` field holding the element position.
    pub index_field: Option<String>,
}

/// Groups rows by one field, collecting the rest into a list of structs.
#[derive(Debug, Clone)]
pub struct ListAggregateNode {
    /// Input node name.
    pub source: String,
    /// Grouping field.
    pub group_field: String,
    /// Output list field.
    pub list_field: String,
}

/// Inline constant rows.
#[derive(Debug, Clone)]
pub struct ValuesNode {
    /// Output schema.
    pub fields: Vec<Field>,
    /// Rows in schema order.
    pub rows: Vec<Vec<Value>>,
    /// Field used as row id; defaults to the row position.
    pub id_field: Option<String>,
}

/// Materializes its input as per-row state.
#[derive(Debug, Clone)]
pub struct PersistNode {
    /// Input node name.
    pub source: String,
    /// Fields forming the row id.
    pub id_fields: Vec<String>,
    /// Plan-authored invalidation edges.
    pub invalidations: Vec<Invalidation>,
}

/// Operator of a plan node.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// See [`ScanNode`].
    Scan(ScanNode),
    /// See [`FilterNode`].
    Filter(FilterNode),
    /// See [`ProjectNode`].
    Project(ProjectNode),
    /// See [`EquijoinNode`].
    Equijoin(EquijoinNode),
    /// See [`CrossJoinNode`].
    CrossJoin(CrossJoinNode),
    /// See [`LookupJoinNode`].
    LookupJoin(LookupJoinNode),
    /// See [`UnionNode`].
    Union(UnionNode),
    /// See [`UnnestNode`].
    Unnest(UnnestNode),
    /// See [`ListAggregateNode`].
    ListAggregate(ListAggregateNode),
    /// See [`ValuesNode`].
    Values(ValuesNode),
    /// See [`PersistNode`].
    Persist(PersistNode),
}

impl NodeKind {
    /// Names of the input nodes, in order.
    #[must_use]
    pub fn source_names(&self) -> Vec<&str> {
        match self {
            Self::Scan(_) | Self::Values(_) => Vec::new(),
            Self::Filter(n) => vec![n.source.as_str()],
            Self::Project(n) => vec![n.source.as_str()],
            Self::Unnest(n) => vec![n.source.as_str()],
            Self::ListAggregate(n) => vec![n.source.as_str()],
            Self::Persist(n) => vec![n.source.as_str()],
            Self::Equijoin(n) => n.branches.iter().map(|b| b.source.as_str()).collect(),
            Self::CrossJoin(n) => n.sources.iter().map(String::as_str).collect(),
            Self::Union(n) => n.sources.iter().map(String::as_str).collect(),
            Self::LookupJoin(n) => std::iter::once(n.source.as_str())
                .chain(n.branches.iter().map(|b| b.source.as_str()))
                .collect(),
        }
    }

    /// Whether nodes of this kind own per-row state.
    #[must_use]
    pub fn is_stateful(&self) -> bool {
        matches!(self, Self::Scan(_) | Self::Persist(_))
    }

    /// Short operator name.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Scan(_) => "scan",
            Self::Filter(_) => "filter",
            Self::Project(_) => "project",
            Self::Equijoin(_) => "equijoin",
            Self::CrossJoin(_) => "cross_join",
            Self::LookupJoin(_) => "lookup_join",
            Self::Union(_) => "union",
            Self::Unnest(_) => "unnest",
            Self::ListAggregate(_) => "list_aggregate",
            Self::Values(_) => "values",
            Self::Persist(_) => "persist",
        }
    }

    /// Id fields of a stateful node.
    #[must_use]
    pub fn id_fields(&self) -> Option<&[String]> {
        match self {
            Self::Scan(n) => Some(&n.id_fields),
            Self::Persist(n) => Some(&n.id_fields),
            _ => None,
        }
    }

    /// Declared invalidation edges of a stateful node.
    #[must_use]
    pub fn invalidations(&self) -> &[Invalidation] {
        match self {
            Self::Scan(n) => &n.invalidations,
            Self::Persist(n) => &n.invalidations,
            _ => &[],
        }
    }
}

/// An immutable, resolved plan node.
#[derive(Debug, Clone)]
pub struct PNode {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) sources: SmallVec<[NodeId; 4]>,
    pub(crate) fields: Fields,
    pub(crate) kind: NodeKind,
}

impl PNode {
    /// Node id.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Node name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Input node ids, in order.
    #[must_use]
    pub fn sources(&self) -> &[NodeId] {
        &self.sources
    }

    /// Output schema.
    #[must_use]
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Operator and its parameters.
    #[must_use]
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Whether this node owns per-row state.
    #[must_use]
    pub fn is_stateful(&self) -> bool {
        self.kind.is_stateful()
    }
}

impl fmt::Display for PNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind.kind_name(), self.name)
    }
}
