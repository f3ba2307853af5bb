//! Plan graph: operator nodes, schemas and dependency ordering.
//!
//! A [`Plan`] is built once through [`PlanBuilder`] and never mutated.
//! Construction walks the nodes reachable from the root, rejects duplicate
//! names and ids, toposorts the dependency graph into waves and resolves
//! every node's field schema upstream-first.

mod builder;
mod error;
mod field;
mod function;
mod graph;
mod node;
mod toposort;

pub use builder::PlanBuilder;
pub use error::PlanError;
pub use field::Fields;
pub use function::Function;
pub use graph::{InvalidationSink, Plan, SinkResolution};
pub use node::{
    CrossJoinMode, CrossJoinNode, EquijoinNode, FilterNode, Invalidation, InvalidationStrength, JoinBranch,
    Linking, ListAggregateNode, LookupBranch, LookupJoinNode, NodeId, NodeKind, PNode, PersistNode, ProjectNode,
    Projected, ScanNode, UnionNode, UnnestNode, ValuesNode,
};
pub use toposort::{toposort, CycleError};

#[cfg(test)]
mod tests;
