//! Build operations: the explicit request/response records builders issue
//! instead of calling each other directly.
//!
//! A builder pushes ops onto an [`Ops`] queue and returns. The context
//! executes each op and resumes the builder through the op's callback,
//! which may push further ops. A build ends when the builder pushes its
//! [`ResponseBuildOp`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use fxhash::FxHashMap;

use crate::connector::{Connector, ScanRow, Scanner};
use crate::plan::NodeId;
use crate::state::State;
use crate::types::{Id, Key};

use super::cache::GetFlags;
use super::error::DriverError;
use super::row::DriverRow;

/// Outcome of a builder step.
pub type OpResult = Result<(), DriverError>;

/// Resumes a builder with one row set per request, in request order.
pub type RequestCallback<'a> = Box<dyn FnOnce(Vec<Vec<DriverRow>>, &mut Ops<'a>) -> OpResult + 'a>;

/// Resumes a builder with scanned rows.
pub type ScanCallback<'a> = Box<dyn FnOnce(Vec<ScanRow>, &mut Ops<'a>) -> OpResult + 'a>;

/// Resumes a builder with the states found, by id.
pub type GetStateCallback<'a> = Box<dyn FnOnce(FxHashMap<Id, State>, &mut Ops<'a>) -> OpResult + 'a>;

/// Asks source builders for rows. All requests of one op are served before
/// the callback runs, so a join can fetch every branch in one step.
pub struct RequestBuildOp<'a> {
    /// Requesting node.
    pub origin: NodeId,
    /// `(source node, key)` pairs.
    pub requests: Vec<(NodeId, Key)>,
    /// Continuation.
    pub callback: RequestCallback<'a>,
}

/// The answer of a build.
#[derive(Debug)]
pub struct ResponseBuildOp {
    /// Responding node.
    pub origin: NodeId,
    /// Key the rows answer.
    pub key: Key,
    /// Produced rows.
    pub rows: Vec<DriverRow>,
}

/// Asks an external scanner for rows.
pub struct ScanBuildOp<'a> {
    /// Requesting node.
    pub origin: NodeId,
    /// Scanner to read with.
    pub scanner: Arc<dyn Scanner>,
    /// Connector whose connection the scanner reads through.
    pub connector: Arc<dyn Connector>,
    /// Rows to read.
    pub key: Key,
    /// Continuation.
    pub callback: ScanCallback<'a>,
}

/// Asks the state cache directly.
pub struct GetStateBuildOp<'a> {
    /// Requesting node.
    pub origin: NodeId,
    /// Stateful node owning the states.
    pub node: NodeId,
    /// Ids to look up.
    pub ids: Vec<Id>,
    /// Lookup options.
    pub flags: GetFlags,
    /// Continuation.
    pub callback: GetStateCallback<'a>,
}

/// One build operation.
pub enum BuildOp<'a> {
    /// See [`RequestBuildOp`].
    Request(RequestBuildOp<'a>),
    /// See [`ResponseBuildOp`].
    Response(ResponseBuildOp),
    /// See [`ScanBuildOp`].
    Scan(ScanBuildOp<'a>),
    /// See [`GetStateBuildOp`].
    GetState(GetStateBuildOp<'a>),
}

impl BuildOp<'_> {
    /// Node that issued the op.
    #[must_use]
    pub fn origin(&self) -> NodeId {
        match self {
            Self::Request(op) => op.origin,
            Self::Response(op) => op.origin,
            Self::Scan(op) => op.origin,
            Self::GetState(op) => op.origin,
        }
    }

    /// Short op name, for logs and the journal.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Scan(_) => "scan",
            Self::GetState(_) => "get_state",
        }
    }
}

impl fmt::Debug for BuildOp<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(op) => f
                .debug_struct("Request")
                .field("origin", &op.origin)
                .field("requests", &op.requests)
                .finish_non_exhaustive(),
            Self::Response(op) => fmt::Debug::fmt(op, f),
            Self::Scan(op) => f
                .debug_struct("Scan")
                .field("origin", &op.origin)
                .field("connector", &op.connector.name())
                .field("key", &op.key)
                .finish_non_exhaustive(),
            Self::GetState(op) => f
                .debug_struct("GetState")
                .field("origin", &op.origin)
                .field("node", &op.node)
                .field("ids", &op.ids)
                .field("flags", &op.flags)
                .finish_non_exhaustive(),
        }
    }
}

/// FIFO of pending ops for one build.
#[derive(Default)]
pub struct Ops<'a> {
    queue: VecDeque<BuildOp<'a>>,
}

impl<'a> Ops<'a> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    /// Enqueues an op.
    pub fn push(&mut self, op: BuildOp<'a>) {
        self.queue.push_back(op);
    }

    /// Dequeues the oldest op.
    pub fn pop(&mut self) -> Option<BuildOp<'a>> {
        self.queue.pop_front()
    }

    /// Number of pending ops.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True when nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Enqueues a [`RequestBuildOp`].
    pub fn request<F>(&mut self, origin: NodeId, requests: Vec<(NodeId, Key)>, callback: F)
    where
        F: FnOnce(Vec<Vec<DriverRow>>, &mut Ops<'a>) -> OpResult + 'a,
    {
        self.push(BuildOp::Request(RequestBuildOp {
            origin,
            requests,
            callback: Box::new(callback),
        }));
    }

    /// Enqueues a [`ResponseBuildOp`].
    pub fn respond(&mut self, origin: NodeId, key: Key, rows: Vec<DriverRow>) {
        self.push(BuildOp::Response(ResponseBuildOp { origin, key, rows }));
    }

    /// Enqueues a [`ScanBuildOp`].
    pub fn scan<F>(
        &mut self,
        origin: NodeId,
        scanner: Arc<dyn Scanner>,
        connector: Arc<dyn Connector>,
        key: Key,
        callback: F,
    ) where
        F: FnOnce(Vec<ScanRow>, &mut Ops<'a>) -> OpResult + 'a,
    {
        self.push(BuildOp::Scan(ScanBuildOp {
            origin,
            scanner,
            connector,
            key,
            callback: Box::new(callback),
        }));
    }

    /// Enqueues a [`GetStateBuildOp`].
    pub fn get_state<F>(&mut self, origin: NodeId, node: NodeId, ids: Vec<Id>, flags: GetFlags, callback: F)
    where
        F: FnOnce(FxHashMap<Id, State>, &mut Ops<'a>) -> OpResult + 'a,
    {
        self.push(BuildOp::GetState(GetStateBuildOp {
            origin,
            node,
            ids,
            flags,
            callback: Box::new(callback),
        }));
    }
}
