// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Wire schema for talking to a Strata engine running behind a proxy.
//!
//! A client sends [`Envelope`]s carrying one [`Request`] each and, unless the
//! envelope is silent, receives one [`Reply`]. Both travel as checksummed
//! CBOR packets (see [`wire`]).

pub use strata_core::{BranchId, Btt, Delta, EdgeIndex, GraphKind, Tick, Turn, Value};

use serde::{Deserialize, Serialize};

pub mod wire;

/// Correlates a reply with the envelope that caused it.
pub type RequestId = u64;

/// Operations the engine worker understands.
///
/// Value-carrying writes use `None` to delete the key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Move the engine cursor; an unknown branch is forked from the current coordinate.
    TimeTravel {
        /// Target branch.
        branch: BranchId,
        /// Target turn.
        turn: Turn,
        /// Target tick; `None` means the end of `turn`.
        tick: Option<Tick>,
    },
    /// Advance to tick 0 of the next turn.
    NextTurn,
    /// Ask for the delta from the envelope's `since` to the engine's cursor.
    Pull,
    /// Ask for the engine's cursor.
    Btt,
    /// Create a graph.
    NewGraph {
        /// Graph name.
        name: String,
        /// Digraph or multigraph.
        kind: GraphKind,
    },
    /// Create a node.
    AddNode {
        /// Graph name.
        graph: String,
        /// Node name.
        node: String,
    },
    /// Delete a node and its incident edges.
    DelNode {
        /// Graph name.
        graph: String,
        /// Node name.
        node: String,
    },
    /// Create an edge.
    AddEdge {
        /// Graph name.
        graph: String,
        /// Origin node.
        orig: String,
        /// Destination node.
        dest: String,
        /// Edge index; always 0 on a digraph.
        idx: EdgeIndex,
    },
    /// Delete an edge.
    DelEdge {
        /// Graph name.
        graph: String,
        /// Origin node.
        orig: String,
        /// Destination node.
        dest: String,
        /// Edge index.
        idx: EdgeIndex,
    },
    /// Write a graph attribute.
    SetGraphVal {
        /// Graph name.
        graph: String,
        /// Attribute key.
        key: String,
        /// New value.
        value: Option<Value>,
    },
    /// Write a node attribute.
    SetNodeVal {
        /// Graph name.
        graph: String,
        /// Node name.
        node: String,
        /// Attribute key.
        key: String,
        /// New value.
        value: Option<Value>,
    },
    /// Write an edge attribute.
    SetEdgeVal {
        /// Graph name.
        graph: String,
        /// Origin node.
        orig: String,
        /// Destination node.
        dest: String,
        /// Edge index.
        idx: EdgeIndex,
        /// Attribute key.
        key: String,
        /// New value.
        value: Option<Value>,
    },
    /// Flush pending writes and commit the fact store.
    Commit,
}

impl Request {
    /// Stable operation name, used in logs.
    pub fn op_name(&self) -> &'static str {
        match self {
            Request::TimeTravel { .. } => "time_travel",
            Request::NextTurn => "next_turn",
            Request::Pull => "pull",
            Request::Btt => "btt",
            Request::NewGraph { .. } => "new_graph",
            Request::AddNode { .. } => "add_node",
            Request::DelNode { .. } => "del_node",
            Request::AddEdge { .. } => "add_edge",
            Request::DelEdge { .. } => "del_edge",
            Request::SetGraphVal { .. } => "set_graph_val",
            Request::SetNodeVal { .. } => "set_node_val",
            Request::SetEdgeVal { .. } => "set_edge_val",
            Request::Commit => "commit",
        }
    }
}

/// Outcome of one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// The request succeeded and has nothing to report.
    Ack,
    /// The engine's cursor.
    Time(Btt),
    /// Changes between the envelope's `since` and the engine's cursor.
    Delta(Delta),
    /// The request failed; the engine state is unchanged by it.
    Error(String),
}

/// A request plus routing metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Caller-chosen id echoed in the reply.
    pub id: RequestId,
    /// Fire-and-forget: the worker sends no reply.
    pub silent: bool,
    /// Coordinate of the caller's mirror. When present, the reply carries the
    /// delta from here to the engine's cursor after the request ran.
    pub since: Option<Btt>,
    /// The operation.
    pub request: Request,
}

/// The worker's answer to a non-silent [`Envelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Id of the envelope being answered.
    pub id: RequestId,
    /// Engine cursor after the request ran.
    pub btt: Btt,
    /// Outcome.
    pub response: Response,
    /// Catch-up delta for the caller's mirror, when `since` was given.
    pub delta: Option<Delta>,
}

#[cfg(test)]
mod integrity_tests;
