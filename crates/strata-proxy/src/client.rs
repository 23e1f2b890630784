// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Async proxy for an engine running on a worker thread.

use strata_core::{EngineError, Mirror, MirrorError};
use strata_proto::{
    wire::{decode_reply, encode_envelope, WireError},
    BranchId, Btt, Delta, EdgeIndex, Envelope, GraphKind, Request, RequestId, Response, Tick,
    Turn, Value,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::worker::Job;

/// Proxy failures.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The worker is gone.
    #[error("engine worker closed")]
    Closed,
    /// The worker thread panicked.
    #[error("engine worker panicked")]
    WorkerPanicked,
    /// Framing or CBOR failure.
    #[error(transparent)]
    Wire(#[from] WireError),
    /// The engine rejected the request.
    #[error("engine error: {0}")]
    Remote(String),
    /// The local mirror rejected a delta or an optimistic write.
    #[error(transparent)]
    Mirror(#[from] MirrorError),
    /// The engine could not be captured at startup.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// A reply answered some other request.
    #[error("reply {got} does not answer request {expected}")]
    Mismatch {
        /// Id sent.
        expected: RequestId,
        /// Id received.
        got: RequestId,
    },
    /// The reply has the wrong shape for the request.
    #[error("unexpected response to {0}")]
    Unexpected(&'static str),
}

/// Client side of the engine boundary.
///
/// Synchronous calls wait for the worker's reply and bring the mirror up to
/// the engine's coordinate before returning. Silent calls update the mirror
/// optimistically and return immediately; [`EngineProxy::pull`] catches up
/// with everything else.
///
/// Dropping a pending call abandons the reply, not the engine-side effect.
#[derive(Debug)]
pub struct EngineProxy {
    tx: mpsc::UnboundedSender<Job>,
    mirror: Mirror,
    next_id: RequestId,
}

impl EngineProxy {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Job>, mirror: Mirror) -> Self {
        Self {
            tx,
            mirror,
            next_id: 0,
        }
    }

    /// Local shadow of the engine state.
    pub fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    /// Mutable mirror, for subscribing to changes.
    pub fn mirror_mut(&mut self) -> &mut Mirror {
        &mut self.mirror
    }

    fn envelope(&mut self, request: Request, silent: bool) -> Envelope {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        Envelope {
            id,
            silent,
            since: (!silent).then(|| self.mirror.btt().clone()),
            request,
        }
    }

    /// Sends `request` and waits for the outcome. Any catch-up delta in the
    /// reply is applied to the mirror, even when the request itself failed.
    pub async fn request(&mut self, request: Request) -> Result<Response, ProxyError> {
        let env = self.envelope(request, false);
        let op = env.request.op_name();
        let packet = encode_envelope(&env)?;
        let (slot, reply) = oneshot::channel();
        self.tx
            .send(Job {
                packet,
                reply: Some(slot),
            })
            .map_err(|_| ProxyError::Closed)?;
        let bytes = reply.await.map_err(|_| ProxyError::Closed)?;
        let (reply, _) = decode_reply(&bytes)?;
        if reply.id != env.id {
            return Err(ProxyError::Mismatch {
                expected: env.id,
                got: reply.id,
            });
        }
        if let Some(delta) = &reply.delta {
            self.mirror.apply_delta(delta)?;
        }
        debug!(id = env.id, op, btt = %reply.btt, "reply");
        match reply.response {
            Response::Error(msg) => Err(ProxyError::Remote(msg)),
            response => Ok(response),
        }
    }

    /// Queues `request` without waiting. Failures are only logged by the worker.
    pub fn send_silent(&mut self, request: Request) -> Result<(), ProxyError> {
        let env = self.envelope(request, true);
        let packet = encode_envelope(&env)?;
        self.tx
            .send(Job {
                packet,
                reply: None,
            })
            .map_err(|_| ProxyError::Closed)
    }

    async fn ack(&mut self, request: Request) -> Result<(), ProxyError> {
        let op = request.op_name();
        match self.request(request).await? {
            Response::Ack => Ok(()),
            _ => Err(ProxyError::Unexpected(op)),
        }
    }

    async fn time(&mut self, request: Request) -> Result<Btt, ProxyError> {
        let op = request.op_name();
        match self.request(request).await? {
            Response::Time(btt) => Ok(btt),
            _ => Err(ProxyError::Unexpected(op)),
        }
    }

    /// Moves the engine cursor; the mirror follows.
    pub async fn time_travel(
        &mut self,
        branch: impl Into<BranchId>,
        turn: Turn,
        tick: Option<Tick>,
    ) -> Result<Btt, ProxyError> {
        self.time(Request::TimeTravel {
            branch: branch.into(),
            turn,
            tick,
        })
        .await
    }

    /// Advances the engine to the next turn.
    pub async fn next_turn(&mut self) -> Result<Btt, ProxyError> {
        self.time(Request::NextTurn).await
    }

    /// The engine's cursor.
    pub async fn btt(&mut self) -> Result<Btt, ProxyError> {
        self.time(Request::Btt).await
    }

    /// Brings the mirror up to the engine's coordinate and returns the delta
    /// that was applied.
    pub async fn pull(&mut self) -> Result<Delta, ProxyError> {
        match self.request(Request::Pull).await? {
            Response::Delta(delta) => {
                self.mirror.apply_delta(&delta)?;
                Ok(delta)
            }
            _ => Err(ProxyError::Unexpected("pull")),
        }
    }

    /// Creates a graph on the engine and in the mirror.
    pub async fn new_graph(&mut self, name: &str, kind: GraphKind) -> Result<(), ProxyError> {
        self.ack(Request::NewGraph {
            name: name.to_owned(),
            kind,
        })
        .await?;
        self.mirror.add_graph(name, kind);
        Ok(())
    }

    /// Creates a node.
    pub async fn add_node(&mut self, graph: &str, node: &str) -> Result<(), ProxyError> {
        self.ack(Request::AddNode {
            graph: graph.to_owned(),
            node: node.to_owned(),
        })
        .await
    }

    /// Deletes a node and its incident edges.
    pub async fn del_node(&mut self, graph: &str, node: &str) -> Result<(), ProxyError> {
        self.ack(Request::DelNode {
            graph: graph.to_owned(),
            node: node.to_owned(),
        })
        .await
    }

    /// Creates an edge.
    pub async fn add_edge(
        &mut self,
        graph: &str,
        orig: &str,
        dest: &str,
        idx: EdgeIndex,
    ) -> Result<(), ProxyError> {
        self.ack(Request::AddEdge {
            graph: graph.to_owned(),
            orig: orig.to_owned(),
            dest: dest.to_owned(),
            idx,
        })
        .await
    }

    /// Deletes an edge.
    pub async fn del_edge(
        &mut self,
        graph: &str,
        orig: &str,
        dest: &str,
        idx: EdgeIndex,
    ) -> Result<(), ProxyError> {
        self.ack(Request::DelEdge {
            graph: graph.to_owned(),
            orig: orig.to_owned(),
            dest: dest.to_owned(),
            idx,
        })
        .await
    }

    /// Writes a graph attribute; `None` deletes it.
    pub async fn set_graph_val(
        &mut self,
        graph: &str,
        key: &str,
        value: Option<Value>,
    ) -> Result<(), ProxyError> {
        self.ack(Request::SetGraphVal {
            graph: graph.to_owned(),
            key: key.to_owned(),
            value,
        })
        .await
    }

    /// Writes a node attribute; `None` deletes it.
    pub async fn set_node_val(
        &mut self,
        graph: &str,
        node: &str,
        key: &str,
        value: Option<Value>,
    ) -> Result<(), ProxyError> {
        self.ack(Request::SetNodeVal {
            graph: graph.to_owned(),
            node: node.to_owned(),
            key: key.to_owned(),
            value,
        })
        .await
    }

    /// Writes an edge attribute; `None` deletes it.
    pub async fn set_edge_val(
        &mut self,
        graph: &str,
        orig: &str,
        dest: &str,
        idx: EdgeIndex,
        key: &str,
        value: Option<Value>,
    ) -> Result<(), ProxyError> {
        self.ack(Request::SetEdgeVal {
            graph: graph.to_owned(),
            orig: orig.to_owned(),
            dest: dest.to_owned(),
            idx,
            key: key.to_owned(),
            value,
        })
        .await
    }

    /// Fire-and-forget node attribute write, applied to the mirror first.
    pub fn set_node_val_silent(
        &mut self,
        graph: &str,
        node: &str,
        key: &str,
        value: Option<Value>,
    ) -> Result<(), ProxyError> {
        self.mirror.set_node_val(graph, node, key, value.clone())?;
        self.send_silent(Request::SetNodeVal {
            graph: graph.to_owned(),
            node: node.to_owned(),
            key: key.to_owned(),
            value,
        })
    }

    /// Fire-and-forget graph attribute write, applied to the mirror first.
    pub fn set_graph_val_silent(
        &mut self,
        graph: &str,
        key: &str,
        value: Option<Value>,
    ) -> Result<(), ProxyError> {
        self.mirror.set_graph_val(graph, key, value.clone())?;
        self.send_silent(Request::SetGraphVal {
            graph: graph.to_owned(),
            key: key.to_owned(),
            value,
        })
    }

    /// Fire-and-forget node creation, applied to the mirror first.
    pub fn add_node_silent(&mut self, graph: &str, node: &str) -> Result<(), ProxyError> {
        self.mirror.add_node(graph, node)?;
        self.send_silent(Request::AddNode {
            graph: graph.to_owned(),
            node: node.to_owned(),
        })
    }

    /// Flushes and commits the engine's fact store.
    pub async fn commit(&mut self) -> Result<(), ProxyError> {
        self.ack(Request::Commit).await
    }
}
