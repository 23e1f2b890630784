// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Engine worker: owns the engine on a dedicated thread and executes framed
//! requests strictly in arrival order.

use std::thread::{self, JoinHandle};

use strata_core::{Engine, EngineError, FactStore, Mirror};
use strata_proto::{
    wire::{decode_envelope, encode_reply},
    Envelope, Reply, Request, Response,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, debug_span, warn};

use crate::client::{EngineProxy, ProxyError};

/// One framed envelope plus the slot its reply goes to.
#[derive(Debug)]
pub(crate) struct Job {
    pub(crate) packet: Vec<u8>,
    pub(crate) reply: Option<oneshot::Sender<Vec<u8>>>,
}

/// Join handle of the engine thread.
#[derive(Debug)]
pub struct WorkerHandle<S: FactStore> {
    thread: JoinHandle<Engine<S>>,
}

impl<S: FactStore> WorkerHandle<S> {
    /// Waits for the worker to drain its queue and hands the engine back.
    ///
    /// The worker stops once every [`EngineProxy`] has been dropped, so this
    /// blocks until then.
    pub fn join(self) -> Result<Engine<S>, ProxyError> {
        self.thread.join().map_err(|_| ProxyError::WorkerPanicked)
    }
}

/// Moves `engine` onto its own thread and returns a proxy whose mirror
/// starts at the engine's current coordinate.
pub fn spawn_engine<S>(engine: Engine<S>) -> Result<(EngineProxy, WorkerHandle<S>), ProxyError>
where
    S: FactStore + 'static,
{
    let mirror = Mirror::capture(&engine, engine.btt())?;
    let (tx, rx) = mpsc::unbounded_channel();
    let thread = thread::Builder::new()
        .name("strata-engine".into())
        .spawn(move || run(engine, rx))
        .map_err(|_| ProxyError::Closed)?;
    Ok((EngineProxy::new(tx, mirror), WorkerHandle { thread }))
}

fn run<S: FactStore>(mut engine: Engine<S>, mut rx: mpsc::UnboundedReceiver<Job>) -> Engine<S> {
    debug!(btt = %engine.btt(), "engine worker started");
    while let Some(job) = rx.blocking_recv() {
        let env = match decode_envelope(&job.packet) {
            Ok((env, _)) => env,
            Err(err) => {
                warn!(%err, "dropping undecodable packet");
                continue;
            }
        };
        let span = debug_span!("request", id = env.id, op = env.request.op_name());
        let _enter = span.enter();

        let response =
            execute(&mut engine, &env).unwrap_or_else(|err| Response::Error(err.to_string()));
        if env.silent {
            if let Response::Error(msg) = &response {
                warn!(%msg, "silent request failed");
            }
            continue;
        }
        let Some(slot) = job.reply else {
            continue;
        };
        let delta = match &env.since {
            Some(since) if !matches!(env.request, Request::Pull) => {
                match engine.diff(since, engine.btt()) {
                    Ok(delta) => Some(delta),
                    Err(err) => {
                        warn!(%err, %since, "catch-up delta failed");
                        None
                    }
                }
            }
            _ => None,
        };
        let reply = Reply {
            id: env.id,
            btt: engine.btt().clone(),
            response,
            delta,
        };
        match encode_reply(&reply) {
            // A dropped receiver means the caller gave up; the effect stands.
            Ok(bytes) => {
                let _ = slot.send(bytes);
            }
            Err(err) => warn!(%err, "reply encoding failed"),
        }
    }
    debug!(btt = %engine.btt(), "engine worker stopped");
    engine
}

fn execute<S: FactStore>(engine: &mut Engine<S>, env: &Envelope) -> Result<Response, EngineError> {
    let response = match &env.request {
        Request::TimeTravel { branch, turn, tick } => {
            engine.time_travel(branch.clone(), *turn, *tick)?;
            Response::Time(engine.btt().clone())
        }
        Request::NextTurn => Response::Time(engine.next_turn()?),
        Request::Pull => match &env.since {
            Some(since) => Response::Delta(engine.diff(since, engine.btt())?),
            None => Response::Error("pull needs a starting coordinate".into()),
        },
        Request::Btt => Response::Time(engine.btt().clone()),
        Request::NewGraph { name, kind } => {
            engine.new_graph(name.clone(), *kind)?;
            Response::Ack
        }
        Request::AddNode { graph, node } => {
            engine.add_node(graph, node)?;
            Response::Ack
        }
        Request::DelNode { graph, node } => {
            engine.del_node(graph, node)?;
            Response::Ack
        }
        Request::AddEdge {
            graph,
            orig,
            dest,
            idx,
        } => {
            engine.add_edge(graph, orig, dest, *idx)?;
            Response::Ack
        }
        Request::DelEdge {
            graph,
            orig,
            dest,
            idx,
        } => {
            engine.del_edge(graph, orig, dest, *idx)?;
            Response::Ack
        }
        Request::SetGraphVal { graph, key, value } => {
            engine.set_graph_val(graph, key, value.clone())?;
            Response::Ack
        }
        Request::SetNodeVal {
            graph,
            node,
            key,
            value,
        } => {
            engine.set_node_val(graph, node, key, value.clone())?;
            Response::Ack
        }
        Request::SetEdgeVal {
            graph,
            orig,
            dest,
            idx,
            key,
            value,
        } => {
            engine.set_edge_val(graph, orig, dest, *idx, key, value.clone())?;
            Response::Ack
        }
        Request::Commit => {
            let rows = engine.commit()?;
            debug!(rows, "committed");
            Response::Ack
        }
    };
    Ok(response)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use strata_core::{Btt, EngineConfig, GraphKind, MemoryFactStore};

    use super::*;

    fn envelope(request: Request, since: Option<Btt>) -> Envelope {
        Envelope {
            id: 0,
            silent: false,
            since,
            request,
        }
    }

    #[test]
    fn failed_requests_become_error_responses() {
        let mut engine = Engine::new(MemoryFactStore::new(), EngineConfig::default());
        let err = execute(
            &mut engine,
            &envelope(
                Request::AddNode {
                    graph: "nowhere".into(),
                    node: "a".into(),
                },
                None,
            ),
        );
        assert!(matches!(err, Err(EngineError::NoSuchGraph(_))));
    }

    #[test]
    fn pull_reports_changes_since_the_given_coordinate() {
        let mut engine = Engine::new(MemoryFactStore::new(), EngineConfig::default());
        engine.new_graph("g", GraphKind::DiGraph).unwrap();
        let before = engine.btt().clone();
        engine.add_node("g", "a").unwrap();

        let pulled = execute(&mut engine, &envelope(Request::Pull, Some(before))).unwrap();
        let Response::Delta(delta) = pulled else {
            unreachable!("pull answers with a delta")
        };
        assert_eq!(delta.graphs["g"].nodes.get("a"), Some(&true));

        let unanchored = execute(&mut engine, &envelope(Request::Pull, None)).unwrap();
        assert!(matches!(unanchored, Response::Error(_)));
    }
}
