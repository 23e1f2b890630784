// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Engine proxy: the engine lives on a worker thread and consumes one ordered
//! channel of framed requests; callers talk to it through an async
//! [`EngineProxy`] that keeps a local [`Mirror`](strata_core::Mirror) in step.
#![forbid(unsafe_code)]

mod client;
mod worker;

pub use client::{EngineProxy, ProxyError};
pub use worker::{spawn_engine, WorkerHandle};
