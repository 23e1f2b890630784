// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Command-line inspection of persisted Strata fact stores.
//!
//! Every command prints JSON on stdout; logs go to stderr.

pub mod cli;
pub mod coord;

pub use cli::{config_service, run, Cli, Commands};
pub use coord::At;
