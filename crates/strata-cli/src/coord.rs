// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! `branch:turn[:tick]` coordinates on the command line.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use strata_core::{BranchId, Btt, Engine, FactStore, Tick, Turn};

/// A coordinate as typed by the user; the tick may be left to the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct At {
    /// Branch name.
    pub branch: BranchId,
    /// Turn.
    pub turn: Turn,
    /// Tick; `None` means the last tick of `turn`.
    pub tick: Option<Tick>,
}

impl At {
    /// Pins the coordinate, filling a missing tick from the branch's turn end.
    pub fn resolve<S: FactStore>(&self, engine: &Engine<S>) -> Result<Btt> {
        if !engine.tree().contains(&self.branch) {
            bail!("unknown branch {}", self.branch);
        }
        let tick = self
            .tick
            .unwrap_or_else(|| engine.turn_end(&self.branch, self.turn));
        Ok(Btt::new(self.branch.clone(), self.turn, tick))
    }
}

impl FromStr for At {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        // Branch names may contain ':'; the numbers are always at the end.
        let (head, last) = s
            .rsplit_once(':')
            .with_context(|| format!("expected branch:turn[:tick], got {s:?}"))?;
        let (branch, turn, tick) = match head.rsplit_once(':') {
            Some((branch, turn)) if turn.parse::<Turn>().is_ok() => (branch, turn, Some(last)),
            _ => (head, last, None),
        };
        if branch.is_empty() {
            bail!("empty branch name in {s:?}");
        }
        let turn = turn.parse::<Turn>().with_context(|| format!("bad turn in {s:?}"))?;
        let tick = tick
            .map(str::parse::<Tick>)
            .transpose()
            .with_context(|| format!("bad tick in {s:?}"))?;
        Ok(Self {
            branch: BranchId::from(branch),
            turn,
            tick,
        })
    }
}

impl fmt::Display for At {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tick {
            Some(tick) => write!(f, "{}:{}:{tick}", self.branch, self.turn),
            None => write!(f, "{}:{}", self.branch, self.turn),
        }
    }
}
