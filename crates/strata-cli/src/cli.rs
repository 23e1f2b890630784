// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Argument parsing and command dispatch for the `strata` binary.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use strata_config::{CliPrefs, ConfigService, FsConfigStore};
use strata_core::{BranchId, Btt, Engine, EngineConfig, GraphKind, MemoryFactStore, MirrorState};
use tracing::{debug, info};

use crate::coord::At;

/// Top-level arguments.
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(version, about = "Inspect, diff and digest Strata fact stores")]
pub struct Cli {
    /// Fact store file; defaults to the saved preference
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,
    /// Directory holding config files; defaults to the platform config dir
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,
    /// What to do.
    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create an empty store, optionally with graphs
    Init {
        /// Digraph to create (repeatable)
        #[arg(long = "graph")]
        graphs: Vec<String>,
        /// Multigraph to create (repeatable)
        #[arg(long = "multigraph")]
        multigraphs: Vec<String>,
    },
    /// List branches with their divergence points and high-water marks
    Branches,
    /// List graphs
    Graphs,
    /// Materialize one graph at a coordinate
    Show {
        /// Graph name
        graph: String,
        /// Coordinate as branch:turn[:tick]; defaults to the saved cursor
        #[arg(long)]
        at: Option<At>,
    },
    /// Changes leading from one coordinate to another
    Diff {
        /// Starting coordinate, branch:turn[:tick]
        from: At,
        /// Ending coordinate, branch:turn[:tick]
        to: At,
    },
    /// blake3 digest of the whole world at a coordinate
    Digest {
        /// Coordinate as branch:turn[:tick]; defaults to the saved cursor
        #[arg(long)]
        at: Option<At>,
    },
    /// Every recorded value of a node attribute on one branch
    History {
        /// Graph name
        graph: String,
        /// Node name
        node: String,
        /// Attribute key
        key: String,
        /// Branch; defaults to the saved cursor's branch
        #[arg(long)]
        branch: Option<String>,
    },
    /// Show or update saved preferences
    Prefs {
        /// Store used when --store is omitted
        #[arg(long)]
        default_store: Option<PathBuf>,
        /// Log filter used when RUST_LOG is unset
        #[arg(long)]
        log_filter: Option<String>,
    },
}

/// Config service rooted at `dir`, or at the platform config dir.
pub fn config_service(dir: Option<&Path>) -> Result<ConfigService<FsConfigStore>> {
    let store = match dir {
        Some(dir) => FsConfigStore::with_dir(dir),
        None => FsConfigStore::new(),
    }
    .context("failed to open config dir")?;
    Ok(ConfigService::new(store))
}

fn open(path: &Path, config: EngineConfig) -> Result<Engine> {
    if !path.exists() {
        bail!("no store at {}; run `strata init` first", path.display());
    }
    let store = MemoryFactStore::open(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let engine = Engine::load(store, config).context("failed to load engine state")?;
    debug!(store = %path.display(), btt = %engine.btt(), "store opened");
    Ok(engine)
}

fn resolve(engine: &Engine, at: Option<&At>) -> Result<Btt> {
    at.map_or_else(|| Ok(engine.btt().clone()), |at| at.resolve(engine))
}

fn store_path(store: Option<&Path>, prefs: &CliPrefs) -> Result<PathBuf> {
    store
        .map(Path::to_path_buf)
        .or_else(|| prefs.store.clone())
        .context("no --store given and no default store saved (see `strata prefs`)")
}

/// Runs one command and returns its JSON output.
pub fn run(cli: Cli, config: &ConfigService<FsConfigStore>, prefs: &CliPrefs) -> Result<Value> {
    let Cli { store, command, .. } = cli;
    let engine_config = || -> Result<EngineConfig> {
        config
            .load::<EngineConfig>()
            .context("failed to load engine config")
    };
    let load = || -> Result<Engine> { open(&store_path(store.as_deref(), prefs)?, engine_config()?) };

    let out = match command {
        Commands::Init {
            graphs,
            multigraphs,
        } => {
            let path = store_path(store.as_deref(), prefs)?;
            if path.exists() {
                bail!("{} already exists", path.display());
            }
            let fact_store = MemoryFactStore::open(&path)?;
            let mut engine = Engine::load(fact_store, engine_config()?)?;
            for name in graphs {
                engine.new_graph(name, GraphKind::DiGraph)?;
            }
            for name in multigraphs {
                engine.new_graph(name, GraphKind::MultiDiGraph)?;
            }
            engine.commit()?;
            info!(store = %path.display(), "store initialised");
            json!({
                "store": path,
                "btt": engine.btt(),
                "graphs": graph_list(&engine),
            })
        }
        Commands::Branches => {
            let engine = load()?;
            serde_json::to_value(engine.branches().collect::<Vec<_>>())?
        }
        Commands::Graphs => graph_list(&load()?),
        Commands::Show { graph, at } => {
            let engine = load()?;
            engine.graph_kind(&graph)?;
            let at = resolve(&engine, at.as_ref())?;
            let state = MirrorState::read(&engine, &at);
            json!({ "btt": at, "graph": state.graphs.get(&graph) })
        }
        Commands::Diff { from, to } => {
            let engine = load()?;
            let (a, b) = (from.resolve(&engine)?, to.resolve(&engine)?);
            serde_json::to_value(engine.diff(&a, &b)?)?
        }
        Commands::Digest { at } => {
            let engine = load()?;
            let at = resolve(&engine, at.as_ref())?;
            let digest = MirrorState::read(&engine, &at).digest()?;
            json!({ "btt": at, "digest": hex::encode(digest.as_bytes()) })
        }
        Commands::History {
            graph,
            node,
            key,
            branch,
        } => {
            let engine = load()?;
            let branch = branch.map_or_else(|| engine.branch().clone(), BranchId::from);
            let entries = engine
                .node_val_history(&graph, &node, &key, &branch)
                .into_iter()
                .map(|((turn, tick), value)| json!({ "turn": turn, "tick": tick, "value": value }))
                .collect::<Vec<_>>();
            json!({ "branch": branch, "entries": entries })
        }
        Commands::Prefs {
            default_store,
            log_filter,
        } => {
            let prefs = config
                .update(|prefs: &mut CliPrefs| {
                    if let Some(store) = default_store {
                        prefs.store = Some(store);
                    }
                    if let Some(filter) = log_filter {
                        prefs.log_filter = filter;
                    }
                })
                .context("failed to save preferences")?;
            serde_json::to_value(prefs)?
        }
    };
    Ok(out)
}

fn graph_list(engine: &Engine) -> Value {
    engine
        .graphs()
        .map(|(name, kind)| json!({ "name": name, "kind": kind }))
        .collect()
}
