//! CLI argument parsing and command handlers

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use crate::engine::{EngineConfig, IndexEngine, PlanEntry};
use crate::manifest::{JsonManifestSource, ManifestSource};
use crate::progress::{BarProgress, NullProgress, ProgressTracker};

/// Pkgdex: on-disk inverted search index builder for package manifests
#[derive(Parser, Debug)]
#[command(
    name = "pkgdex",
    version,
    about = "Build and maintain an inverted search index over package manifests",
    long_about = "Pkgdex maintains an on-disk inverted search index mapping tokens \
                  extracted from package manifests to the packages and manifest \
                  locations they occur in. Small install/remove deltas are folded in \
                  cheaply; larger changes trigger a full merge of the dictionary."
)]
pub struct Cli {
    /// Enable verbose logging (can be repeated for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Index directory
    #[arg(short, long, value_name = "DIR", default_value = "index")]
    pub index_dir: PathBuf,

    /// Directory holding JSON manifest documents
    #[arg(short, long, value_name = "DIR", default_value = "manifests")]
    pub manifest_dir: PathBuf,

    /// Show progress bars on stderr
    #[arg(long)]
    pub progress: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Full index build or refresh over every known package
    ///
    /// Indexes every manifest found under the manifest directory, merging
    /// with the existing dictionary when one exists. Pending fast-update
    /// logs are absorbed into the merge.
    Index {
        /// Discard the existing index and rebuild from scratch
        #[arg(short, long)]
        force: bool,
    },

    /// Apply an install/remove plan incrementally
    ///
    /// The plan is a JSON array of {"added": ..., "removed": ...} entries.
    /// Small plans only update the fast logs; past the backlog threshold the
    /// whole index is rebuilt.
    Update {
        /// Path to the JSON plan file
        #[arg(value_name = "PLAN")]
        plan: PathBuf,

        /// Largest fast-add backlog accepted before a full rebuild
        #[arg(long, value_name = "N")]
        max_fast_pkgs: Option<usize>,
    },

    /// Discard the index and rebuild it from scratch
    Rebuild,

    /// Report whether a consistent index exists and covers the known packages
    Check,
}

impl Cli {
    pub fn execute(self) -> Result<()> {
        // Setup logging based on verbosity
        let log_level = match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
            .init();

        let source = JsonManifestSource::open(&self.manifest_dir)
            .with_context(|| format!("reading manifests from {:?}", self.manifest_dir))?;
        let installed = source
            .fmris()
            .context("listing packages from the manifest directory")?;

        let mut config = EngineConfig::default();
        if let Command::Update {
            max_fast_pkgs: Some(n),
            ..
        } = &self.command
        {
            config.max_fast_indexed_pkgs = *n;
        }
        let progress: Box<dyn ProgressTracker> = if self.progress {
            Box::new(BarProgress::default())
        } else {
            Box::new(NullProgress)
        };
        let mut engine =
            IndexEngine::new(&self.index_dir, source, config).with_progress(progress);

        match self.command {
            Command::Index { force } => handle_index(&mut engine, &installed, force),
            Command::Update { ref plan, .. } => handle_update(&mut engine, &installed, plan),
            Command::Rebuild => handle_rebuild(&mut engine, &installed),
            Command::Check => handle_check(&mut engine, &installed, &self.index_dir),
        }
    }
}

fn handle_index(
    engine: &mut IndexEngine<JsonManifestSource>,
    installed: &[String],
    force: bool,
) -> Result<()> {
    if force {
        engine
            .rebuild_index_from_scratch(installed, None)
            .context("rebuilding index")?;
    } else {
        engine
            .server_update_index(installed, None)
            .context("updating index")?;
    }
    println!("Indexed {} packages", installed.len());
    Ok(())
}

fn handle_update(
    engine: &mut IndexEngine<JsonManifestSource>,
    installed: &[String],
    plan_path: &Path,
) -> Result<()> {
    let file = File::open(plan_path).with_context(|| format!("opening plan {:?}", plan_path))?;
    let plan: Vec<PlanEntry> =
        serde_json::from_reader(BufReader::new(file)).context("parsing update plan")?;
    engine
        .client_update_index(&plan, installed, None)
        .context("applying update plan")?;
    println!("Applied {} plan entries", plan.len());
    Ok(())
}

fn handle_rebuild(
    engine: &mut IndexEngine<JsonManifestSource>,
    installed: &[String],
) -> Result<()> {
    engine
        .rebuild_index_from_scratch(installed, None)
        .context("rebuilding index")?;
    println!("Rebuilt index over {} packages", installed.len());
    Ok(())
}

fn handle_check(
    engine: &mut IndexEngine<JsonManifestSource>,
    installed: &[String],
    index_dir: &Path,
) -> Result<()> {
    if !engine.check_index_existence().context("checking index")? {
        anyhow::bail!("no index found in {:?}", index_dir);
    }
    engine
        .check_index_has_exactly_fmris(installed)
        .context("index does not match the installed package set")?;
    println!("Index is consistent and covers {} packages", installed.len());
    Ok(())
}
