//! The `moira` command line.
//!
//! Running without a subcommand starts the node. Every subcommand loads
//! the same configuration the node would, so offline operations see the
//! datadir exactly as a running node does.

use crate::config::{NodeConfig, StoreConfig};
use crate::files::{self, GenesisUnit, ImportStats};
use crate::ingress::{Accepted, Delivery, Ingress};
use crate::node::NodeCore;
use crate::{dbops, node, Error};
use moira_gossip::Processor;
use moira_kvdb::producer::Producer;
use clap::{Parser, Subcommand, ValueEnum};
use moira_dag::types::Epoch;
use moira_kvdb::producer::ProducerConfig;
use moira_kvdb::rocks::RocksConfig;
use moira_kvdb::routing::Router;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "moira", version, about = "DAG consensus node")]
pub struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory, overriding the configuration file.
    #[arg(long, global = true)]
    pub datadir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the node (the default when no subcommand is given).
    Node,
    /// Database maintenance.
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    /// Write chain data to files.
    Export {
        #[command(subcommand)]
        command: ExportCommand,
    },
    /// Replay chain data from files.
    Import {
        #[command(subcommand)]
        command: ImportCommand,
    },
    /// Verify stored data.
    Check {
        #[command(subcommand)]
        command: CheckCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum DbCommand {
    /// Compact every database.
    Compact,
    /// Migrate stale database layouts or rebuild derived indexes.
    Transform {
        #[arg(long, value_enum, default_value_t = Mode::Reformat)]
        mode: Mode,
    },
    /// Revert to the last sealed epoch and release the errlock.
    Heal {
        #[arg(long)]
        experimental: bool,
    },
    /// Dump the latest state into an auxiliary table for inspection.
    /// Leaves the datadir locked until healed.
    DumpSfc {
        #[arg(long)]
        experimental: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Reformat,
    Rebuild,
}

impl From<Mode> for dbops::TransformMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Reformat => Self::Reformat,
            Mode::Rebuild => Self::Rebuild,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum ExportCommand {
    /// Write events of an epoch range to a file, oldest first.
    Events {
        file: PathBuf,
        /// First epoch to export.
        #[arg(default_value_t = 1)]
        from: u32,
        /// Last epoch to export; defaults to the current epoch.
        to: Option<u32>,
    },
    /// Write a genesis file carrying the selected units.
    Genesis {
        file: PathBuf,
        /// Comma-separated unit names.
        #[arg(long, value_delimiter = ',', default_values_t = [
            String::from("ers"),
            String::from("brs"),
            String::from("evm"),
        ])]
        units: Vec<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum ImportCommand {
    /// Replay event files through validation into the engine.
    Events { files: Vec<PathBuf> },
}

#[derive(Debug, Subcommand)]
pub enum CheckCommand {
    /// Walk every stored block and verify receipts and the state trie.
    Evm,
}

/// Dispatches a parsed command line.
pub fn run(cli: Cli) -> Result<(), Error> {
    let config = load_config(&cli)?;
    let store_cfg = producer_config(&config.store);
    match cli.command.unwrap_or(Command::Node) {
        Command::Node => node::run(config, store_cfg, dbops::disabled_probe()),
        Command::Db { command } => run_db(&config, store_cfg, command),
        Command::Export { command } => run_export(config, store_cfg, command),
        Command::Import { command } => run_import(config, store_cfg, command),
        Command::Check { command } => run_check(config, store_cfg, command),
    }
}

fn load_config(cli: &Cli) -> Result<NodeConfig, Error> {
    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(datadir) = &cli.datadir {
        config.datadir = datadir.clone();
    }
    Ok(config)
}

/// Maps the store section of the node configuration onto the producer.
pub fn producer_config(store: &StoreConfig) -> ProducerConfig {
    ProducerConfig {
        flush_threshold: store.flush_threshold,
        rocks: RocksConfig {
            block_cache_size: Some(store.cache_bytes),
            ..RocksConfig::default()
        },
        ..ProducerConfig::default()
    }
}

fn run_db(config: &NodeConfig, cfg: ProducerConfig, command: DbCommand) -> Result<(), Error> {
    let datadir = &config.datadir;
    match command {
        DbCommand::Compact => {
            let dbs = dbops::compact(datadir, Router::default_layout(), cfg)?;
            println!("compacted {} databases", dbs.len());
        }
        DbCommand::Transform { mode } => {
            let shadows = dbops::stale_shadows(datadir)?;
            if !shadows.is_empty() {
                println!("resuming {} interrupted migrations", shadows.len());
            }
            let report = dbops::transform(
                datadir,
                Router::default_layout(),
                cfg,
                mode.into(),
                &dbops::disabled_probe(),
                config.minfreedisk,
            )?;
            println!(
                "transformed {} databases ({} entries)",
                report.touched.len(),
                report.entries
            );
        }
        DbCommand::Heal { experimental } => {
            require_experimental(experimental, "db heal")?;
            let report = dbops::heal(datadir, Router::default_layout(), cfg)?;
            println!(
                "healed to epoch {}; dropped {} partitions, flush id {}",
                report.sealed_epoch,
                report.dropped.len(),
                report.flush_id
            );
        }
        DbCommand::DumpSfc { experimental } => {
            require_experimental(experimental, "db dump-sfc")?;
            let report = dbops::dump_sfc(datadir, Router::default_layout(), cfg)?;
            println!("dumped {} state nodes under root {}", report.nodes, report.root);
        }
    }
    Ok(())
}

fn require_experimental(flag: bool, what: &'static str) -> Result<(), Error> {
    if flag {
        Ok(())
    } else {
        Err(Error::Experimental(what))
    }
}

fn run_export(
    config: NodeConfig,
    store_cfg: ProducerConfig,
    command: ExportCommand,
) -> Result<(), Error> {
    match command {
        ExportCommand::Events { file, from, to } => {
            let core = NodeCore::open(config, store_cfg)?;
            // Reading an epoch index creates its partition database, so
            // the open-ended default stops at the current epoch.
            let to = Epoch::new(to.unwrap_or_else(|| core.current_epoch().get()));
            let mut writer = io::BufWriter::new(std::fs::File::create(&file)?);
            let written =
                files::export_events(&core.store, &mut writer, Epoch::new(from), to)?;
            writer.flush()?;
            println!("exported {} events to {}", written, file.display());
        }
        ExportCommand::Genesis { file, units } => {
            let parsed = units
                .iter()
                .map(|name| {
                    GenesisUnit::parse(name).ok_or_else(|| Error::BadFile {
                        file: "genesis",
                        reason: format!("unknown unit {name}"),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let core = NodeCore::open(config, store_cfg)?;
            let evm = core.evm()?;
            let mut writer = io::BufWriter::new(std::fs::File::create(&file)?);
            files::export_genesis(&mut writer, &core.store, &evm, &parsed)?;
            writer.flush()?;
            println!("wrote genesis units [{}] to {}", units.join(","), file.display());
        }
    }
    Ok(())
}

fn run_import(
    config: NodeConfig,
    store_cfg: ProducerConfig,
    command: ImportCommand,
) -> Result<(), Error> {
    match command {
        ImportCommand::Events { files: paths } => {
            let core = NodeCore::open(config, store_cfg)?;
            let stop = Arc::new(AtomicBool::new(false));
            let runtime = tokio::runtime::Runtime::new()?;
            {
                let stop = stop.clone();
                runtime.spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        stop.store(true, Ordering::Relaxed);
                    }
                });
            }

            let delivery = BatchedDelivery {
                inner: core.ingress.as_ref(),
                producer: &core.producer,
            };
            let mut total = ImportStats::default();
            for path in paths {
                let mut reader = io::BufReader::new(std::fs::File::open(&path)?);
                let stats = files::import_events(&delivery, &mut reader, &stop)?;
                println!(
                    "{}: delivered {}, skipped {}{}",
                    path.display(),
                    stats.delivered,
                    stats.skipped,
                    if stats.interrupted { ", interrupted" } else { "" }
                );
                total.delivered += stats.delivered;
                total.skipped += stats.skipped;
                if stats.interrupted {
                    total.interrupted = true;
                    break;
                }
            }
            core.producer.flush()?;
            println!("imported {} events", total.delivered);
        }
    }
    Ok(())
}

/// Import delivery that flushes the producer whenever the unflushed
/// estimate crosses the configured threshold, so a long replay commits in
/// batches instead of one giant flush.
struct BatchedDelivery<'a> {
    inner: &'a Ingress<Processor>,
    producer: &'a Producer,
}

impl Delivery for BatchedDelivery<'_> {
    fn deliver(&self, event: moira_dag::Event) -> Result<Accepted, Error> {
        let accepted = self.inner.deliver(event)?;
        if self.producer.flush_needed() {
            self.producer.flush()?;
        }
        Ok(accepted)
    }
}

fn run_check(
    config: NodeConfig,
    store_cfg: ProducerConfig,
    command: CheckCommand,
) -> Result<(), Error> {
    match command {
        CheckCommand::Evm => {
            let core = NodeCore::open(config, store_cfg)?;
            let evm = core.evm()?;
            let report = files::check_evm(&core.store, &evm)?;
            for (from, to) in &report.pruned {
                println!("pruned blocks {from}..={to}");
            }
            println!(
                "checked {} blocks, {} receipts, {} state nodes",
                report.blocks, report.receipts, report.state_nodes
            );
        }
    }
    Ok(())
}
