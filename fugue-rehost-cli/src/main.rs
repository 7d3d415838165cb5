//! fugue-rehost command-line front end

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};

use fugue_rehost::{AddressMap, DeviceModel, RehostConfig, Trace, TraceEvent};

#[derive(Parser)]
#[command(name = "fugue-rehost", version, about = "Learn and replay peripheral models from MMIO traces")]
struct Cli {
    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Learn a device model from a tab-separated trace
    Train {
        /// Recorded trace
        trace: PathBuf,
        /// Where to write the model
        #[arg(short, long)]
        out: PathBuf,
        /// Peripheral address map (default: Arduino Due)
        #[arg(long)]
        map: Option<PathBuf>,
        /// Tunables
        #[arg(long)]
        config: Option<PathBuf>,
        /// Collapse equivalent states after training
        #[arg(long)]
        optimize: bool,
    },
    /// Collapse equivalent states of a trained model
    Optimize {
        model: PathBuf,
        /// Where to write the result (default: overwrite the input)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Print state machine sizes, or every state machine with --dump
    Stats {
        model: PathBuf,
        #[arg(long)]
        dump: bool,
    },
    /// Replay a trace against a model and compare the reads
    Replay {
        model: PathBuf,
        trace: PathBuf,
    },
    /// Merge two models trained on different recordings
    Merge {
        first: PathBuf,
        second: PathBuf,
        #[arg(short, long)]
        out: PathBuf,
    },
}

fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn load(path: &Path) -> anyhow::Result<DeviceModel> {
    DeviceModel::load(path).with_context(|| format!("failed to load model {}", path.display()))
}

fn train(
    trace: &Path,
    out: &Path,
    map: Option<&Path>,
    config: Option<&Path>,
    optimize: bool,
) -> anyhow::Result<()> {
    let map = match map {
        Some(path) => AddressMap::from_path(path)?,
        None => AddressMap::arduino_due(),
    };
    let config = match config {
        Some(path) => RehostConfig::from_path(path)?,
        None => RehostConfig::default(),
    };

    let mut device = DeviceModel::new(map, config);
    device.train_from_path(trace)?;
    if optimize {
        device.optimize();
    }

    let stats = device.graph_stats();
    println!(
        "{} peripherals, {} states, {} edges",
        device.peripherals().len(), stats.states, stats.edges,
    );
    device.save(out)?;
    Ok(())
}

fn replay(model: &Path, trace: &Path) -> anyhow::Result<()> {
    let mut device = load(model)?;
    let trace = Trace::from_path(trace)?;

    let mut reads = 0usize;
    let mut matched = 0usize;
    for event in trace.events() {
        match *event {
            TraceEvent::Read { address, record } => {
                reads += 1;
                let value = device.read_memory(address, record.size);
                if value == record.value {
                    matched += 1;
                } else {
                    log::debug!(
                        "read {:#010x}: recorded {:#x}, replayed {:#x}",
                        address, record.value, value,
                    );
                }
            }
            TraceEvent::Write { address, value, size } => {
                device.write_memory(address, size, value);
            }
            TraceEvent::Interrupt { irq, .. } => {
                let pending = device.get_interrupts();
                if !pending.contains_key(&irq) {
                    log::info!("recorded interrupt {} was not raised by replay", irq);
                }
            }
        }
    }
    device.join_interrupters();

    println!("{}/{} reads matched", matched, reads);
    print!("{}", serde_yaml::to_string(&device.get_runtime_stats())?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    match cli.command {
        Commands::Train { trace, out, map, config, optimize } => {
            train(&trace, &out, map.as_deref(), config.as_deref(), optimize)?;
        }
        Commands::Optimize { model, out } => {
            let mut device = load(&model)?;
            let before = device.graph_stats();
            device.optimize();
            let after = device.graph_stats();
            println!("{} -> {} states, {} -> {} edges", before.states, after.states, before.edges, after.edges);
            device.save(out.as_deref().unwrap_or(model.as_path()))?;
        }
        Commands::Stats { model, dump } => {
            let device = load(&model)?;
            for peripheral in device.peripherals() {
                if dump {
                    print!("{}", peripheral);
                } else {
                    let stats = peripheral.graph_stats();
                    println!(
                        "{:<12} states: {:>4} edges: {:>4} self loops: {:>4} wildcards: {:>4}",
                        peripheral.name(), stats.states, stats.edges, stats.self_loops, stats.wildcard_edges,
                    );
                }
            }
        }
        Commands::Replay { model, trace } => replay(&model, &trace)?,
        Commands::Merge { first, second, out } => {
            let mut device = load(&first)?;
            let rejected = device.merge(load(&second)?);
            for name in rejected.iter() {
                log::warn!("{} disagrees between recordings, kept the first", name);
            }
            device.save(&out)?;
        }
    }

    Ok(())
}
