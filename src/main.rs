use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::Parser;

use nandsim::cli::Cli;
use nandsim::output::{self, OutputSet};
use nandsim::params::Params;
use nandsim::raid::{self, RaidConfig, RaidLevel};
use nandsim::sim::{SimOptions, Ssd};
use nandsim::sync::GcLock;
use nandsim::trace::TraceReader;

fn main() {
    nandsim::logger::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            // Argument errors report failure but exit clean.
            std::process::exit(0);
        }
    };
    if let Err(msg) = cli.validate() {
        log::error!("{msg}");
        log::error!("argument error: -1");
        std::process::exit(0);
    }

    log::info!("nandsim - SSD internal simulation tool");
    if let Err(err) = run(&cli) {
        log::error!("{err:#}");
        std::process::exit(1);
    }
    log::info!("The simulation is completed!");
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let params = Params::load(&cli.parameter)
        .with_context(|| format!("loading parameters from {}", cli.parameter.display()))?;
    let timestamp = cli
        .timestamp
        .clone()
        .unwrap_or_else(output::current_timestamp);
    let out_base = PathBuf::from("raw").join(&timestamp);

    log::info!("parameter file: {}", cli.parameter.display());
    log::info!("trace file    : {}", cli.trace_file.display());
    log::info!("device        : {params}");

    if cli.is_raid() {
        let cfg = RaidConfig {
            level: if cli.raid5 {
                RaidLevel::Raid5
            } else {
                RaidLevel::Raid0
            },
            ndisk: cli.ndisk.unwrap_or(0),
            is_gcsync: cli.gcsync,
            is_gclock: cli.gclock,
            is_gcdefer: cli.gcdefer,
            gc_time_window: cli.gc_time_window.unwrap_or(0),
        };
        raid::simulate_raid(&params, &cli.trace_file, &out_base, &cfg)
            .context("RAID simulation failed")?;
    } else {
        let opts = SimOptions {
            diskid: cli.diskid.unwrap_or(0),
            ndisk: cli.ndisk.unwrap_or(0),
            is_gcsync: cli.gcsync,
            is_gclock: cli.gclock,
            is_gcdefer: cli.gcdefer,
            gc_time_window: cli.gc_time_window.unwrap_or(0),
            gclock: cli
                .gclock
                .then(|| Arc::new(Mutex::new(GcLock::new()))),
        };
        let trace = TraceReader::open(&cli.trace_file)?;
        let out = OutputSet::create(&out_base)
            .with_context(|| format!("creating result directory {}", out_base.display()))?;
        let mut ssd = Ssd::new(params, trace, Some(out), opts);
        ssd.run().context("simulation failed")?;
        log::info!("results written to {}", out_base.display());
    }
    Ok(())
}
