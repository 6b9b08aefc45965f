// CCARENA: Orchestration and Metrics for Competing TCP Congestion-Control Experiments
// Copyright (C) 2024-2025 Roland Schmid <roschmi@ethz.ch> and Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use clap::{Parser, ValueEnum};
use indicatif::{HumanDuration, ProgressBar, ProgressStyle};

use ccarena::{
    config::{ExperimentConfig, HostSpec},
    emulator::{Emulator, LoopbackEmulator, NetnsEmulator},
    experiments::{interrupt_on, run_experiment},
    util,
};

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Args {
    /// Read the configuration from a JSON file. The bottleneck flags are ignored if given.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Scenario name, used to name the run directory.
    #[arg(short, long)]
    name: Option<String>,
    /// Bandwidth of the bottleneck link in Mbit/s.
    #[arg(long, default_value_t = 10.0)]
    bw_net: f64,
    /// One-way delay of the bottleneck link in ms.
    #[arg(long, default_value_t = 20.0)]
    delay: f64,
    /// Length of the competition window in seconds.
    #[arg(short, long)]
    duration: Option<f64>,
    /// Maximum queue size of the bottleneck in packets.
    #[arg(long)]
    max_queue: Option<u32>,
    /// Client host as `<name>=<algorithm>`. Repeat for every host.
    #[arg(long = "host", value_parser = parse_host)]
    hosts: Vec<HostSpec>,
    /// Root directory of the run directories.
    #[arg(short, long)]
    out_dir: Option<PathBuf>,
    /// Emulation platform.
    #[arg(short, long, value_enum, default_value_t = Platform::Netns)]
    emulator: Platform,
    /// Number of runs of the same configuration.
    #[arg(short, long, default_value_t = 1)]
    repeat: usize,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Platform {
    /// Linux network namespaces shaped with `tc`. Requires root.
    Netns,
    /// All hosts on the local machine, without shaping.
    Loopback,
}

fn parse_host(s: &str) -> Result<HostSpec, String> {
    match s.split_once('=') {
        Some((name, algorithm)) => Ok(HostSpec::new(name.trim(), algorithm.trim())),
        None => Err(format!("expected `<name>=<algorithm>`, got {s:?}")),
    }
}

fn build_config(args: &Args) -> Result<ExperimentConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => ExperimentConfig::from_file(path)?,
        None => ExperimentConfig::new(args.bw_net, args.delay),
    };
    if let Some(name) = &args.name {
        config.name = name.clone();
    }
    if let Some(duration) = args.duration {
        config.duration = duration;
    }
    if let Some(max_queue) = args.max_queue {
        config.max_queue = max_queue;
    }
    if !args.hosts.is_empty() {
        config.hosts = args.hosts.clone();
    }
    if let Some(out_dir) = &args.out_dir {
        config.out_dir = out_dir.clone();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = util::init_logging();
    let args = Args::parse();
    let config = build_config(&args)?;

    let emulator: Arc<dyn Emulator> = match args.emulator {
        Platform::Netns => Arc::new(NetnsEmulator::new()),
        Platform::Loopback => Arc::new(LoopbackEmulator::new()),
    };
    log::info!(
        "Running {} x {} on {}: {} Mbit/s, {} ms, queue {}",
        args.repeat,
        config.name,
        emulator.description(),
        config.bw_net,
        config.delay_ms,
        config.max_queue
    );

    let interrupt_rx = interrupt_on(tokio::signal::ctrl_c());

    let bar = multi.add(ProgressBar::new(args.repeat as u64));
    bar.set_style(ProgressStyle::with_template("{wide_bar} time: {elapsed}, eta: {msg} ")?);
    bar.set_message("?");
    bar.tick();

    let start_time = Instant::now();
    for i in 0..args.repeat {
        let summary = run_experiment(config.clone(), emulator.clone(), interrupt_rx.clone()).await?;
        bar.inc(1);
        bar.set_message(
            HumanDuration(Duration::from_secs_f64(
                start_time.elapsed().as_secs_f64() / (i + 1) as f64
                    * (args.repeat - i - 1) as f64,
            ))
            .to_string(),
        );
        bar.println(format!("{}", summary.result));
        if !summary.report.is_complete() {
            log::error!(
                "{} artifacts of {} could not be written",
                summary.report.failed.len(),
                summary.run_dir.display()
            );
        }
        if summary.result.interrupted {
            break;
        }
    }
    bar.finish();

    Ok(())
}
