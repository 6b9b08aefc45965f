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
use std::path::{Path, PathBuf};

use clap::Parser;
use rayon::iter::ParallelIterator;
use serde::Serialize;

use ccarena::{
    experiments::reanalyze,
    report::RESULT_FILE,
    util::{self, PathBufExt},
};

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Args {
    /// Directory holding the run directories.
    #[arg(short, long, default_value = "./data/")]
    data_root: PathBuf,
    /// Only process runs whose directory name contains this string.
    #[arg(short, long, default_value = "")]
    filter: String,
    /// Process runs that have a `result.json` already.
    #[arg(short, long)]
    replace: bool,
    /// Write one line per run and algorithm into `<data_root>/overview_<timestamp>.csv`.
    #[arg(long)]
    overview: bool,
}

/// One line of the overview over all processed runs.
#[derive(Debug, Serialize)]
struct OverviewRow {
    run_id: String,
    name: String,
    bw_net: f64,
    delay_ms: f64,
    max_queue: u32,
    algorithm: String,
    avg_bitrate_mbps: f64,
    total_retransmits: u64,
    latency_initial_ms: Option<f64>,
    latency_final_ms: Option<f64>,
    fetch_mean: Option<f64>,
    fetch_std_dev: Option<f64>,
    warnings: usize,
}

fn process_run(run_dir: &Path, replace: bool) -> Vec<OverviewRow> {
    if run_dir.then(RESULT_FILE).exists() && !replace {
        log::trace!("Skipping {} as it has been processed already", run_dir.display());
        return Vec::new();
    }
    log::info!("Processing {}", run_dir.display());
    let (result, report) = match reanalyze(run_dir) {
        Ok(x) => x,
        Err(e) => {
            log::error!("Cannot process {}: {e}", run_dir.display());
            return Vec::new();
        }
    };
    for (path, e) in &report.failed {
        log::error!("Cannot write {}: {e}", path.display());
    }

    let warnings = result.warnings().count();
    result
        .algorithms
        .iter()
        .map(|a| OverviewRow {
            run_id: result.run_id.clone(),
            name: result.name.clone(),
            bw_net: result.config.bw_net,
            delay_ms: result.config.delay_ms,
            max_queue: result.config.max_queue,
            algorithm: a.algorithm.clone(),
            avg_bitrate_mbps: a.summary.avg_bitrate_mbps,
            total_retransmits: a.summary.total_retransmits,
            latency_initial_ms: a.latency_initial_ms,
            latency_final_ms: a.latency_final_ms,
            fetch_mean: result.fetch_stats.map(|s| s.mean),
            fetch_std_dev: result.fetch_stats.map(|s| s.std_dev),
            warnings,
        })
        .collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    util::init_logging();
    let args = Args::parse();

    let num_runs = util::run_dirs(&args.data_root, &args.filter).len();
    log::info!("Found {num_runs} runs in {}", args.data_root.display());

    let mut rows: Vec<OverviewRow> =
        util::par_map_runs(&args.data_root, &args.filter, |run_dir| {
            process_run(run_dir, args.replace)
        })
        .flatten_iter()
        .collect();
    rows.sort_by(|a, b| a.run_id.cmp(&b.run_id));

    if args.overview {
        let path = args.data_root.clone().then(format!(
            "overview_{}.csv",
            chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
        ));
        let mut csv = csv::Writer::from_path(&path)?;
        for row in &rows {
            csv.serialize(row)?;
        }
        csv.flush()?;
        log::info!("Wrote {} rows to {}", rows.len(), path.display());
    }

    Ok(())
}
