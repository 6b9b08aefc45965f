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
//! Utility module collection of functions

use std::{
    fs,
    path::{Path, PathBuf},
};

use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;
use itertools::Itertools;
use log::LevelFilter;
use rayon::prelude::*;

use crate::experiments::CONFIG_FILE;

/// Initialize logging from `log4rs.yml` in the working directory. Without that file, fall back to
/// `pretty_env_logger`, which is configured by `RUST_LOG`.
///
/// Log records are routed through the returned [`MultiProgress`], so progress bars added to it are
/// not torn by log output.
pub fn init_logging() -> MultiProgress {
    init_logging_from(Path::new("log4rs.yml"))
}

fn init_logging_from(config: &Path) -> MultiProgress {
    let (logger, level) = build_logger(config);
    let multi = MultiProgress::new();
    if LogWrapper::new(multi.clone(), logger).try_init().is_ok() {
        log::set_max_level(level);
    }
    multi
}

fn build_logger(config: &Path) -> (Box<dyn log::Log>, LevelFilter) {
    if config.exists() {
        match log4rs::config::load_config_file(config, Default::default()) {
            Ok(config) => {
                let logger = log4rs::Logger::new(config);
                let level = logger.max_log_level();
                return (Box::new(logger), level);
            }
            Err(e) => eprintln!("Cannot initialize logging from {}: {e}", config.display()),
        }
    }
    let mut builder = pretty_env_logger::formatted_builder();
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    let logger = builder.build();
    let level = logger.filter();
    (Box::new(logger), level)
}

/// All run directories below `data_root` whose name contains `filter`. A run directory is any
/// directory holding a `config.json`. Sorted by name, which orders runs of the same scenario by
/// their timestamp.
pub fn run_dirs(data_root: impl AsRef<Path>, filter: &str) -> Vec<PathBuf> {
    let data_root = data_root.as_ref();
    let entries = match fs::read_dir(data_root) {
        Ok(entries) => entries,
        Err(e) => {
            log::error!("Cannot read {}: {e}", data_root.display());
            return Vec::new();
        }
    };
    entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.join(CONFIG_FILE).is_file())
        .filter(|path| {
            path.file_name()
                .map(|n| n.to_string_lossy().contains(filter))
                .unwrap_or(false)
        })
        .sorted()
        .collect_vec()
}

/// Allows mapping all filtered run directories in parallel.
pub fn par_map_runs<F, T>(
    data_root: impl AsRef<Path>,
    filter: &str,
    f: F,
) -> impl ParallelIterator<Item = T>
where
    F: Fn(&Path) -> T,
    F: Sync + Send,
    T: Send,
{
    run_dirs(data_root, filter)
        .into_par_iter()
        .map(move |run_dir| f(&run_dir))
}

pub trait PathBufExt: Sized {
    fn then(self, p: impl AsRef<Path>) -> PathBuf;

    /// Push `p`, with its first `{}` replaced by `ts`.
    fn then_ts(self, p: impl AsRef<str>, ts: &str) -> PathBuf {
        self.then(p.as_ref().replacen("{}", ts, 1))
    }
}

impl PathBufExt for PathBuf {
    fn then(mut self, p: impl AsRef<Path>) -> PathBuf {
        self.push(p);
        self
    }
}

impl PathBufExt for &Path {
    fn then(self, p: impl AsRef<Path>) -> PathBuf {
        let mut path = self.to_path_buf();
        path.push(p);
        path
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn finds_run_dirs() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["reno_bbr_2024-01-02", "reno_bbr_2024-01-01", "cubic_2024-01-01"] {
            let run = dir.path().then(name);
            fs::create_dir(&run).unwrap();
            fs::write(run.then(CONFIG_FILE), "{}").unwrap();
        }
        fs::create_dir(dir.path().then("reno_incomplete")).unwrap();

        let runs = run_dirs(dir.path(), "reno");
        assert_eq!(
            runs,
            vec![
                dir.path().then("reno_bbr_2024-01-01"),
                dir.path().then("reno_bbr_2024-01-02"),
            ]
        );
        assert_eq!(run_dirs(dir.path(), "").len(), 3);
        assert!(run_dirs(dir.path().then("missing"), "").is_empty());
    }

    #[test]
    fn logger_from_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().then("log4rs.yml");
        fs::write(
            &config,
            "appenders:\n  stderr:\n    kind: console\nroot:\n  level: warn\n  appenders:\n    - stderr\n",
        )
        .unwrap();
        let (_, level) = build_logger(&config);
        assert_eq!(level, LevelFilter::Warn);

        // a broken file falls back to pretty_env_logger
        fs::write(&config, "appenders: [").unwrap();
        let _ = build_logger(&config);
    }

    #[test]
    fn log_through_progress_bars() {
        let missing = Path::new("missing/log4rs.yml");
        let multi = init_logging_from(missing);
        let bar = multi.add(indicatif::ProgressBar::hidden());
        log::info!("[util] logging while a bar is shown");
        bar.finish();
        // the first logger stays installed
        init_logging_from(missing);
    }

    #[test]
    fn path_with_timestamp() {
        let p = PathBuf::from("plots").then_ts("throughput_{}.html", "2024-01-01");
        assert_eq!(p, PathBuf::from("plots/throughput_2024-01-01.html"));
    }
}
