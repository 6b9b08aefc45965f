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
//! Library to run and evaluate competitions of TCP congestion-control algorithms on an emulated
//! bottleneck network.

pub mod aggregate;
pub mod config;
pub mod emulator;
pub mod experiments;
pub mod extract;
pub mod records;
pub mod report;
pub mod result;
pub mod topology;
pub mod util;

#[cfg(test)]
mod test;

pub mod prelude {
    pub use super::{
        config::{ExperimentConfig, HostSpec, ProbeSchedule},
        emulator::{Emulator, LoopbackEmulator, NetnsEmulator},
        experiments::{run_experiment, Experiment, ExperimentError, RunSummary},
        result::ExperimentResult,
    };
}
