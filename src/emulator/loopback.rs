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
//! Emulator running all hosts directly on the local machine.
//!
//! There is no shaping and every host is reachable at `127.0.0.1`. Queue depths come from a
//! pluggable source. Useful for dry runs of the orchestration, and for testing.

use std::{
    collections::HashSet,
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use tokio::process::Command;

use super::{EmulationSetupError, Emulator};
use crate::topology::TopologySpec;

type DepthSource = Box<dyn Fn() -> u64 + Send + Sync>;

pub struct LoopbackEmulator {
    depth: DepthSource,
    hosts: Mutex<HashSet<String>>,
    ifaces: Mutex<HashSet<String>>,
    fail_on_start: bool,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl Default for LoopbackEmulator {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackEmulator {
    /// Emulator whose queues are always empty.
    pub fn new() -> Self {
        Self::with_depth_source(|| 0)
    }

    pub fn with_depth_source(f: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        Self {
            depth: Box::new(f),
            hosts: Mutex::new(HashSet::new()),
            ifaces: Mutex::new(HashSet::new()),
            fail_on_start: false,
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    /// Let `start` fail after registering the first host.
    pub fn fail_on_start(mut self) -> Self {
        self.fail_on_start = true;
        self
    }

    /// Number of calls to `start`
    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Number of calls to `stop`
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Emulator for LoopbackEmulator {
    fn description(&self) -> &'static str {
        "loopback"
    }

    async fn start(&self, spec: &TopologySpec) -> Result<(), EmulationSetupError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let (Ok(mut hosts), Ok(mut ifaces)) = (self.hosts.lock(), self.ifaces.lock()) else {
            return Err(EmulationSetupError::NotRunning);
        };
        for node in spec.nodes() {
            hosts.insert(node.name.clone());
            if self.fail_on_start {
                return Err(EmulationSetupError::CommandFailed {
                    cmd: format!("add host {}", node.name),
                    status: "injected failure".to_string(),
                    stderr: String::new(),
                });
            }
            ifaces.insert(node.host_iface());
            ifaces.insert(node.switch_iface());
        }
        Ok(())
    }

    fn host_addr(&self, host: &str) -> Option<Ipv4Addr> {
        let hosts = self.hosts.lock().ok()?;
        hosts.contains(host).then_some(Ipv4Addr::LOCALHOST)
    }

    async fn queue_depth(&self, iface: &str) -> Result<u64, EmulationSetupError> {
        let known = self
            .ifaces
            .lock()
            .map(|ifaces| ifaces.contains(iface))
            .unwrap_or(false);
        if !known {
            return Err(EmulationSetupError::UnknownInterface(iface.to_string()));
        }
        Ok((self.depth)())
    }

    fn command(&self, host: &str, program: &str) -> Result<Command, EmulationSetupError> {
        if self.host_addr(host).is_none() {
            return Err(EmulationSetupError::UnknownHost(host.to_string()));
        }
        Ok(Command::new(program))
    }

    async fn stop(&self) -> Result<(), EmulationSetupError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut hosts) = self.hosts.lock() {
            hosts.clear();
        }
        if let Ok(mut ifaces) = self.ifaces.lock() {
            ifaces.clear();
        }
        Ok(())
    }
}
