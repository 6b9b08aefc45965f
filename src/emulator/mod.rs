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
//! Module to start, query, and stop the emulated network.
//!
//! The emulation platform is reached only through the [`Emulator`] trait. A running topology is
//! owned by a [`TopologyHandle`], which guarantees that the topology is stopped exactly once.

mod loopback;
mod netns;

pub use loopback::LoopbackEmulator;
pub use netns::NetnsEmulator;

use std::{
    collections::HashMap,
    future::Future,
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use thiserror::Error;
use tokio::process::Command;

use crate::topology::TopologySpec;

/// Time to wait for a queue-depth reading before returning the last known value.
pub const QUEUE_DEPTH_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum EmulationSetupError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Command `{cmd}` failed ({status}): {stderr}")]
    CommandFailed {
        cmd: String,
        status: String,
        stderr: String,
    },
    #[error("Unknown host {0:?}")]
    UnknownHost(String),
    #[error("Unknown interface {0:?}")]
    UnknownInterface(String),
    #[error("The topology is not running")]
    NotRunning,
    #[error("Cannot read the queue depth of {0}")]
    QueueDepth(String),
    #[error("The experiment was interrupted")]
    Interrupted,
}

/// Minimal interface to the network-emulation platform.
#[async_trait::async_trait]
pub trait Emulator: Send + Sync + 'static {
    /// Return a description of the platform
    fn description(&self) -> &'static str;

    /// Create all hosts and links of the topology. On error, resources that were already
    /// allocated may be left behind and are released by `stop`.
    async fn start(&self, spec: &TopologySpec) -> Result<(), EmulationSetupError>;

    /// Address of a host, as reachable from the other hosts.
    fn host_addr(&self, host: &str) -> Option<Ipv4Addr>;

    /// Read the current queue depth of an interface, in packets.
    async fn queue_depth(&self, iface: &str) -> Result<u64, EmulationSetupError>;

    /// Build a command that executes `program` on the given host.
    fn command(&self, host: &str, program: &str) -> Result<Command, EmulationSetupError>;

    /// Release all emulated resources. Must succeed when nothing (or only part of the topology)
    /// was created.
    async fn stop(&self) -> Result<(), EmulationSetupError>;
}

/// A running topology.
pub struct TopologyHandle {
    emulator: Arc<dyn Emulator>,
    spec: TopologySpec,
    stopped: AtomicBool,
    last_depth: Mutex<HashMap<String, u64>>,
    depth_timeout: Duration,
}

impl std::fmt::Debug for TopologyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyHandle")
            .field("emulator", &self.emulator.description())
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish()
    }
}

impl TopologyHandle {
    /// Start the topology. If the platform fails, all partially allocated resources are released
    /// before the error is returned.
    pub async fn start(
        emulator: Arc<dyn Emulator>,
        spec: TopologySpec,
    ) -> Result<Self, EmulationSetupError> {
        log::info!(
            "[topology] Starting {} hosts on {}",
            spec.nodes().count(),
            emulator.description()
        );
        if let Err(e) = emulator.start(&spec).await {
            log::error!("[topology] Cannot start the topology: {e}");
            if let Err(e) = emulator.stop().await {
                log::error!("[topology] Cleanup after failed start failed: {e}");
            }
            return Err(e);
        }
        Ok(Self {
            emulator,
            spec,
            stopped: AtomicBool::new(false),
            last_depth: Mutex::new(HashMap::new()),
            depth_timeout: QUEUE_DEPTH_TIMEOUT,
        })
    }

    /// Start the topology, run `body`, and stop the topology afterwards.
    ///
    /// The topology is stopped on every exit path of `body`: on success, on error, and when
    /// `body` panics. In the latter case the panic is resumed after teardown.
    pub async fn scoped<F, Fut, T, E>(
        emulator: Arc<dyn Emulator>,
        spec: TopologySpec,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Arc<TopologyHandle>) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<EmulationSetupError> + Send + 'static,
    {
        let handle = Arc::new(Self::start(emulator, spec).await?);

        let result = tokio::spawn(body(handle.clone())).await;

        if let Err(e) = handle.stop().await {
            log::error!("[topology] Teardown failed: {e}");
        }

        match result {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(EmulationSetupError::Interrupted.into()),
        }
    }

    pub fn spec(&self) -> &TopologySpec {
        &self.spec
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn host_addr(&self, host: &str) -> Result<Ipv4Addr, EmulationSetupError> {
        self.emulator
            .host_addr(host)
            .ok_or_else(|| EmulationSetupError::UnknownHost(host.to_string()))
    }

    /// Read the queue depth of an interface. Never blocks longer than the depth timeout: if the
    /// platform does not answer in time (or fails), the last known value is returned.
    pub async fn queue_depth(&self, iface: &str) -> u64 {
        let reading = if self.is_stopped() {
            Err(EmulationSetupError::NotRunning)
        } else {
            match tokio::time::timeout(self.depth_timeout, self.emulator.queue_depth(iface)).await
            {
                Ok(reading) => reading,
                Err(_) => Err(EmulationSetupError::QueueDepth(iface.to_string())),
            }
        };

        let Ok(mut last) = self.last_depth.lock() else {
            return reading.unwrap_or_default();
        };
        match reading {
            Ok(depth) => {
                last.insert(iface.to_string(), depth);
                depth
            }
            Err(e) => {
                log::trace!("[topology] Using the last known queue depth of {iface}: {e}");
                last.get(iface).copied().unwrap_or_default()
            }
        }
    }

    /// Build a command executing `program` on `host`.
    pub fn command(&self, host: &str, program: &str) -> Result<Command, EmulationSetupError> {
        if self.is_stopped() {
            return Err(EmulationSetupError::NotRunning);
        }
        self.emulator.command(host, program)
    }

    /// Stop the topology. Only the first call reaches the platform; later calls return `Ok`.
    pub async fn stop(&self) -> Result<(), EmulationSetupError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::info!("[topology] Stopping the topology");
        self.emulator.stop().await
    }
}

impl Drop for TopologyHandle {
    fn drop(&mut self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        log::warn!("[topology] Handle dropped while running, stopping in the background");
        let emulator = self.emulator.clone();
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move {
                if let Err(e) = emulator.stop().await {
                    log::error!("[topology] Teardown failed: {e}");
                }
            });
        } else {
            log::error!("[topology] No runtime available, emulated resources are leaked");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{config::ExperimentConfig, topology::TopologySpec};

    fn spec() -> TopologySpec {
        TopologySpec::from_config(&ExperimentConfig::new(10.0, 10.0)).unwrap()
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let emu = Arc::new(LoopbackEmulator::new());
        let handle = TopologyHandle::start(emu.clone(), spec()).await.unwrap();
        handle.stop().await.unwrap();
        handle.stop().await.unwrap();
        drop(handle);
        assert_eq!(emu.start_count(), 1);
        assert_eq!(emu.stop_count(), 1);
    }

    #[tokio::test]
    async fn failed_start_is_cleaned_up() {
        let emu = Arc::new(LoopbackEmulator::new().fail_on_start());
        let err = TopologyHandle::start(emu.clone(), spec()).await.unwrap_err();
        assert!(matches!(err, EmulationSetupError::CommandFailed { .. }));
        assert_eq!(emu.stop_count(), 1);
    }

    #[tokio::test]
    async fn scoped_stops_on_error() {
        let emu = Arc::new(LoopbackEmulator::new());
        let res: Result<(), EmulationSetupError> =
            TopologyHandle::scoped(emu.clone(), spec(), |topo| async move {
                assert!(!topo.is_stopped());
                Err(EmulationSetupError::UnknownHost("h9".to_string()))
            })
            .await;
        assert!(matches!(res, Err(EmulationSetupError::UnknownHost(_))));
        assert_eq!(emu.stop_count(), 1);
    }

    #[tokio::test]
    async fn scoped_stops_on_panic() {
        let emu = Arc::new(LoopbackEmulator::new());
        let emu2 = emu.clone();
        let res = tokio::spawn(async move {
            TopologyHandle::scoped(emu2, spec(), |_| async move {
                if true {
                    panic!("boom");
                }
                Ok::<(), EmulationSetupError>(())
            })
            .await
        })
        .await;
        assert!(res.unwrap_err().is_panic());
        assert_eq!(emu.stop_count(), 1);
    }

    #[tokio::test]
    async fn queue_depth_keeps_last_value() {
        let emu = Arc::new(LoopbackEmulator::with_depth_source(|| 42));
        let handle = TopologyHandle::start(emu.clone(), spec()).await.unwrap();
        let iface = handle.spec().bottleneck_iface();
        assert_eq!(handle.queue_depth(&iface).await, 42);
        handle.stop().await.unwrap();
        assert_eq!(handle.queue_depth(&iface).await, 42);
        assert_eq!(handle.queue_depth("s0-eth9").await, 0);
        assert!(matches!(
            handle.command("h1", "true"),
            Err(EmulationSetupError::NotRunning)
        ));
    }
}
