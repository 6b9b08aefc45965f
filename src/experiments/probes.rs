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
//! Probe actions fired by the scheduler at its checkpoints.

use std::{future::Future, process::Stdio, sync::Arc};

use crate::{emulator::TopologyHandle, extract::curl};

use super::flows::FlowExecutionError;

/// A single measurement taken at a probe checkpoint.
#[async_trait::async_trait]
pub trait ProbeAction: Send + Sync + 'static {
    fn description(&self) -> String;

    /// Take the measurement of checkpoint number `checkpoint`.
    async fn probe(&self, checkpoint: usize) -> Result<f64, FlowExecutionError>;
}

/// Fetch a page over HTTP and measure the total fetch time in seconds.
pub struct WebFetchProbe {
    topo: Arc<TopologyHandle>,
    client: String,
    url: String,
}

impl WebFetchProbe {
    /// Probe fetching `http://<server>:<port>/<path>` from `client`.
    pub fn new(
        topo: Arc<TopologyHandle>,
        client: impl Into<String>,
        server: &str,
        port: u16,
        path: &str,
    ) -> Result<Self, FlowExecutionError> {
        let addr = topo
            .host_addr(server)
            .map_err(|e| FlowExecutionError::Emulation(e.to_string()))?;
        Ok(Self {
            topo,
            client: client.into(),
            url: format!("http://{addr}:{port}/{path}"),
        })
    }
}

#[async_trait::async_trait]
impl ProbeAction for WebFetchProbe {
    fn description(&self) -> String {
        format!("fetch {} from {}", self.url, self.client)
    }

    async fn probe(&self, checkpoint: usize) -> Result<f64, FlowExecutionError> {
        let mut cmd = self
            .topo
            .command(&self.client, "curl")
            .map_err(|e| FlowExecutionError::Emulation(e.to_string()))?;
        cmd.args(["-o", "/dev/null", "-s", "-w", curl::FETCH_TIME_TEMPLATE])
            .arg(&self.url)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = cmd.output().await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FlowExecutionError::Unavailable {
                tool: "curl".to_string(),
                reason: e.to_string(),
            },
            _ => FlowExecutionError::Spawn {
                tool: "curl".to_string(),
                reason: e.to_string(),
            },
        })?;
        if !output.status.success() {
            return Err(FlowExecutionError::NonZeroExit {
                tool: "curl".to_string(),
                status: output.status.to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let time = curl::parse_fetch_time(&stdout).ok_or_else(|| {
            FlowExecutionError::UnexpectedOutput {
                tool: "curl".to_string(),
                output: stdout.to_string(),
            }
        })?;
        log::debug!("[probe] Checkpoint {checkpoint}: fetch took {time:.4}s");
        Ok(time)
    }
}

/// Probe backed by an async closure.
pub struct FnProbe<F> {
    name: String,
    f: F,
}

impl<F> FnProbe<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait::async_trait]
impl<F, Fut> ProbeAction for FnProbe<F>
where
    F: Fn(usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<f64, FlowExecutionError>> + Send + 'static,
{
    fn description(&self) -> String {
        self.name.clone()
    }

    async fn probe(&self, checkpoint: usize) -> Result<f64, FlowExecutionError> {
        (self.f)(checkpoint).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{config::ExperimentConfig, emulator::LoopbackEmulator, topology::TopologySpec};

    #[tokio::test]
    async fn fn_probe() {
        let probe = FnProbe::new("double", |i: usize| async move {
            Ok::<_, FlowExecutionError>(i as f64 * 2.0)
        });
        assert_eq!(probe.description(), "double");
        assert_eq!(probe.probe(3).await, Ok(6.0));
    }

    #[tokio::test]
    async fn web_probe_url() {
        let spec = TopologySpec::from_config(&ExperimentConfig::new(10.0, 10.0)).unwrap();
        let topo = Arc::new(
            TopologyHandle::start(Arc::new(LoopbackEmulator::new()), spec)
                .await
                .unwrap(),
        );
        let probe = WebFetchProbe::new(topo.clone(), "h1", "srv", 8080, "test_page.html").unwrap();
        assert_eq!(
            probe.description(),
            "fetch http://127.0.0.1:8080/test_page.html from h1"
        );
        assert!(WebFetchProbe::new(topo.clone(), "h1", "nope", 8080, "").is_err());

        topo.stop().await.unwrap();
        assert!(matches!(
            probe.probe(0).await,
            Err(FlowExecutionError::Emulation(_))
        ));
    }
}
