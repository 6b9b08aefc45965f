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
//! Emulator based on Linux network namespaces.
//!
//! Every host and the switch live in their own namespace. Hosts are connected to a bridge in the
//! switch namespace through veth pairs, and both ends of each pair are shaped with `tc` (htb for
//! the rate, netem for delay, loss, and the queue limit). Requires root privileges, `iproute2`,
//! and `tc`.

use std::{collections::HashMap, net::Ipv4Addr, sync::Mutex};

use lazy_static::lazy_static;
use regex::Regex;
use tokio::process::Command;

use super::{EmulationSetupError, Emulator};
use crate::topology::{LinkSpec, TopologySpec, SWITCH_NAME};

lazy_static! {
    static ref BACKLOG: Regex = Regex::new(r"backlog\s+\S+\s+(\d+)p").unwrap();
}

#[derive(Debug, Default)]
struct State {
    /// Namespaces created so far, in order of creation.
    namespaces: Vec<String>,
    /// Namespace and address of each host.
    hosts: HashMap<String, (String, Ipv4Addr)>,
    /// Namespace of each interface.
    ifaces: HashMap<String, String>,
}

pub struct NetnsEmulator {
    prefix: String,
    state: Mutex<State>,
}

impl Default for NetnsEmulator {
    fn default() -> Self {
        Self::new()
    }
}

impl NetnsEmulator {
    /// Namespaces are prefixed with the process id, so concurrent runs do not collide.
    pub fn new() -> Self {
        Self::with_prefix(format!("cca{}", std::process::id()))
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            state: Mutex::new(State::default()),
        }
    }

    fn ns_name(&self, node: &str) -> String {
        format!("{}-{node}", self.prefix)
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> Option<R> {
        self.state.lock().ok().map(|mut s| f(&mut s))
    }

    async fn add_namespace(&self, ns: &str) -> Result<(), EmulationSetupError> {
        run("ip", &["netns", "add", ns]).await?;
        self.with_state(|s| s.namespaces.push(ns.to_string()));
        in_ns(ns, &["ip", "link", "set", "lo", "up"]).await?;
        Ok(())
    }
}

/// Build a command that executes `program` inside the namespace `ns`.
fn ns_command(ns: &str, program: &str) -> Command {
    let mut cmd = Command::new("ip");
    cmd.args(["netns", "exec", ns, program]);
    cmd
}

async fn run(program: &str, args: &[&str]) -> Result<String, EmulationSetupError> {
    let cmd = format!("{program} {}", args.join(" "));
    log::trace!("[netns] {cmd}");
    let output = Command::new(program).args(args).output().await?;
    if !output.status.success() {
        return Err(EmulationSetupError::CommandFailed {
            cmd,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn in_ns(ns: &str, args: &[&str]) -> Result<String, EmulationSetupError> {
    let mut full = vec!["netns", "exec", ns];
    full.extend_from_slice(args);
    run("ip", &full).await
}

/// Shape the egress of `iface` with rate, delay, loss, and queue limit.
async fn shape(ns: &str, iface: &str, link: &LinkSpec) -> Result<(), EmulationSetupError> {
    let rate = format!("{}mbit", link.bw_mbit);
    let delay = format!("{}ms", link.delay_ms);
    let loss = format!("{}%", link.loss_pct);
    let limit = link.max_queue.to_string();
    in_ns(
        ns,
        &["tc", "qdisc", "add", "dev", iface, "root", "handle", "5:", "htb", "default", "1"],
    )
    .await?;
    in_ns(
        ns,
        &[
            "tc", "class", "add", "dev", iface, "parent", "5:", "classid", "5:1", "htb", "rate",
            &rate, "burst", "15k",
        ],
    )
    .await?;
    in_ns(
        ns,
        &[
            "tc", "qdisc", "add", "dev", iface, "parent", "5:1", "handle", "10:", "netem", "delay",
            &delay, "loss", &loss, "limit", &limit,
        ],
    )
    .await?;
    Ok(())
}

/// Parse the backlog in packets from the output of `tc -s qdisc show`. With a netem qdisc below
/// the root, its backlog (the second one) is the queue of the link.
pub(crate) fn parse_backlog(output: &str) -> Option<u64> {
    let backlogs: Vec<u64> = BACKLOG
        .captures_iter(output)
        .filter_map(|c| c.get(1)?.as_str().parse().ok())
        .collect();
    backlogs.get(1).or(backlogs.first()).copied()
}

#[async_trait::async_trait]
impl Emulator for NetnsEmulator {
    fn description(&self) -> &'static str {
        "network namespaces"
    }

    async fn start(&self, spec: &TopologySpec) -> Result<(), EmulationSetupError> {
        let switch_ns = self.ns_name(SWITCH_NAME);
        self.add_namespace(&switch_ns).await?;
        in_ns(&switch_ns, &["ip", "link", "add", "br0", "type", "bridge"]).await?;
        in_ns(&switch_ns, &["ip", "link", "set", "br0", "up"]).await?;

        for node in spec.nodes() {
            log::debug!("[netns] Adding host {} ({})", node.name, node.addr);
            let ns = self.ns_name(&node.name);
            self.add_namespace(&ns).await?;

            let host_iface = node.host_iface();
            let switch_iface = node.switch_iface();
            run(
                "ip",
                &[
                    "link", "add", &host_iface, "netns", &ns, "type", "veth", "peer", "name",
                    &switch_iface, "netns", &switch_ns,
                ],
            )
            .await?;

            let cidr = format!("{}/{}", node.addr, spec.subnet.prefix_len());
            in_ns(&ns, &["ip", "addr", "add", &cidr, "dev", &host_iface]).await?;
            in_ns(&ns, &["ip", "link", "set", &host_iface, "up"]).await?;
            in_ns(&switch_ns, &["ip", "link", "set", &switch_iface, "master", "br0"]).await?;
            in_ns(&switch_ns, &["ip", "link", "set", &switch_iface, "up"]).await?;

            shape(&ns, &host_iface, &node.link).await?;
            shape(&switch_ns, &switch_iface, &node.link).await?;

            if let Some(algorithm) = &node.algorithm {
                let sysctl = format!("net.ipv4.tcp_congestion_control={algorithm}");
                in_ns(&ns, &["sysctl", "-w", &sysctl]).await?;
            }

            self.with_state(|s| {
                s.hosts.insert(node.name.clone(), (ns.clone(), node.addr));
                s.ifaces.insert(host_iface, ns.clone());
                s.ifaces.insert(switch_iface, switch_ns.clone());
            });
        }
        Ok(())
    }

    fn host_addr(&self, host: &str) -> Option<Ipv4Addr> {
        self.with_state(|s| s.hosts.get(host).map(|(_, addr)| *addr))
            .flatten()
    }

    async fn queue_depth(&self, iface: &str) -> Result<u64, EmulationSetupError> {
        let ns = self
            .with_state(|s| s.ifaces.get(iface).cloned())
            .flatten()
            .ok_or_else(|| EmulationSetupError::UnknownInterface(iface.to_string()))?;
        let output = in_ns(&ns, &["tc", "-s", "qdisc", "show", "dev", iface]).await?;
        parse_backlog(&output).ok_or_else(|| EmulationSetupError::QueueDepth(iface.to_string()))
    }

    fn command(&self, host: &str, program: &str) -> Result<Command, EmulationSetupError> {
        let ns = self
            .with_state(|s| s.hosts.get(host).map(|(ns, _)| ns.clone()))
            .flatten()
            .ok_or_else(|| EmulationSetupError::UnknownHost(host.to_string()))?;
        Ok(ns_command(&ns, program))
    }

    async fn stop(&self) -> Result<(), EmulationSetupError> {
        let namespaces = self
            .with_state(|s| {
                s.hosts.clear();
                s.ifaces.clear();
                std::mem::take(&mut s.namespaces)
            })
            .unwrap_or_default();

        // deleting a namespace also removes the veth ends inside it
        let mut result = Ok(());
        for ns in namespaces.into_iter().rev() {
            if let Err(e) = run("ip", &["netns", "del", &ns]).await {
                log::error!("[netns] Cannot delete namespace {ns}: {e}");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}
