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
//! Declarative description of the emulated star topology.
//!
//! All client hosts and the server host are attached to a single switch. The link of the server
//! is the bottleneck, and the switch port facing the server is the only interface whose queue is
//! monitored.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, ExperimentConfig};

/// Name of the switch all hosts are attached to.
pub const SWITCH_NAME: &str = "s0";

/// Queue limit of host links, in packets.
pub const HOST_QUEUE_LIMIT: u32 = 1000;

/// Shaping parameters of a link.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkSpec {
    /// Bandwidth in Mbit/s
    pub bw_mbit: f64,
    /// One-way delay in ms
    pub delay_ms: f64,
    /// Loss rate in percent
    pub loss_pct: f64,
    /// Maximum queue size in packets
    pub max_queue: u32,
}

/// A host attached to the switch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    /// Congestion-control algorithm of the host, if it is a client.
    pub algorithm: Option<String>,
    pub addr: Ipv4Addr,
    /// Switch port the host is attached to, starting at 1.
    pub port: usize,
    pub link: LinkSpec,
}

impl NodeSpec {
    /// Interface of the host facing the switch.
    pub fn host_iface(&self) -> String {
        format!("{}-eth0", self.name)
    }

    /// Interface of the switch facing the host.
    pub fn switch_iface(&self) -> String {
        format!("{SWITCH_NAME}-eth{}", self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologySpec {
    pub subnet: Ipv4Net,
    pub clients: Vec<NodeSpec>,
    /// The server, attached through the bottleneck link.
    pub server: NodeSpec,
}

impl TopologySpec {
    /// Build the star topology of an experiment. Addresses are allocated sequentially from
    /// `10.0.0.0/24`, first for the clients, then for the server.
    pub fn from_config(config: &ExperimentConfig) -> Result<Self, ConfigError> {
        let subnet = Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 0), 24)
            .map_err(|e| ConfigError::Subnet(e.to_string()))?;
        let mut addrs = subnet.hosts();

        let host_link = LinkSpec {
            bw_mbit: config.bw_host,
            delay_ms: config.host_delay(),
            loss_pct: config.loss_pct,
            max_queue: HOST_QUEUE_LIMIT,
        };

        let mut clients = Vec::with_capacity(config.hosts.len());
        for (i, host) in config.hosts.iter().enumerate() {
            let addr = addrs
                .next()
                .ok_or_else(|| ConfigError::Subnet(format!("no address left for {}", host.name)))?;
            clients.push(NodeSpec {
                name: host.name.clone(),
                algorithm: Some(host.algorithm.clone()),
                addr,
                port: i + 1,
                link: host_link,
            });
        }

        let addr = addrs.next().ok_or_else(|| {
            ConfigError::Subnet(format!("no address left for {}", config.server_name))
        })?;
        let server = NodeSpec {
            name: config.server_name.clone(),
            algorithm: None,
            addr,
            port: clients.len() + 1,
            link: LinkSpec {
                bw_mbit: config.bw_net,
                delay_ms: config.delay_ms,
                loss_pct: config.bottleneck_loss_pct,
                max_queue: config.max_queue,
            },
        };

        Ok(Self {
            subnet,
            clients,
            server,
        })
    }

    /// The monitored interface: the switch port facing the server.
    pub fn bottleneck_iface(&self) -> String {
        self.server.switch_iface()
    }

    /// Iterate over all hosts, clients first.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeSpec> {
        self.clients.iter().chain(std::iter::once(&self.server))
    }

    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes().find(|n| n.name == name)
    }
}
