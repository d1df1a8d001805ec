//! Static cluster configuration.
//!
//! The cluster is described by a property file of `key=value` lines:
//!
//! ```text
//! servers_count=3
//! timeout=1000
//! node.1=127.0.0.1:7101
//! node.2=127.0.0.1:7102
//! node.3=127.0.0.1:7103
//! ```
//!
//! Nodes are numbered from 1 in the file and on the command line, and
//! indexed from 0 everywhere else. Optional keys: `connect_timeout`,
//! `election_jitter` (both milliseconds), `bootstrap_leader` and
//! `inbox_capacity`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::message::{Address, NodeId};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const DEFAULT_INBOX_CAPACITY: usize = 1024;

/// Ordered node addresses plus the timeout that drives elections and
/// heartbeats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    pub nodes: Vec<Address>,
    pub timeout: Duration,
}

impl ClusterConfig {
    pub fn new(nodes: Vec<Address>, timeout: Duration) -> Result<Self> {
        if nodes.is_empty() {
            return Err(Error::config("cluster must contain at least one node"));
        }
        if timeout.is_zero() {
            return Err(Error::config("timeout must be positive"));
        }
        for addr in &nodes {
            validate_address(addr)?;
        }
        Ok(Self { nodes, timeout })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Strict majority: `floor(N/2) + 1`.
    pub fn majority(&self) -> usize {
        self.nodes.len() / 2 + 1
    }

    pub fn address(&self, id: NodeId) -> Option<&str> {
        self.nodes.get(id).map(String::as_str)
    }
}

/// Everything one node needs to start.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub cluster: ClusterConfig,
    /// This node's 0-based index into `cluster.nodes`.
    pub index: NodeId,
    /// Directory holding `dkvs_<n>.log` and `dkvs_<n>.state`.
    pub data_dir: PathBuf,
    /// Node 0 starts as leader of term 0 on a fresh cluster.
    pub bootstrap_leader: bool,
    /// Upper bound of the random delay added to follower/candidate timeouts.
    pub election_jitter: Duration,
    pub connect_timeout: Duration,
    pub inbox_capacity: usize,
}

impl NodeConfig {
    pub fn new(cluster: ClusterConfig, index: NodeId, data_dir: impl Into<PathBuf>) -> Result<Self> {
        if index >= cluster.len() {
            return Err(Error::config(format!(
                "node index {} out of range for a cluster of {}",
                index + 1,
                cluster.len()
            )));
        }
        Ok(Self {
            cluster,
            index,
            data_dir: data_dir.into(),
            bootstrap_leader: true,
            election_jitter: Duration::ZERO,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
        })
    }

    /// Loads a property file and selects the node with 1-based `number`.
    pub fn load(path: impl AsRef<Path>, number: usize, data_dir: impl Into<PathBuf>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|err| Error::config(format!("cannot read {}: {err}", path.display())))?;
        Self::from_properties(&text, number, data_dir)
    }

    pub fn from_properties(text: &str, number: usize, data_dir: impl Into<PathBuf>) -> Result<Self> {
        let props = parse_properties(text)?;

        let count: usize = required_parsed(&props, "servers_count")?;
        let timeout = Duration::from_millis(required_parsed(&props, "timeout")?);
        let nodes = (1..=count)
            .map(|n| required(&props, &format!("node.{n}")).map(str::to_string))
            .collect::<Result<Vec<_>>>()?;
        let cluster = ClusterConfig::new(nodes, timeout)?;

        if number == 0 {
            return Err(Error::config("node numbers start at 1"));
        }
        let mut config = NodeConfig::new(cluster, number - 1, data_dir)?;

        if let Some(ms) = optional_parsed::<u64>(&props, "connect_timeout")? {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = optional_parsed::<u64>(&props, "election_jitter")? {
            config.election_jitter = Duration::from_millis(ms);
        }
        if let Some(flag) = optional_parsed::<bool>(&props, "bootstrap_leader")? {
            config.bootstrap_leader = flag;
        }
        if let Some(capacity) = optional_parsed::<usize>(&props, "inbox_capacity")? {
            if capacity == 0 {
                return Err(Error::config("inbox_capacity must be positive"));
            }
            config.inbox_capacity = capacity;
        }
        Ok(config)
    }

    pub fn listen_addr(&self) -> &str {
        &self.cluster.nodes[self.index]
    }

    /// 1-based number used in file names and logs.
    pub fn number(&self) -> usize {
        self.index + 1
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join(format!("dkvs_{}.log", self.number()))
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(format!("dkvs_{}.state", self.number()))
    }
}

fn parse_properties(text: &str) -> Result<HashMap<String, String>> {
    let mut props = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(Error::config(format!("can't read property: {line}")));
        };
        props.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(props)
}

fn required<'a>(props: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    props
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| Error::config(format!("missing property: {key}")))
}

fn required_parsed<T: std::str::FromStr>(props: &HashMap<String, String>, key: &str) -> Result<T> {
    let raw = required(props, key)?;
    raw.parse()
        .map_err(|_| Error::config(format!("property {key} is not a valid value: {raw}")))
}

fn optional_parsed<T: std::str::FromStr>(
    props: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>> {
    match props.get(key) {
        None => Ok(None),
        Some(_) => required_parsed(props, key).map(Some),
    }
}

fn validate_address(addr: &str) -> Result<()> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        return Err(Error::config(format!("address {addr} has no port")));
    };
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(Error::config(format!("invalid address: {addr}")));
    }
    Ok(())
}
