use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;

use crate::command::PeerDescriptor;
use crate::node::NodeConfig;

/// Command-line entry point for the reference raft node binary.
///
/// Peers are given as `id=host:port` pairs so the bootstrap binary
/// never has to guess an id from an address.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// This replica's id, used as `candidateID`/`leaderID` on the wire.
    #[arg(long)]
    pub id: String,

    /// Address this replica's raft transport listens on, e.g. 127.0.0.1:7001.
    #[arg(long)]
    pub listen: String,

    /// Other replicas in the cluster, as `id=host:port`. Repeat per peer.
    #[arg(long = "peer", value_parser = parse_peer)]
    pub peers: Vec<PeerDescriptor>,

    /// Directory for this replica's durable store.
    #[arg(long, default_value = "raft-data")]
    pub data_dir: String,

    /// Minimum randomized election timeout, in milliseconds.
    #[arg(long, default_value_t = 150)]
    pub election_timeout_min_ms: u64,

    /// Maximum randomized election timeout, in milliseconds.
    #[arg(long, default_value_t = 300)]
    pub election_timeout_max_ms: u64,

    /// Heartbeat interval for an established leader, in milliseconds.
    #[arg(long, default_value_t = 50)]
    pub heartbeat_interval_ms: u64,
}

fn parse_peer(raw: &str) -> Result<PeerDescriptor, String> {
    let (id, addr) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected `id=host:port`, got `{raw}`"))?;
    if id.is_empty() || addr.is_empty() {
        return Err(format!("expected `id=host:port`, got `{raw}`"));
    }
    Ok(PeerDescriptor { id: id.to_string(), addr: addr.to_string() })
}

impl Cli {
    /// Validates the parsed arguments and turns them into the event
    /// loop's `NodeConfig`, failing fast on an obviously broken cluster
    /// description rather than letting the node start half-configured.
    pub fn into_node_config(self) -> Result<(NodeConfig, String, String)> {
        if self.election_timeout_min_ms >= self.election_timeout_max_ms {
            bail!("election-timeout-min-ms must be less than election-timeout-max-ms");
        }
        if self.peers.iter().any(|p| p.id == self.id) {
            bail!("this replica's own id ({}) must not appear in --peer", self.id);
        }

        let data_dir = std::path::PathBuf::from(&self.data_dir)
            .join(&self.id)
            .to_str()
            .context("data directory path is not valid UTF-8")?
            .to_string();

        let config = NodeConfig {
            id: self.id.clone(),
            peers: self.peers.clone(),
            election_timeout: (
                Duration::from_millis(self.election_timeout_min_ms),
                Duration::from_millis(self.election_timeout_max_ms),
            ),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
        };
        Ok((config, data_dir, self.listen))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_peer_splits_id_and_address() {
        let peer = parse_peer("n2=127.0.0.1:7002").unwrap();
        assert_eq!(peer.id, "n2");
        assert_eq!(peer.addr, "127.0.0.1:7002");
    }

    #[test]
    fn parse_peer_rejects_missing_equals() {
        assert!(parse_peer("127.0.0.1:7002").is_err());
    }

    #[test]
    fn rejects_self_listed_as_its_own_peer() {
        let cli = Cli {
            id: "n0".to_string(),
            listen: "127.0.0.1:7000".to_string(),
            peers: vec![PeerDescriptor { id: "n0".to_string(), addr: "127.0.0.1:7000".to_string() }],
            data_dir: "raft-data".to_string(),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
        };
        assert!(cli.into_node_config().is_err());
    }
}
