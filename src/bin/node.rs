use anyhow::Result;
use clap::Parser;
use log::{error, info};
use std::sync::Arc;

use raftkv_core::config::Cli;
use raftkv_core::node;
use raftkv_core::requester::PeerRequester;
use raftkv_core::store::DurableStore;
use raftkv_core::transport::{self, TcpPeerRequester};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let (config, data_dir, listen_addr) = cli.into_node_config()?;

    info!("starting replica {} ({} peers) data_dir={}", config.id, config.peers.len(), data_dir);

    let store = DurableStore::open(&data_dir)?;
    let requester: Arc<dyn PeerRequester> = Arc::new(TcpPeerRequester::new());
    let (handle, join) = node::spawn(config, store, requester)?;

    let transport_handle = handle.clone();
    tokio::spawn(async move {
        if let Err(e) = transport::serve(&listen_addr, transport_handle).await {
            error!("raft transport stopped: {e}");
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            let _ = handle.shutdown().await;
            match join.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("node event loop exited with an error during shutdown: {e}");
                    return Err(e);
                }
                Err(e) => {
                    error!("node event loop task panicked during shutdown: {e}");
                    return Err(e.into());
                }
            }
        }
        result = join => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("node event loop exited with an unrecoverable error: {e}");
                    return Err(e);
                }
                Err(e) => {
                    error!("node event loop task panicked: {e}");
                    return Err(e.into());
                }
            }
        }
    }

    Ok(())
}
