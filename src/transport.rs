use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::command::{AppendEntriesReply, AppendEntriesRequest, PeerDescriptor, RequestVoteReply, RequestVoteRequest};
use crate::node::NodeHandle;
use crate::requester::{PeerRequestError, PeerRequester, PEER_REQUEST_TIMEOUT};

/// The only two RPCs that cross the wire between replicas. This is a
/// reference transport, not a generic RPC framework: one request type
/// in, one matching reply type out, both length-prefixed JSON on a
/// single-shot TCP connection.
#[derive(Debug, Serialize, Deserialize)]
enum WireMessage {
    RequestVote(RequestVoteRequest),
    AppendEntries(AppendEntriesRequest),
}

#[derive(Debug, Serialize, Deserialize)]
enum WireReply {
    RequestVote(RequestVoteReply),
    AppendEntries(AppendEntriesReply),
}

async fn write_frame<T: Serialize>(stream: &mut TcpStream, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value).context("failed to encode wire frame")?;
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame<T: for<'de> Deserialize<'de>>(stream: &mut TcpStream) -> Result<T> {
    let len = stream.read_u32().await?;
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    serde_json::from_slice(&buf).context("failed to decode wire frame")
}

/// Reaches a peer over a fresh TCP connection per call: connect, send
/// one length-prefixed JSON frame, read one back, disconnect. No
/// connection pooling -- a dropped or slow peer just times out and is
/// retried on the next heartbeat or election round.
#[derive(Clone, Default)]
pub struct TcpPeerRequester;

impl TcpPeerRequester {
    pub fn new() -> Self {
        Self
    }

    async fn roundtrip(&self, addr: &str, message: WireMessage) -> Result<WireReply, PeerRequestError> {
        let attempt = async {
            let mut stream = TcpStream::connect(addr).await.context("failed to connect to peer")?;
            write_frame(&mut stream, &message).await?;
            read_frame(&mut stream).await
        };
        match tokio::time::timeout(PEER_REQUEST_TIMEOUT, attempt).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => Err(PeerRequestError(e.to_string())),
            Err(_) => Err(PeerRequestError("timeout".to_string())),
        }
    }
}

#[async_trait]
impl PeerRequester for TcpPeerRequester {
    async fn request_vote(
        &self,
        peer: &PeerDescriptor,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteReply, PeerRequestError> {
        match self.roundtrip(&peer.addr, WireMessage::RequestVote(req)).await? {
            WireReply::RequestVote(reply) => Ok(reply),
            WireReply::AppendEntries(_) => Err(PeerRequestError("peer sent mismatched reply".to_string())),
        }
    }

    async fn append_entries(
        &self,
        peer: &PeerDescriptor,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesReply, PeerRequestError> {
        match self.roundtrip(&peer.addr, WireMessage::AppendEntries(req)).await? {
            WireReply::AppendEntries(reply) => Ok(reply),
            WireReply::RequestVote(_) => Err(PeerRequestError("peer sent mismatched reply".to_string())),
        }
    }
}

/// Accepts inbound peer connections for one node and dispatches each
/// frame to its event loop. Runs until the listener itself fails;
/// individual connection errors are logged and otherwise ignored, since
/// a single bad peer roundtrip must never bring a replica down.
pub async fn serve(bind_addr: &str, handle: NodeHandle) -> Result<()> {
    let listener = TcpListener::bind(bind_addr).await.context("failed to bind raft transport listener")?;
    info!("raft transport listening on {bind_addr}");
    loop {
        let (stream, peer_addr) = listener.accept().await.context("accept failed")?;
        debug!("accepted raft connection from {peer_addr}");
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_one(stream, handle).await {
                error!("raft connection from {peer_addr} failed: {e}");
            }
        });
    }
}

async fn serve_one(mut stream: TcpStream, handle: NodeHandle) -> Result<()> {
    let message: WireMessage = read_frame(&mut stream).await?;
    let reply = match message {
        WireMessage::RequestVote(req) => {
            let reply = tokio::time::timeout(Duration::from_secs(5), handle.request_vote(req))
                .await
                .context("node did not reply in time")??;
            WireReply::RequestVote(reply)
        }
        WireMessage::AppendEntries(req) => {
            let reply = tokio::time::timeout(Duration::from_secs(5), handle.append_entries(req))
                .await
                .context("node did not reply in time")??;
            WireReply::AppendEntries(reply)
        }
    };
    write_frame(&mut stream, &reply).await
}
