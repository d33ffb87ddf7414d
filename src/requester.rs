use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::command::{AppendEntriesReply, AppendEntriesRequest, PeerDescriptor, RequestVoteReply, RequestVoteRequest};
use crate::node::NodeHandle;

/// Bound applied to every outbound peer call, real or mocked. Timeout
/// and transport failure are treated identically by callers: both show
/// up as `PeerRequestError` and are retried on the next heartbeat or
/// contribute no vote.
pub const PEER_REQUEST_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct PeerRequestError(pub String);

impl fmt::Display for PeerRequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer request failed: {}", self.0)
    }
}

impl std::error::Error for PeerRequestError {}

impl From<anyhow::Error> for PeerRequestError {
    fn from(e: anyhow::Error) -> Self {
        Self(e.to_string())
    }
}

/// Abstract capability to reach another replica. The event loop depends
/// only on this trait, never on a concrete transport -- that's what
/// makes an in-process multi-node test harness possible without a
/// single socket.
#[async_trait]
pub trait PeerRequester: Send + Sync {
    async fn request_vote(
        &self,
        peer: &PeerDescriptor,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteReply, PeerRequestError>;

    async fn append_entries(
        &self,
        peer: &PeerDescriptor,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesReply, PeerRequestError>;
}

/// Routes calls directly into a peer's event channel instead of over a
/// socket. Each node registers its `NodeHandle` under its own id after
/// spawning; `request_vote`/`append_entries` then look the target up
/// and await its reply slot, exactly as a real transport would, minus
/// the wire.
#[derive(Clone, Default)]
pub struct MockPeerRequester {
    registry: Arc<RwLock<HashMap<String, NodeHandle>>>,
}

impl MockPeerRequester {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: impl Into<String>, handle: NodeHandle) {
        self.registry.write().expect("registry poisoned").insert(id.into(), handle);
    }

    fn lookup(&self, id: &str) -> Result<NodeHandle, PeerRequestError> {
        self.registry
            .read()
            .expect("registry poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| PeerRequestError(format!("no such peer: {id}")))
    }
}

#[async_trait]
impl PeerRequester for MockPeerRequester {
    async fn request_vote(
        &self,
        peer: &PeerDescriptor,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteReply, PeerRequestError> {
        let handle = self.lookup(&peer.id)?;
        match tokio::time::timeout(PEER_REQUEST_TIMEOUT, handle.request_vote(req)).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(PeerRequestError("timeout".to_string())),
        }
    }

    async fn append_entries(
        &self,
        peer: &PeerDescriptor,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesReply, PeerRequestError> {
        let handle = self.lookup(&peer.id)?;
        match tokio::time::timeout(PEER_REQUEST_TIMEOUT, handle.append_entries(req)).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(PeerRequestError("timeout".to_string())),
        }
    }
}
