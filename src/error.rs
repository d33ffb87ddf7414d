use std::fmt;

/// Errors surfaced out of the event loop as typed replies, never as panics.
///
/// Protocol rejections (vote denied, append rejected) are not represented
/// here at all -- they are ordinary `false` fields on the protocol reply
/// types. `CoreError` only covers the handful of cases spec section 7
/// calls out as needing a distinct client-visible code.
#[derive(Debug)]
pub enum CoreError {
    /// A durable-store write needed to make a reply safe to send failed.
    /// Callers should treat this the same as the node being unavailable.
    Storage(String),
    /// The node is not the leader; `leader_id` is the best known guess.
    /// Also used when the entry eventually applied at a pending command's
    /// index turns out to belong to a different term -- the original
    /// command was displaced by a later leader before it committed.
    NotLeader { leader_id: Option<String> },
    /// A pending client reply was dropped because the node is shutting down.
    ShuttingDown,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Storage(msg) => write!(f, "durable store failure: {msg}"),
            CoreError::NotLeader { leader_id: Some(id) } => {
                write!(f, "not the leader; current leader is {id}")
            }
            CoreError::NotLeader { leader_id: None } => {
                write!(f, "not the leader; no known leader")
            }
            CoreError::ShuttingDown => write!(f, "node is shutting down"),
        }
    }
}

impl std::error::Error for CoreError {}
