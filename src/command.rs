use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A single operation against the replicated key-value machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Nop,
    Get,
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub op: Op,
    #[serde(default)]
    pub key: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Vec<u8>>,
}

impl Command {
    pub fn nop() -> Self {
        Self { op: Op::Nop, key: Vec::new(), value: None }
    }

    pub fn get(key: impl Into<Vec<u8>>) -> Self {
        Self { op: Op::Get, key: key.into(), value: None }
    }

    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self { op: Op::Put, key: key.into(), value: Some(value.into()) }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self { op: Op::Delete, key: key.into(), value: None }
    }
}

/// One entry of the replicated log. Indices are 1-based, dense and
/// strictly monotonic; entries at or below `commitIndex` are immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub id: String,
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: u64,
    #[serde(rename = "candidateID")]
    pub candidate_id: String,
    #[serde(rename = "lastLogIndex")]
    pub last_log_index: u64,
    #[serde(rename = "lastLogTerm")]
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: u64,
    #[serde(rename = "voteGranted")]
    pub vote_granted: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    #[serde(rename = "leaderID")]
    pub leader_id: String,
    #[serde(rename = "commitIndex")]
    pub commit_index: u64,
    #[serde(rename = "prevLogIndex")]
    pub prev_log_index: u64,
    #[serde(rename = "prevLogTerm")]
    pub prev_log_term: u64,
    #[serde(rename = "logEntries", default, skip_serializing_if = "Vec::is_empty")]
    pub log_entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    pub message: String,
    #[serde(rename = "lastLogIndex")]
    pub last_log_index: u64,
}

/// Reply to a client `IncomingCommand` event, posted once the assigned
/// log index has been applied. `value` carries the current value for a
/// `get`; it is `None` for `put`/`delete`/`nop` and for a `get` whose key
/// is absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReply {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReply {
    pub term: u64,
    #[serde(rename = "commitIndex")]
    pub commit_index: u64,
    pub peers: HashMap<String, PeerDescriptor>,
    pub state: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_entry_round_trips_through_json() {
        let entry = LogEntry { index: 7, term: 3, command: Command::put("k", "v") };
        let encoded = serde_json::to_vec(&entry).unwrap();
        let decoded: LogEntry = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(entry, decoded);
    }

    #[test]
    fn command_round_trips_through_json_for_every_op() {
        for command in [Command::nop(), Command::get("k"), Command::put("k", "v"), Command::delete("k")] {
            let encoded = serde_json::to_vec(&command).unwrap();
            let decoded: Command = serde_json::from_slice(&encoded).unwrap();
            assert_eq!(command, decoded);
        }
    }

    #[test]
    fn append_entries_request_uses_spec_wire_field_names() {
        let req = AppendEntriesRequest {
            term: 1,
            leader_id: "L".to_string(),
            commit_index: 2,
            prev_log_index: 3,
            prev_log_term: 1,
            log_entries: vec![],
        };
        let value: serde_json::Value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["leaderID"], "L");
        assert_eq!(value["commitIndex"], 2);
        assert_eq!(value["prevLogIndex"], 3);
        assert_eq!(value["prevLogTerm"], 1);
    }
}
