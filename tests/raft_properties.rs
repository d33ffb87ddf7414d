//! Exercises the protocol handlers directly by injecting `RequestVote`/
//! `AppendEntries` RPCs through a node's handle, with timers parked far
//! in the future so only the injected events drive state transitions.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use raftkv_core::command::{AppendEntriesRequest, Command, LogEntry, RequestVoteRequest};
use raftkv_core::node::{self, NodeConfig};
use raftkv_core::requester::MockPeerRequester;
use raftkv_core::store::DurableStore;

const PARKED: Duration = Duration::from_secs(3600);

async fn solo_node(id: &str) -> Result<raftkv_core::node::NodeHandle> {
    let config = NodeConfig {
        id: id.to_string(),
        peers: vec![],
        election_timeout: (PARKED, PARKED),
        heartbeat_interval: PARKED,
    };
    let store = DurableStore::open_temporary()?;
    let requester = Arc::new(MockPeerRequester::new());
    let (handle, _join) = node::spawn(config, store, requester)?;
    Ok(handle)
}

fn vote_req(term: u64, candidate: &str, last_index: u64, last_term: u64) -> RequestVoteRequest {
    RequestVoteRequest {
        term,
        candidate_id: candidate.to_string(),
        last_log_index: last_index,
        last_log_term: last_term,
    }
}

fn append_req(
    term: u64,
    leader: &str,
    commit_index: u64,
    prev_log_index: u64,
    prev_log_term: u64,
    entries: Vec<LogEntry>,
) -> AppendEntriesRequest {
    AppendEntriesRequest {
        term,
        leader_id: leader.to_string(),
        commit_index,
        prev_log_index,
        prev_log_term,
        log_entries: entries,
    }
}

#[tokio::test]
async fn test_safety_stale_term_vote_is_rejected() -> Result<()> {
    let node = solo_node("n0").await?;

    let granted = node.request_vote(vote_req(5, "a", 0, 0)).await?;
    assert!(granted.vote_granted);

    let rejected = node.request_vote(vote_req(3, "b", 0, 0)).await?;
    assert!(!rejected.vote_granted, "a vote request from a stale term must never be granted");
    assert_eq!(rejected.term, 5, "the reply must carry the node's current term, not the stale one");
    Ok(())
}

#[tokio::test]
async fn test_safety_one_vote_per_term() -> Result<()> {
    let node = solo_node("n0").await?;

    let first = node.request_vote(vote_req(5, "a", 0, 0)).await?;
    assert!(first.vote_granted);

    let second = node.request_vote(vote_req(5, "b", 0, 0)).await?;
    assert!(!second.vote_granted, "a node must not grant two votes in the same term");

    // A repeated request from the same candidate in the same term is
    // idempotent, not a second vote.
    let repeat = node.request_vote(vote_req(5, "a", 0, 0)).await?;
    assert!(repeat.vote_granted);
    Ok(())
}

#[tokio::test]
async fn test_safety_vote_denied_for_stale_log() -> Result<()> {
    let node = solo_node("n0").await?;

    // Bring the node's log to (index=2, term=3) via a leader append.
    node.append_entries(append_req(
        3,
        "L",
        0,
        0,
        0,
        vec![
            LogEntry { index: 1, term: 3, command: Command::put("k", "v") },
            LogEntry { index: 2, term: 3, command: Command::put("k2", "v2") },
        ],
    ))
    .await?;

    let stale_candidate = node.request_vote(vote_req(4, "c", 1, 3)).await?;
    assert!(!stale_candidate.vote_granted, "a candidate less up-to-date than the voter must be denied");

    let caught_up_candidate = node.request_vote(vote_req(4, "c", 2, 3)).await?;
    assert!(caught_up_candidate.vote_granted);
    Ok(())
}

#[tokio::test]
async fn test_safety_append_entries_rejected_on_log_mismatch() -> Result<()> {
    let node = solo_node("n0").await?;

    let reply = node.append_entries(append_req(1, "L", 0, 5, 3, vec![])).await?;
    assert!(!reply.success, "an append with a prev-log index/term the follower doesn't have must be rejected");
    assert_eq!(reply.last_log_index, 0);
    Ok(())
}

#[tokio::test]
async fn test_safety_stale_term_append_entries_rejected_without_mutating_log() -> Result<()> {
    let node = solo_node("n0").await?;

    // Bring the node's term to 5 without touching its log.
    node.request_vote(vote_req(5, "a", 0, 0)).await?;

    let reply = node.append_entries(append_req(4, "stale-leader", 0, 0, 0, vec![
        LogEntry { index: 1, term: 4, command: Command::put("x", "1") },
    ])).await?;
    assert!(!reply.success, "a leader from a stale term must be rejected outright");
    assert_eq!(reply.term, 5, "the reply must carry the current term so the stale leader steps down");
    assert_eq!(reply.last_log_index, 0, "a rejected append must not mutate the log");
    Ok(())
}

#[tokio::test]
async fn test_liveness_append_entries_accepted_and_commit_index_advances() -> Result<()> {
    let node = solo_node("n0").await?;

    let reply = node
        .append_entries(append_req(
            1,
            "L",
            0,
            0,
            0,
            vec![
                LogEntry { index: 1, term: 1, command: Command::put("k", "v") },
                LogEntry { index: 2, term: 1, command: Command::put("k2", "v2") },
            ],
        ))
        .await?;
    assert!(reply.success);
    assert_eq!(reply.last_log_index, 2);

    let heartbeat = node.append_entries(append_req(1, "L", 2, 2, 1, vec![])).await?;
    assert!(heartbeat.success);

    let status = node.status().await?;
    assert_eq!(status.commit_index, 2, "commitIndex must advance to the leader's advertised value");
    Ok(())
}

#[tokio::test]
async fn test_safety_conflicting_entries_are_truncated_and_replaced() -> Result<()> {
    let node = solo_node("n0").await?;

    node.append_entries(append_req(
        1,
        "L1",
        0,
        0,
        0,
        vec![
            LogEntry { index: 1, term: 1, command: Command::put("a", "1") },
            LogEntry { index: 2, term: 1, command: Command::put("b", "2") },
        ],
    ))
    .await?;

    // A new leader for term 2 overwrites index 2 with a different entry.
    let reply = node
        .append_entries(append_req(
            2,
            "L2",
            0,
            1,
            1,
            vec![LogEntry { index: 2, term: 2, command: Command::put("b", "replaced") }],
        ))
        .await?;
    assert!(reply.success);
    assert_eq!(reply.last_log_index, 2);

    // The prior (term 1, index 2) entry must no longer satisfy the
    // log-matching check -- it has been replaced, not appended after.
    let mismatch = node.append_entries(append_req(2, "L2", 0, 2, 1, vec![])).await?;
    assert!(!mismatch.success, "stale term at index 2 must have been discarded by the truncation");

    let matches_new = node.append_entries(append_req(2, "L2", 0, 2, 2, vec![])).await?;
    assert!(matches_new.success);
    Ok(())
}

#[tokio::test]
async fn test_safety_higher_term_append_entries_steps_down_a_candidate() -> Result<()> {
    let node = solo_node("n0").await?;

    // Make this node vote for itself in term 1, simulating a split-vote
    // candidacy (it has no peers so it can't win on its own).
    node.request_vote(vote_req(1, "n0", 0, 0)).await?;

    let reply = node.append_entries(append_req(7, "L", 0, 0, 0, vec![])).await?;
    assert!(reply.success);
    assert_eq!(reply.term, 7);

    // Once it has observed term 7 it must accept a vote request for
    // that same term from a fresh candidate.
    let vote = node.request_vote(vote_req(7, "other", 0, 0)).await?;
    assert!(vote.vote_granted);
    Ok(())
}
