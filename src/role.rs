use std::collections::{HashMap, HashSet};

/// The three Raft roles, as a tagged variant rather than a base class
/// with subtypes: each role carries only the scratch state meaningful
/// to it, and a transition replaces the whole value instead of mutating
/// fields that belong to a different role.
pub enum Role {
    Follower,
    Candidate {
        /// Peer ids (including self) that have granted a vote this term.
        votes: HashSet<String>,
    },
    Leader {
        /// Next log index to send to each peer, initialized to
        /// leader's last index + 1.
        next_index: HashMap<String, u64>,
        /// Highest index known replicated on each peer (and on the
        /// leader itself, under its own id).
        match_index: HashMap<String, u64>,
    },
}

impl Role {
    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader { .. })
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Role::Candidate { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Role::Follower => "follower",
            Role::Candidate { .. } => "candidate",
            Role::Leader { .. } => "leader",
        }
    }
}
