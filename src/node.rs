use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use log::{error, info};
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::command::{
    AppendEntriesReply, AppendEntriesRequest, Command, CommandReply, LogEntry, Op,
    PeerDescriptor, RequestVoteReply, RequestVoteRequest, StatusReply,
};
use crate::error::CoreError;
use crate::log_view::LogView;
use crate::requester::{PeerRequestError, PeerRequester};
use crate::role::Role;
use crate::store::DurableStore;

/// How many log entries a single `AppendEntries` round carries at most.
/// Large backlogs are caught up over several heartbeats rather than one
/// unbounded RPC.
const MAX_ENTRIES_PER_ROUND: usize = 64;

/// Static cluster and timing configuration for one node. The peer set
/// is fixed at startup and known to include every replica but the
/// local one.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub id: String,
    pub peers: Vec<PeerDescriptor>,
    pub election_timeout: (Duration, Duration),
    pub heartbeat_interval: Duration,
}

/// Everything that can arrive at the event loop. Every variant but the
/// two timer ticks carries a reply slot; the loop produces exactly one
/// reply per event and never lets a protocol-level rejection escape as
/// an error.
pub enum Event {
    RequestVote(RequestVoteRequest, oneshot::Sender<RequestVoteReply>),
    AppendEntries(AppendEntriesRequest, oneshot::Sender<AppendEntriesReply>),
    Command(Command, oneshot::Sender<Result<CommandReply, CoreError>>),
    VoteReply {
        peer: String,
        term_sent: u64,
        result: Result<RequestVoteReply, PeerRequestError>,
    },
    AppendReply {
        peer: String,
        term_sent: u64,
        prev_log_index: u64,
        entries_sent: usize,
        result: Result<AppendEntriesReply, PeerRequestError>,
    },
    ElectionTick,
    HeartbeatTick,
    ShowStatus(oneshot::Sender<StatusReply>),
    Shutdown(oneshot::Sender<()>),
}

/// A cheap, cloneable capability to talk to one node's event loop.
/// Transport handlers, client intake and the `PeerRequester`
/// implementations all go through this -- never through the `Node`
/// directly, since the loop is the sole owner of its state.
#[derive(Clone)]
pub struct NodeHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl NodeHandle {
    async fn call<T>(
        &self,
        make_event: impl FnOnce(oneshot::Sender<T>) -> Event,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make_event(tx))
            .map_err(|_| anyhow!("node event loop is not running"))?;
        rx.await.map_err(|_| anyhow!("node event loop dropped the reply"))
    }

    pub async fn request_vote(&self, req: RequestVoteRequest) -> Result<RequestVoteReply> {
        self.call(|tx| Event::RequestVote(req, tx)).await
    }

    pub async fn append_entries(&self, req: AppendEntriesRequest) -> Result<AppendEntriesReply> {
        self.call(|tx| Event::AppendEntries(req, tx)).await
    }

    pub async fn submit_command(&self, command: Command) -> Result<Result<CommandReply, CoreError>> {
        self.call(|tx| Event::Command(command, tx)).await
    }

    pub async fn status(&self) -> Result<StatusReply> {
        self.call(Event::ShowStatus).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.call(Event::Shutdown).await
    }
}

/// The single-threaded serialization point: the event loop and role
/// state machine described in spec section 4.4. Owns every piece of
/// mutable node state; nothing outside the loop ever touches it
/// directly.
pub struct Node {
    id: String,
    peers: Vec<PeerDescriptor>,

    store: DurableStore,
    log: LogView,

    current_term: u64,
    voted_for: Option<String>,
    commit_index: u64,
    last_applied: u64,

    role: Role,
    leader_id: Option<String>,

    election_deadline: Instant,
    election_timeout_range: (Duration, Duration),
    heartbeat_interval: Duration,

    kv: HashMap<Vec<u8>, Vec<u8>>,
    /// Keyed by log index; each entry also carries the term the command
    /// was registered under, so a truncation-and-replace by a later
    /// leader (different term reusing the same index) is detected at
    /// apply time instead of handing the reply to the wrong command.
    pending: BTreeMap<u64, (u64, oneshot::Sender<Result<CommandReply, CoreError>>)>,

    requester: Arc<dyn PeerRequester>,
    events_tx: mpsc::UnboundedSender<Event>,

    election_timer: AbortHandle,
    heartbeat_timer: AbortHandle,
}

/// Builds a node from durable state (or zero), replays committed
/// entries into the KV map, spawns its event loop and timers, and
/// returns a handle plus the loop's join handle.
pub fn spawn(
    config: NodeConfig,
    store: DurableStore,
    requester: Arc<dyn PeerRequester>,
) -> Result<(NodeHandle, tokio::task::JoinHandle<Result<()>>)> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let log = LogView::new(store.clone())?;
    let current_term = store.get_current_term()?;
    let voted_for = store.get_vote_for()?;
    let commit_index = store.get_commit_index()?;

    let election_timer = tokio::spawn(run_election_ticker(events_tx.clone(), config.election_timeout));
    let heartbeat_timer = tokio::spawn(run_heartbeat_ticker(events_tx.clone(), config.heartbeat_interval));

    let mut node = Node {
        id: config.id,
        peers: config.peers,
        store,
        log,
        current_term,
        voted_for,
        commit_index,
        // Applied KV state is never persisted (spec non-goal); it is
        // always rebuilt by replaying the committed log from index 1.
        last_applied: 0,
        role: Role::Follower,
        leader_id: None,
        election_deadline: Instant::now(),
        election_timeout_range: config.election_timeout,
        heartbeat_interval: config.heartbeat_interval,
        kv: HashMap::new(),
        pending: BTreeMap::new(),
        requester,
        events_tx,
        election_timer: election_timer.abort_handle(),
        heartbeat_timer: heartbeat_timer.abort_handle(),
    };

    node.reset_election_timer();
    node.run_applier()?;

    let handle = NodeHandle { tx: node.events_tx.clone() };
    let join = tokio::spawn(node.run(events_rx));
    Ok((handle, join))
}

async fn run_election_ticker(tx: mpsc::UnboundedSender<Event>, range: (Duration, Duration)) {
    loop {
        tokio::time::sleep(random_duration(range)).await;
        if tx.send(Event::ElectionTick).is_err() {
            return;
        }
    }
}

async fn run_heartbeat_ticker(tx: mpsc::UnboundedSender<Event>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        if tx.send(Event::HeartbeatTick).is_err() {
            return;
        }
    }
}

fn random_duration((min, max): (Duration, Duration)) -> Duration {
    if min >= max {
        return min;
    }
    let min_ms = min.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
}

impl Node {
    /// Drains events in enqueue order until a `Shutdown` event arrives
    /// or a fatal durable-store error surfaces. Every reply posted by
    /// the loop follows the durable write it depends on.
    pub async fn run(mut self, mut events_rx: mpsc::UnboundedReceiver<Event>) -> Result<()> {
        let result = loop {
            let event = match events_rx.recv().await {
                Some(event) => event,
                None => break Ok(()),
            };
            if let Event::Shutdown(ack) = event {
                self.handle_shutdown(None);
                let _ = ack.send(());
                break Ok(());
            }
            if let Err(e) = self.handle_event(event) {
                // A fatal durable-store failure: surface it and stop
                // rather than risk replying success without durability.
                self.handle_shutdown(Some(e.to_string()));
                break Err(e);
            }
        };
        self.election_timer.abort();
        self.heartbeat_timer.abort();
        let _ = self.store.clone().close();
        result
    }

    /// Drains pending client replies. `storage_failure` distinguishes a
    /// clean shutdown (pending commands were simply never reached) from
    /// one forced by a durable-store error (pending commands are not
    /// known to be safe and must be reported as such, not dropped
    /// silently).
    fn handle_shutdown(&mut self, storage_failure: Option<String>) {
        self.election_timer.abort();
        self.heartbeat_timer.abort();
        for (_, (_, reply_tx)) in std::mem::take(&mut self.pending) {
            let err = match &storage_failure {
                Some(msg) => CoreError::Storage(msg.clone()),
                None => CoreError::ShuttingDown,
            };
            let _ = reply_tx.send(Err(err));
        }
    }

    fn handle_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::RequestVote(req, reply_tx) => {
                let reply = self.handle_request_vote(req)?;
                let _ = reply_tx.send(reply);
            }
            Event::AppendEntries(req, reply_tx) => {
                let reply = self.handle_append_entries(req)?;
                let _ = reply_tx.send(reply);
                self.run_applier()?;
            }
            Event::Command(command, reply_tx) => {
                self.handle_command(command, reply_tx)?;
            }
            Event::VoteReply { peer, term_sent, result } => {
                self.handle_vote_reply(peer, term_sent, result)?;
            }
            Event::AppendReply { peer, term_sent, prev_log_index, entries_sent, result } => {
                self.handle_append_reply(peer, term_sent, prev_log_index, entries_sent, result)?;
                self.run_applier()?;
            }
            Event::ElectionTick => self.handle_election_tick()?,
            Event::HeartbeatTick => self.handle_heartbeat_tick(),
            Event::ShowStatus(reply_tx) => {
                let _ = reply_tx.send(self.status());
            }
            Event::Shutdown(_) => unreachable!("handled in run()"),
        }
        Ok(())
    }

    // -- term rule -------------------------------------------------

    /// If `term` is ahead of ours, adopt it, clear our vote and step
    /// down to Follower, durably, before anything else proceeds.
    fn observe_term(&mut self, term: u64) -> Result<()> {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.store.put_current_term(term)?;
            self.store.put_vote_for(None)?;
            self.step_down();
        }
        Ok(())
    }

    fn step_down(&mut self) {
        if self.role.is_leader() {
            info!("{} stepping down from leader to follower for term {}", self.id, self.current_term);
        } else if self.role.is_candidate() {
            info!("{} abandoning candidacy for follower for term {}", self.id, self.current_term);
        }
        self.role = Role::Follower;
    }

    fn reset_election_timer(&mut self) {
        self.election_deadline = Instant::now() + random_duration(self.election_timeout_range);
    }

    // -- RequestVote -------------------------------------------------

    fn handle_request_vote(&mut self, req: RequestVoteRequest) -> Result<RequestVoteReply> {
        if req.term > self.current_term {
            self.observe_term(req.term)?;
        }
        if req.term < self.current_term {
            return Ok(RequestVoteReply {
                term: self.current_term,
                vote_granted: false,
                message: "stale term".to_string(),
            });
        }

        let can_vote = self.voted_for.as_deref().map_or(true, |v| v == req.candidate_id);
        let up_to_date = (req.last_log_term, req.last_log_index)
            >= (self.log.last_term(), self.log.last_index());

        if can_vote && up_to_date {
            self.voted_for = Some(req.candidate_id.clone());
            self.store.put_vote_for(Some(&req.candidate_id))?;
            self.reset_election_timer();
            info!("{} granted vote to {} for term {}", self.id, req.candidate_id, self.current_term);
            Ok(RequestVoteReply { term: self.current_term, vote_granted: true, message: String::new() })
        } else {
            error!(
                "{} denied vote to {} for term {} (can_vote={} up_to_date={})",
                self.id, req.candidate_id, self.current_term, can_vote, up_to_date
            );
            Ok(RequestVoteReply {
                term: self.current_term,
                vote_granted: false,
                message: "vote not granted".to_string(),
            })
        }
    }

    // -- AppendEntries -------------------------------------------------

    fn reject_append(&self, reason: &str) -> AppendEntriesReply {
        error!(
            "{} AppendEntries rejected: {} (log_len={})",
            self.id, reason, self.log.last_index()
        );
        AppendEntriesReply {
            term: self.current_term,
            success: false,
            message: "rejected".to_string(),
            last_log_index: self.log.last_index(),
        }
    }

    fn handle_append_entries(&mut self, req: AppendEntriesRequest) -> Result<AppendEntriesReply> {
        if req.term < self.current_term {
            return Ok(self.reject_append(&format!(
                "stale term {} < current term {}",
                req.term, self.current_term
            )));
        }
        if req.term > self.current_term {
            self.observe_term(req.term)?;
        }
        // A valid AppendEntries from the current leader always means
        // follow it, even if we were a candidate in this same term.
        self.role = Role::Follower;
        self.leader_id = Some(req.leader_id.clone());
        self.reset_election_timer();

        if !self.log.matches(req.prev_log_index, req.prev_log_term)? {
            return Ok(self.reject_append(&format!(
                "log mismatch at index {} (expected term {})",
                req.prev_log_index, req.prev_log_term
            )));
        }

        if !req.log_entries.is_empty() {
            self.reconcile_log(&req.log_entries)?;
        }

        if req.commit_index > self.commit_index {
            self.commit_index = req.commit_index.min(self.log.last_index());
            self.store.put_commit_index(self.commit_index)?;
        }

        Ok(AppendEntriesReply {
            term: self.current_term,
            success: true,
            message: String::new(),
            last_log_index: self.log.last_index(),
        })
    }

    /// Conflict resolution + append, per spec 4.4: find the first new
    /// entry whose index already holds a different term, truncate from
    /// there, then append everything not already present.
    fn reconcile_log(&mut self, entries: &[LogEntry]) -> Result<()> {
        let mut truncate_from = None;
        for entry in entries {
            match self.log.term_at(entry.index)? {
                Some(existing_term) if existing_term != entry.term => {
                    truncate_from = Some(entry.index);
                    break;
                }
                Some(_) => continue,
                None => break,
            }
        }

        if let Some(from_index) = truncate_from {
            self.store.truncate_suffix(from_index)?;
            self.log.invalidate()?;
        }

        let new_entries: Vec<LogEntry> =
            entries.iter().filter(|e| e.index > self.log.last_index()).cloned().collect();
        if !new_entries.is_empty() {
            self.store.append_entries(&new_entries)?;
            self.log.invalidate()?;
        }
        Ok(())
    }

    // -- election -------------------------------------------------

    fn handle_election_tick(&mut self) -> Result<()> {
        if self.role.is_leader() || Instant::now() < self.election_deadline {
            return Ok(());
        }
        self.start_election()
    }

    fn start_election(&mut self) -> Result<()> {
        self.current_term += 1;
        self.voted_for = Some(self.id.clone());
        self.store.put_current_term(self.current_term)?;
        self.store.put_vote_for(Some(&self.id))?;
        self.reset_election_timer();
        self.leader_id = None;

        let mut votes = std::collections::HashSet::new();
        votes.insert(self.id.clone());
        let self_vote_wins = votes.len() >= self.quorum();
        self.role = Role::Candidate { votes };

        info!("{} starting election for term {}", self.id, self.current_term);

        // A lone node (no peers) is its own majority -- it would never
        // otherwise receive the vote reply that triggers become_leader.
        if self_vote_wins {
            self.become_leader();
            return Ok(());
        }

        let term = self.current_term;
        let last_log_index = self.log.last_index();
        let last_log_term = self.log.last_term();
        for peer in self.peers.clone() {
            let req = RequestVoteRequest {
                term,
                candidate_id: self.id.clone(),
                last_log_index,
                last_log_term,
            };
            self.spawn_vote_request(peer, req);
        }
        Ok(())
    }

    fn spawn_vote_request(&self, peer: PeerDescriptor, req: RequestVoteRequest) {
        let requester = self.requester.clone();
        let tx = self.events_tx.clone();
        let term_sent = req.term;
        let peer_id = peer.id.clone();
        tokio::spawn(async move {
            let result = requester.request_vote(&peer, req).await;
            let _ = tx.send(Event::VoteReply { peer: peer_id, term_sent, result });
        });
    }

    fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    fn handle_vote_reply(
        &mut self,
        peer: String,
        term_sent: u64,
        result: Result<RequestVoteReply, PeerRequestError>,
    ) -> Result<()> {
        if term_sent != self.current_term {
            return Ok(()); // reply belongs to an election we've already moved past
        }
        let reply = match result {
            Ok(reply) => reply,
            Err(_) => return Ok(()), // transient failure: contributes no vote
        };
        if reply.term > self.current_term {
            return self.observe_term(reply.term);
        }
        if !reply.vote_granted {
            return Ok(());
        }

        let became_leader = if let Role::Candidate { votes } = &mut self.role {
            votes.insert(peer);
            votes.len() >= self.quorum()
        } else {
            false
        };
        if became_leader {
            self.become_leader();
        }
        Ok(())
    }

    fn become_leader(&mut self) {
        let last_index = self.log.last_index();
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        for peer in &self.peers {
            next_index.insert(peer.id.clone(), last_index + 1);
            match_index.insert(peer.id.clone(), 0);
        }
        match_index.insert(self.id.clone(), last_index);
        self.role = Role::Leader { next_index, match_index };
        self.leader_id = Some(self.id.clone());
        info!("{} became leader for term {}", self.id, self.current_term);
        self.replicate_to_all_peers();
    }

    // -- replication (leader-only) -------------------------------------------------

    fn handle_heartbeat_tick(&mut self) {
        if self.role.is_leader() {
            self.replicate_to_all_peers();
        }
    }

    fn replicate_to_all_peers(&self) {
        let Role::Leader { next_index, .. } = &self.role else { return };
        for peer in self.peers.clone() {
            let next = *next_index.get(&peer.id).unwrap_or(&(self.log.last_index() + 1));
            self.replicate_to_peer(peer, next);
        }
    }

    fn replicate_to_peer(&self, peer: PeerDescriptor, next_index: u64) {
        let prev_log_index = next_index.saturating_sub(1);
        let prev_log_term = self.log.term_at(prev_log_index).ok().flatten().unwrap_or(0);
        let entries = self.log.slice(next_index, MAX_ENTRIES_PER_ROUND).unwrap_or_default();
        let entries_sent = entries.len();

        let req = AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id.clone(),
            commit_index: self.commit_index,
            prev_log_index,
            prev_log_term,
            log_entries: entries,
        };

        let requester = self.requester.clone();
        let tx = self.events_tx.clone();
        let term_sent = self.current_term;
        let peer_id = peer.id.clone();
        tokio::spawn(async move {
            let result = requester.append_entries(&peer, req).await;
            let _ = tx.send(Event::AppendReply {
                peer: peer_id,
                term_sent,
                prev_log_index,
                entries_sent,
                result,
            });
        });
    }

    fn handle_append_reply(
        &mut self,
        peer: String,
        term_sent: u64,
        prev_log_index: u64,
        entries_sent: usize,
        result: Result<AppendEntriesReply, PeerRequestError>,
    ) -> Result<()> {
        if term_sent != self.current_term || !self.role.is_leader() {
            return Ok(());
        }
        let reply = match result {
            Ok(reply) => reply,
            Err(_) => return Ok(()), // transient: retried on next heartbeat
        };
        if reply.term > self.current_term {
            return self.observe_term(reply.term);
        }

        let mut should_advance = false;
        if let Role::Leader { next_index, match_index } = &mut self.role {
            if reply.success {
                // Exactly the entries this round proved replicated -- a
                // follower's reported `lastLogIndex` can include a stale
                // tail beyond what this round's consistency check
                // actually validated, and crediting it would let
                // `advance_commit_index` count a false majority.
                let new_match = prev_log_index + entries_sent as u64;
                let current_match = *match_index.get(&peer).unwrap_or(&0);
                if new_match > current_match {
                    match_index.insert(peer.clone(), new_match);
                    next_index.insert(peer, new_match + 1);
                    should_advance = true;
                }
            } else {
                let current_next = *next_index.get(&peer).unwrap_or(&1);
                let suggested = (reply.last_log_index + 1).max(1);
                let decremented = current_next.saturating_sub(1).max(1);
                let new_next = suggested.min(decremented);
                if new_next < current_next {
                    next_index.insert(peer, new_next);
                }
            }
        }
        if should_advance {
            self.advance_commit_index()?;
        }
        Ok(())
    }

    /// Finds the highest `N > commitIndex` replicated on a majority
    /// (leader included) whose entry's term equals the current term,
    /// and advances `commitIndex` to it. The term check is what keeps a
    /// leader from committing a predecessor's entries by vote-counting
    /// alone (Raft section 5.4.2).
    fn advance_commit_index(&mut self) -> Result<()> {
        let Role::Leader { match_index, .. } = &self.role else { return Ok(()) };
        let majority = self.quorum();
        let last_index = self.log.last_index();
        let mut new_commit = self.commit_index;

        for n in (self.commit_index + 1)..=last_index {
            let replicated = match_index.values().filter(|&&m| m >= n).count();
            if replicated < majority {
                break; // match_index-based counts are non-increasing in n
            }
            if self.log.term_at(n)?.map_or(false, |t| t == self.current_term) {
                new_commit = n;
            }
        }

        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            self.store.put_commit_index(self.commit_index)?;
            info!("{} advanced commitIndex to {}", self.id, self.commit_index);
        }
        Ok(())
    }

    // -- client command intake -------------------------------------------------

    fn handle_command(
        &mut self,
        command: Command,
        reply_tx: oneshot::Sender<Result<CommandReply, CoreError>>,
    ) -> Result<()> {
        if !self.role.is_leader() {
            let _ = reply_tx.send(Err(CoreError::NotLeader { leader_id: self.leader_id.clone() }));
            return Ok(());
        }

        let index = self.log.last_index() + 1;
        let entry = LogEntry { index, term: self.current_term, command };
        self.store.append_entries(std::slice::from_ref(&entry))?;
        self.log.invalidate()?;
        self.pending.insert(index, (self.current_term, reply_tx));

        if let Role::Leader { match_index, .. } = &mut self.role {
            match_index.insert(self.id.clone(), index);
        }

        self.replicate_to_all_peers();
        self.advance_commit_index()?;
        self.run_applier()
    }

    // -- applier -------------------------------------------------

    /// Advances `lastApplied` toward `commitIndex`, executing each
    /// committed command against the KV map in strict index order and
    /// unblocking any pending client reply keyed to that index.
    ///
    /// A pending reply is only honored if the entry actually applied at
    /// its index still carries the term it was registered under -- a
    /// later leader can truncate an uncommitted entry this node (as
    /// leader) accepted and replace that same index with an unrelated
    /// command, and the original caller must not be told its command
    /// applied when it didn't.
    fn run_applier(&mut self) -> Result<()> {
        while self.last_applied < self.commit_index {
            let next = self.last_applied + 1;
            let entry = self
                .store
                .entry_at(next)?
                .ok_or_else(|| anyhow!("missing log entry {next} below commitIndex"))?;
            let value = self.apply(&entry.command);

            self.last_applied = next;
            self.store.put_last_applied(self.last_applied)?;

            if let Some((registered_term, reply_tx)) = self.pending.remove(&next) {
                let reply = if registered_term == entry.term {
                    Ok(CommandReply { message: "applied".to_string(), value })
                } else {
                    Err(CoreError::NotLeader { leader_id: self.leader_id.clone() })
                };
                let _ = reply_tx.send(reply);
            }
        }
        Ok(())
    }

    fn apply(&mut self, command: &Command) -> Option<Vec<u8>> {
        match command.op {
            Op::Nop => None,
            Op::Put => {
                self.kv.insert(command.key.clone(), command.value.clone().unwrap_or_default());
                None
            }
            Op::Delete => {
                self.kv.remove(&command.key);
                None
            }
            Op::Get => self.kv.get(&command.key).cloned(),
        }
    }

    // -- status -------------------------------------------------

    fn status(&self) -> StatusReply {
        StatusReply {
            term: self.current_term,
            commit_index: self.commit_index,
            peers: self
                .peers
                .iter()
                .cloned()
                .map(|p| (p.id.clone(), p))
                .collect(),
            state: self.role.label().to_string(),
        }
    }
}
