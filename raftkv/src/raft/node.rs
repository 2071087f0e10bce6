//! Raft core implementation
//! This module contains the consensus state machine itself: leader election,
//! log replication, commit-index advancement and snapshot handling. All
//! mutable state lives behind a single lock; timers and RPC fan-out run as
//! independent tokio tasks and merge their results back under that lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::timeout;

use crate::raft::log::{LogEntry, RaftLog};
use crate::raft::storage::{PersistedState, Persister, STATE_ENCODING_VERSION};
use crate::raft::{
    AppState, AppendEntriesArgs, AppendEntriesReply, ApplyMsg, InstallSnapshotArgs,
    InstallSnapshotReply, RaftResult, RaftTransport, RequestVoteArgs, RequestVoteReply, Role,
    APPLY_INTERVAL, CONSENSUS_TIMEOUT, ELECTION_TIMEOUT_MAX_MS, ELECTION_TIMEOUT_MIN_MS,
    HEARTBEAT_INTERVAL,
};

/// Mutable state guarded by the single lock.
struct RaftInner {
    current_term: u64,
    voted_for: Option<u64>,
    log: RaftLog,
    // Latest snapshot blob; persisted next to the raft state and shipped to
    // peers that have fallen behind the snapshot boundary.
    snapshot: Vec<u8>,

    commit_index: u64,
    last_applied: u64,
    role: Role,
    last_election_reset: Instant,
    last_heartbeat_reset: Instant,

    // Leader-only views, rebuilt on every leadership acquisition.
    next_index: HashMap<u64, u64>,
    match_index: HashMap<u64, u64>,
}

impl RaftInner {
    fn step_down(&mut self, term: u64) {
        self.role = Role::Follower;
        self.current_term = term;
        self.voted_for = None;
    }

    fn become_leader(&mut self, peers: &[u64]) {
        self.role = Role::Leader;
        let next = self.log.last_index() + 1;
        self.next_index.clear();
        self.match_index.clear();
        for &peer in peers {
            self.next_index.insert(peer, next);
            self.match_index.insert(peer, 0);
        }
    }
}

/// Work planned for one peer during a replication round.
enum Outbound {
    Entries(AppendEntriesArgs),
    Snapshot(InstallSnapshotArgs),
}

pub struct RaftCore {
    me: u64,
    peers: Vec<u64>,
    transport: Arc<dyn RaftTransport>,
    persister: Arc<Persister>,
    apply_tx: UnboundedSender<ApplyMsg>,
    inner: Mutex<RaftInner>,
}

impl RaftCore {
    /// Restores persisted state (defaults if absent) and returns the core.
    /// Call [`RaftCore::run`] afterwards to start the background tickers.
    pub fn new(
        me: u64,
        peers: Vec<u64>,
        transport: Arc<dyn RaftTransport>,
        persister: Arc<Persister>,
        apply_tx: UnboundedSender<ApplyMsg>,
    ) -> RaftResult<Arc<Self>> {
        let mut inner = RaftInner {
            current_term: 0,
            voted_for: None,
            log: RaftLog::new(),
            snapshot: Vec::new(),
            commit_index: 0,
            last_applied: 0,
            role: Role::Follower,
            last_election_reset: Instant::now(),
            last_heartbeat_reset: Instant::now(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
        };

        if let Some(data) = persister.read_raft_state()? {
            let state = PersistedState::decode(&data)?;
            inner.current_term = state.current_term;
            inner.voted_for = state.voted_for;
            inner.log = RaftLog::restore(
                state.entries,
                state.last_snapshot_index,
                state.last_snapshot_term,
            );
            // Everything up to the snapshot boundary is known committed and
            // re-delivered to the application via the snapshot blob.
            inner.commit_index = state.last_snapshot_index;
            inner.last_applied = state.last_snapshot_index;
            log::info!(
                "node {} restored term {} with log ({}, {}]",
                me,
                state.current_term,
                state.last_snapshot_index,
                inner.log.last_index()
            );
        }
        if let Some(snapshot) = persister.read_snapshot()? {
            inner.snapshot = snapshot;
        }

        Ok(Arc::new(RaftCore {
            me,
            peers,
            transport,
            persister,
            apply_tx,
            inner: Mutex::new(inner),
        }))
    }

    /// Spawns the election, heartbeat and apply tickers. They run until
    /// process exit; the core has no stop API.
    pub fn run(self: &Arc<Self>) {
        let rf = Arc::clone(self);
        tokio::spawn(async move { rf.election_ticker().await });
        let rf = Arc::clone(self);
        tokio::spawn(async move { rf.heartbeat_ticker().await });
        let rf = Arc::clone(self);
        tokio::spawn(async move { rf.apply_ticker().await });
    }

    /// Appends `command` to the log if this node currently leads. Returns
    /// the assigned index and term; does not wait for commit.
    pub fn start(&self, command: Vec<u8>) -> Option<(u64, u64)> {
        let mut rf = self.inner.lock().unwrap();
        if rf.role != Role::Leader {
            return None;
        }
        let index = rf.log.last_index() + 1;
        let term = rf.current_term;
        rf.log.append(LogEntry {
            index,
            term,
            command,
        });
        self.persist(&rf);
        Some((index, term))
    }

    pub fn get_state(&self) -> (u64, bool) {
        let rf = self.inner.lock().unwrap();
        (rf.current_term, rf.role == Role::Leader)
    }

    pub fn raft_state_size(&self) -> u64 {
        self.persister.raft_state_size()
    }

    /// Compacts the log up to `index`, which the application guarantees is
    /// covered by `data`. Rejected when `index` is already inside the
    /// snapshot or not yet applied.
    pub fn snapshot(&self, index: u64, data: Vec<u8>) {
        let mut rf = self.inner.lock().unwrap();
        if index <= rf.log.last_snapshot_index() || index > rf.last_applied {
            log::debug!(
                "node {} ignoring snapshot at {} (boundary {}, applied {})",
                self.me,
                index,
                rf.log.last_snapshot_index(),
                rf.last_applied
            );
            return;
        }
        let term = rf.log.term_at(index);
        rf.log.compact_to(index, term);
        rf.snapshot = data;
        self.persist(&rf);
        log::info!("node {} compacted log through ({}, {})", self.me, index, term);
    }

    /// Guard for the application layer before it switches to a delivered
    /// snapshot: rejects one that a newer boundary has already superseded.
    pub fn cond_install_snapshot(&self, last_included_term: u64, last_included_index: u64) -> bool {
        let rf = self.inner.lock().unwrap();
        if last_included_index < rf.log.last_snapshot_index() {
            return false;
        }
        if last_included_index == rf.log.last_snapshot_index()
            && last_included_term != rf.log.last_snapshot_term()
        {
            return false;
        }
        true
    }

    // ------------------------------------------------------------------
    // RPC handlers (invoked by the transport layer)
    // ------------------------------------------------------------------

    pub fn handle_request_vote(&self, args: &RequestVoteArgs) -> RequestVoteReply {
        let mut rf = self.inner.lock().unwrap();
        // Single exit below: every path through the body persists before
        // the reply leaves this node.
        let reply = self.request_vote_locked(&mut rf, args);
        self.persist(&rf);
        reply
    }

    fn request_vote_locked(&self, rf: &mut RaftInner, args: &RequestVoteArgs) -> RequestVoteReply {
        if args.term < rf.current_term {
            return RequestVoteReply {
                term: rf.current_term,
                vote_granted: false,
            };
        }
        if args.term > rf.current_term {
            rf.step_down(args.term);
        }

        // Election restriction: the candidate's log must be at least as
        // up-to-date as ours. Last term dominates; index breaks ties.
        let up_to_date = args.last_log_term > rf.log.last_term()
            || (args.last_log_term == rf.log.last_term()
                && args.last_log_index >= rf.log.last_index());
        let can_vote = rf.voted_for.is_none() || rf.voted_for == Some(args.candidate_id);

        if up_to_date && can_vote {
            rf.voted_for = Some(args.candidate_id);
            rf.last_election_reset = Instant::now();
            log::debug!(
                "node {} votes for {} in term {}",
                self.me,
                args.candidate_id,
                rf.current_term
            );
            RequestVoteReply {
                term: rf.current_term,
                vote_granted: true,
            }
        } else {
            RequestVoteReply {
                term: rf.current_term,
                vote_granted: false,
            }
        }
    }

    pub fn handle_append_entries(&self, args: &AppendEntriesArgs) -> AppendEntriesReply {
        let mut rf = self.inner.lock().unwrap();
        if args.term < rf.current_term {
            // Stale leader; nothing changed, nothing to persist.
            return AppendEntriesReply {
                term: rf.current_term,
                success: false,
                update_next_index: 0,
                app_state: AppState::Normal,
            };
        }
        let reply = self.append_entries_locked(&mut rf, args);
        self.persist(&rf);
        reply
    }

    fn append_entries_locked(
        &self,
        rf: &mut RaftInner,
        args: &AppendEntriesArgs,
    ) -> AppendEntriesReply {
        if args.term > rf.current_term {
            rf.current_term = args.term;
            rf.voted_for = None;
        }
        // A candidate that hears from the leader of its own term yields.
        rf.role = Role::Follower;
        rf.last_election_reset = Instant::now();

        let fail = |update_next_index: u64, term: u64| AppendEntriesReply {
            term,
            success: false,
            update_next_index,
            app_state: AppState::Normal,
        };

        if args.prev_log_index > rf.log.last_index() {
            return fail(rf.log.last_index() + 1, rf.current_term);
        }
        if args.prev_log_index < rf.log.last_snapshot_index() {
            return fail(rf.log.last_snapshot_index() + 1, rf.current_term);
        }

        if rf.log.matches(args.prev_log_index, args.prev_log_term) {
            // Merge entry by entry; a blind truncate could drop entries a
            // delayed, shorter AppendEntries has no opinion about.
            for entry in &args.entries {
                if entry.index > rf.log.last_index() {
                    rf.log.append(entry.clone());
                } else {
                    let existing = rf.log.entry(entry.index);
                    if existing.term == entry.term && existing.command != entry.command {
                        log::error!(
                            "node {} log diverges from leader {} at index {} term {}",
                            self.me,
                            args.leader_id,
                            entry.index,
                            entry.term
                        );
                        panic!(
                            "log matching violated: divergent commands at index {} term {}",
                            entry.index, entry.term
                        );
                    }
                    if existing.term != entry.term {
                        rf.log.set_entry(entry.clone());
                    }
                }
            }
            if args.leader_commit > rf.commit_index {
                rf.commit_index = args.leader_commit.min(rf.log.last_index());
            }
            AppendEntriesReply {
                term: rf.current_term,
                success: true,
                update_next_index: 0,
                app_state: AppState::Normal,
            }
        } else {
            // prev_log_index is in range but its term conflicts. Hint the
            // first index of the conflicting term so the leader skips the
            // whole run instead of backing up one entry per round.
            let conflict_term = rf.log.term_at(args.prev_log_index);
            let mut index = args.prev_log_index;
            let hint = loop {
                if rf.log.term_at(index) != conflict_term
                    || index == rf.log.last_snapshot_index()
                {
                    break index + 1;
                }
                index -= 1;
            };
            fail(hint, rf.current_term)
        }
    }

    pub fn handle_install_snapshot(&self, args: &InstallSnapshotArgs) -> InstallSnapshotReply {
        let mut rf = self.inner.lock().unwrap();
        if args.term < rf.current_term {
            return InstallSnapshotReply {
                term: rf.current_term,
            };
        }
        let (reply, delivery) = self.install_snapshot_locked(&mut rf, args);
        self.persist(&rf);
        if let Some(msg) = delivery {
            // Delivered only after the new boundary is durable.
            let _ = self.apply_tx.send(msg);
        }
        reply
    }

    fn install_snapshot_locked(
        &self,
        rf: &mut RaftInner,
        args: &InstallSnapshotArgs,
    ) -> (InstallSnapshotReply, Option<ApplyMsg>) {
        if args.term > rf.current_term {
            rf.current_term = args.term;
            rf.voted_for = None;
        }
        rf.role = Role::Follower;
        rf.last_election_reset = Instant::now();

        if args.last_included_index <= rf.log.last_snapshot_index() {
            log::debug!(
                "node {} rejects stale snapshot at {} (boundary {})",
                self.me,
                args.last_included_index,
                rf.log.last_snapshot_index()
            );
            return (
                InstallSnapshotReply {
                    term: rf.current_term,
                },
                None,
            );
        }

        rf.log
            .compact_to(args.last_included_index, args.last_included_term);
        rf.snapshot = args.data.clone();
        rf.commit_index = rf.commit_index.max(args.last_included_index);
        rf.last_applied = rf.last_applied.max(args.last_included_index);
        log::info!(
            "node {} installed snapshot through ({}, {}) from leader {}",
            self.me,
            args.last_included_index,
            args.last_included_term,
            args.leader_id
        );
        (
            InstallSnapshotReply {
                term: rf.current_term,
            },
            Some(ApplyMsg::Snapshot {
                index: args.last_included_index,
                term: args.last_included_term,
                data: args.data.clone(),
            }),
        )
    }

    // ------------------------------------------------------------------
    // Election
    // ------------------------------------------------------------------

    async fn election_ticker(self: Arc<Self>) {
        loop {
            let timeout_span = random_election_timeout();
            let is_leader = {
                let rf = self.inner.lock().unwrap();
                rf.role == Role::Leader
            };
            if is_leader {
                tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                continue;
            }
            let deadline = {
                let rf = self.inner.lock().unwrap();
                rf.last_election_reset + timeout_span
            };
            let now = Instant::now();
            if deadline > now {
                tokio::time::sleep(deadline - now).await;
            }
            let expired = {
                let rf = self.inner.lock().unwrap();
                rf.role != Role::Leader && rf.last_election_reset.elapsed() >= timeout_span
            };
            if expired {
                self.start_election();
            }
        }
    }

    fn start_election(self: &Arc<Self>) {
        let (term, last_log_index, last_log_term) = {
            let mut rf = self.inner.lock().unwrap();
            rf.role = Role::Candidate;
            rf.current_term += 1;
            rf.voted_for = Some(self.me);
            rf.last_election_reset = Instant::now();
            self.persist(&rf);
            (rf.current_term, rf.log.last_index(), rf.log.last_term())
        };
        log::info!("node {} starts election for term {}", self.me, term);

        if self.peers.is_empty() {
            let mut rf = self.inner.lock().unwrap();
            if rf.role == Role::Candidate && rf.current_term == term {
                rf.become_leader(&self.peers);
            }
            return;
        }

        let votes = Arc::new(AtomicU64::new(1)); // own vote
        for &peer in &self.peers {
            let rf = Arc::clone(self);
            let votes = Arc::clone(&votes);
            let args = RequestVoteArgs {
                term,
                candidate_id: self.me,
                last_log_index,
                last_log_term,
            };
            tokio::spawn(async move {
                match timeout(CONSENSUS_TIMEOUT, rf.transport.request_vote(peer, args)).await {
                    Ok(Ok(reply)) => rf.on_vote_reply(term, reply, &votes),
                    // Timeout or transport failure: no reply this round.
                    _ => {}
                }
            });
        }
    }

    fn on_vote_reply(self: &Arc<Self>, issued_term: u64, reply: RequestVoteReply, votes: &AtomicU64) {
        let mut rf = self.inner.lock().unwrap();
        if rf.current_term != issued_term || rf.role != Role::Candidate {
            return; // stale reply, the election moved on
        }
        if reply.term > rf.current_term {
            rf.step_down(reply.term);
            self.persist(&rf);
            return;
        }
        if !reply.vote_granted {
            return;
        }
        let granted = votes.fetch_add(1, Ordering::SeqCst) + 1;
        if granted >= self.majority() {
            rf.become_leader(&self.peers);
            log::info!(
                "node {} becomes leader of term {} with {} votes",
                self.me,
                rf.current_term,
                granted
            );
            drop(rf);
            // Announce leadership before any follower times out again.
            self.broadcast_append_entries();
        }
    }

    // ------------------------------------------------------------------
    // Replication
    // ------------------------------------------------------------------

    async fn heartbeat_ticker(self: Arc<Self>) {
        loop {
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
            let due = {
                let rf = self.inner.lock().unwrap();
                rf.role == Role::Leader && rf.last_heartbeat_reset.elapsed() >= HEARTBEAT_INTERVAL
            };
            if due {
                self.broadcast_append_entries();
            }
        }
    }

    /// One replication round: AppendEntries from `next_index` per peer, or
    /// InstallSnapshot for peers whose entries were compacted away.
    fn broadcast_append_entries(self: &Arc<Self>) {
        let plans: Vec<(u64, Outbound)> = {
            let mut rf = self.inner.lock().unwrap();
            if rf.role != Role::Leader {
                return;
            }
            rf.last_heartbeat_reset = Instant::now();
            let term = rf.current_term;
            let mut plans = Vec::with_capacity(self.peers.len());
            for &peer in &self.peers {
                let next = rf
                    .next_index
                    .get(&peer)
                    .copied()
                    .unwrap_or(rf.log.last_index() + 1);
                if next <= rf.log.last_snapshot_index() {
                    plans.push((
                        peer,
                        Outbound::Snapshot(InstallSnapshotArgs {
                            term,
                            leader_id: self.me,
                            last_included_index: rf.log.last_snapshot_index(),
                            last_included_term: rf.log.last_snapshot_term(),
                            data: rf.snapshot.clone(),
                        }),
                    ));
                } else {
                    let next = next.min(rf.log.last_index() + 1);
                    let prev_log_index = next - 1;
                    plans.push((
                        peer,
                        Outbound::Entries(AppendEntriesArgs {
                            term,
                            leader_id: self.me,
                            prev_log_index,
                            prev_log_term: rf.log.term_at(prev_log_index),
                            entries: rf.log.tail_from(next),
                            leader_commit: rf.commit_index,
                        }),
                    ));
                }
            }
            plans
        };

        for (peer, outbound) in plans {
            let rf = Arc::clone(self);
            tokio::spawn(async move {
                match outbound {
                    Outbound::Entries(args) => {
                        let sent_term = args.term;
                        let prev_log_index = args.prev_log_index;
                        let entry_count = args.entries.len() as u64;
                        match timeout(CONSENSUS_TIMEOUT, rf.transport.append_entries(peer, args))
                            .await
                        {
                            Ok(Ok(reply)) => rf.on_append_entries_reply(
                                peer,
                                sent_term,
                                prev_log_index,
                                entry_count,
                                reply,
                            ),
                            _ => {}
                        }
                    }
                    Outbound::Snapshot(args) => {
                        let sent_term = args.term;
                        let sent_index = args.last_included_index;
                        match timeout(CONSENSUS_TIMEOUT, rf.transport.install_snapshot(peer, args))
                            .await
                        {
                            Ok(Ok(reply)) => {
                                rf.on_install_snapshot_reply(peer, sent_term, sent_index, reply)
                            }
                            _ => {}
                        }
                    }
                }
            });
        }
    }

    fn on_append_entries_reply(
        &self,
        peer: u64,
        sent_term: u64,
        prev_log_index: u64,
        entry_count: u64,
        reply: AppendEntriesReply,
    ) {
        let mut rf = self.inner.lock().unwrap();
        if rf.role != Role::Leader || rf.current_term != sent_term {
            return; // stale reply
        }
        if reply.term > rf.current_term {
            log::info!(
                "node {} steps down: peer {} reports newer term {}",
                self.me,
                peer,
                reply.term
            );
            rf.step_down(reply.term);
            self.persist(&rf);
            return;
        }
        if reply.success {
            let matched = prev_log_index + entry_count;
            let known = rf.match_index.entry(peer).or_insert(0);
            if matched > *known {
                *known = matched;
            }
            rf.next_index.insert(peer, matched + 1);
            self.advance_commit_index(&mut rf);
        } else {
            // Conflict hint; the next heartbeat retries from there.
            rf.next_index.insert(peer, reply.update_next_index.max(1));
        }
    }

    fn on_install_snapshot_reply(
        &self,
        peer: u64,
        sent_term: u64,
        sent_index: u64,
        reply: InstallSnapshotReply,
    ) {
        let mut rf = self.inner.lock().unwrap();
        if rf.role != Role::Leader || rf.current_term != sent_term {
            return;
        }
        if reply.term > rf.current_term {
            rf.step_down(reply.term);
            self.persist(&rf);
            return;
        }
        let known = rf.match_index.entry(peer).or_insert(0);
        if sent_index > *known {
            *known = sent_index;
        }
        rf.next_index.insert(peer, sent_index + 1);
    }

    /// Advances `commit_index` to the highest index replicated on a
    /// majority, and only over an entry appended in the current term —
    /// counting replicas of an older-term entry could commit state a new
    /// leader is allowed to overwrite.
    fn advance_commit_index(&self, rf: &mut RaftInner) {
        let mut index = rf.log.last_index();
        while index > rf.commit_index && index > rf.log.last_snapshot_index() {
            let replicas = 1 + self
                .peers
                .iter()
                .filter(|peer| rf.match_index.get(peer).copied().unwrap_or(0) >= index)
                .count() as u64;
            if replicas >= self.majority() && rf.log.term_at(index) == rf.current_term {
                rf.commit_index = index;
                break;
            }
            index -= 1;
        }
    }

    // ------------------------------------------------------------------
    // Applier
    // ------------------------------------------------------------------

    async fn apply_ticker(self: Arc<Self>) {
        loop {
            tokio::time::sleep(APPLY_INTERVAL).await;
            let msgs = {
                let mut rf = self.inner.lock().unwrap();
                let mut msgs = Vec::new();
                while rf.last_applied < rf.commit_index {
                    let next = rf.last_applied + 1;
                    let entry = rf.log.entry(next);
                    msgs.push(ApplyMsg::Command {
                        index: next,
                        command: entry.command.clone(),
                    });
                    rf.last_applied = next;
                }
                msgs
            };
            for msg in msgs {
                if self.apply_tx.send(msg).is_err() {
                    // Consumer dropped the channel; nothing left to deliver.
                    return;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn majority(&self) -> u64 {
        (self.peers.len() as u64 + 1) / 2 + 1
    }

    /// Flushes the persistent state, together with the latest snapshot
    /// blob, before any reply referencing it may leave this node. A state
    /// we cannot record durably is a state we must not act from.
    fn persist(&self, rf: &RaftInner) {
        let state = PersistedState {
            version: STATE_ENCODING_VERSION,
            current_term: rf.current_term,
            voted_for: rf.voted_for,
            last_snapshot_index: rf.log.last_snapshot_index(),
            last_snapshot_term: rf.log.last_snapshot_term(),
            entries: rf.log.entries().to_vec(),
        };
        let data = match state.encode() {
            Ok(data) => data,
            Err(e) => panic!("cannot encode raft state: {}", e),
        };
        if let Err(e) = self.persister.save(&data, &rf.snapshot) {
            log::error!("node {} failed to persist raft state: {}", self.me, e);
            panic!("raft state persistence failed: {}", e);
        }
    }
}

fn random_election_timeout() -> Duration {
    let ms = rand::thread_rng().gen_range(ELECTION_TIMEOUT_MIN_MS..=ELECTION_TIMEOUT_MAX_MS);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::RaftError;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::path::Path;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    /// In-memory cluster fabric: delivers a call by invoking the target
    /// node's handler directly, unless either end is marked down.
    struct Router {
        nodes: Mutex<HashMap<u64, Arc<RaftCore>>>,
        down: Mutex<HashSet<u64>>,
    }

    impl Router {
        fn new() -> Arc<Self> {
            Arc::new(Router {
                nodes: Mutex::new(HashMap::new()),
                down: Mutex::new(HashSet::new()),
            })
        }

        fn register(&self, id: u64, node: Arc<RaftCore>) {
            self.nodes.lock().unwrap().insert(id, node);
        }

        fn disconnect(&self, id: u64) {
            self.down.lock().unwrap().insert(id);
        }

        fn reconnect(&self, id: u64) {
            self.down.lock().unwrap().remove(&id);
        }

        fn is_down(&self, id: u64) -> bool {
            self.down.lock().unwrap().contains(&id)
        }

        fn route(&self, from: u64, to: u64) -> RaftResult<Arc<RaftCore>> {
            if self.is_down(from) || self.is_down(to) {
                return Err(RaftError::Transport(format!("{} -> {} unreachable", from, to)));
            }
            self.nodes
                .lock()
                .unwrap()
                .get(&to)
                .cloned()
                .ok_or_else(|| RaftError::Transport(format!("unknown peer {}", to)))
        }
    }

    struct RouterTransport {
        from: u64,
        router: Arc<Router>,
    }

    #[async_trait]
    impl RaftTransport for RouterTransport {
        async fn request_vote(
            &self,
            peer: u64,
            args: RequestVoteArgs,
        ) -> RaftResult<RequestVoteReply> {
            Ok(self.router.route(self.from, peer)?.handle_request_vote(&args))
        }

        async fn append_entries(
            &self,
            peer: u64,
            args: AppendEntriesArgs,
        ) -> RaftResult<AppendEntriesReply> {
            Ok(self
                .router
                .route(self.from, peer)?
                .handle_append_entries(&args))
        }

        async fn install_snapshot(
            &self,
            peer: u64,
            args: InstallSnapshotArgs,
        ) -> RaftResult<InstallSnapshotReply> {
            Ok(self
                .router
                .route(self.from, peer)?
                .handle_install_snapshot(&args))
        }
    }

    fn entry(index: u64, term: u64, command: &[u8]) -> LogEntry {
        LogEntry {
            index,
            term,
            command: command.to_vec(),
        }
    }

    /// A core with no running tickers, for handler-level tests.
    fn standalone(
        me: u64,
        peers: Vec<u64>,
        dir: &Path,
    ) -> (Arc<RaftCore>, UnboundedReceiver<ApplyMsg>) {
        let router = Router::new();
        let transport = Arc::new(RouterTransport { from: me, router });
        let persister = Arc::new(Persister::new(dir, me).unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        let core = RaftCore::new(me, peers, transport, persister, tx).unwrap();
        (core, rx)
    }

    fn launch_cluster(
        n: u64,
        dir: &Path,
    ) -> (Arc<Router>, Vec<Arc<RaftCore>>, Vec<UnboundedReceiver<ApplyMsg>>) {
        let router = Router::new();
        let mut nodes = Vec::new();
        let mut rxs = Vec::new();
        for id in 1..=n {
            let peers: Vec<u64> = (1..=n).filter(|&p| p != id).collect();
            let transport = Arc::new(RouterTransport {
                from: id,
                router: Arc::clone(&router),
            });
            let persister =
                Arc::new(Persister::new(dir.join(format!("node-{}", id)), id).unwrap());
            let (tx, rx) = mpsc::unbounded_channel();
            let core = RaftCore::new(id, peers, transport, persister, tx).unwrap();
            router.register(id, Arc::clone(&core));
            core.run();
            nodes.push(core);
            rxs.push(rx);
        }
        (router, nodes, rxs)
    }

    async fn wait_for_leader(nodes: &[Arc<RaftCore>], router: &Arc<Router>) -> usize {
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let leaders: Vec<usize> = nodes
                .iter()
                .enumerate()
                .filter(|(_, node)| !router.is_down(node.me))
                .filter(|(_, node)| node.get_state().1)
                .map(|(i, _)| i)
                .collect();
            if leaders.len() == 1 {
                return leaders[0];
            }
        }
        panic!("no leader elected within timeout");
    }

    fn drain_commands(rx: &mut UnboundedReceiver<ApplyMsg>, out: &mut Vec<(u64, Vec<u8>)>) {
        while let Ok(msg) = rx.try_recv() {
            if let ApplyMsg::Command { index, command } = msg {
                out.push((index, command));
            }
        }
    }

    fn observe_leaders(nodes: &[Arc<RaftCore>], seen: &mut HashMap<u64, HashSet<u64>>) {
        for node in nodes {
            let (term, is_leader) = node.get_state();
            if is_leader {
                seen.entry(term).or_default().insert(node.me);
            }
        }
    }

    #[test]
    fn test_starts_as_follower_at_term_zero() {
        let dir = tempfile::tempdir().unwrap();
        let (core, _rx) = standalone(1, vec![2, 3], dir.path());
        assert_eq!(core.get_state(), (0, false));
        assert!(core.start(b"nope".to_vec()).is_none());
    }

    #[tokio::test]
    async fn test_single_node_election_promotes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let (core, _rx) = standalone(1, Vec::new(), dir.path());
        core.start_election();
        assert_eq!(core.get_state(), (1, true));
        assert_eq!(core.start(b"hello".to_vec()), Some((1, 1)));
    }

    #[test]
    fn test_vote_granting_rules() {
        let dir = tempfile::tempdir().unwrap();
        let (core, _rx) = standalone(1, vec![2, 3], dir.path());
        {
            let mut rf = core.inner.lock().unwrap();
            rf.current_term = 2;
            rf.log.append(entry(1, 1, b"a"));
            rf.log.append(entry(2, 2, b"b"));
        }

        // Stale candidate term.
        let reply = core.handle_request_vote(&RequestVoteArgs {
            term: 1,
            candidate_id: 2,
            last_log_index: 9,
            last_log_term: 9,
        });
        assert!(!reply.vote_granted);
        assert_eq!(reply.term, 2);

        // Same last term, shorter log: not up to date.
        let reply = core.handle_request_vote(&RequestVoteArgs {
            term: 3,
            candidate_id: 2,
            last_log_index: 1,
            last_log_term: 2,
        });
        assert!(!reply.vote_granted);
        assert_eq!(reply.term, 3);

        // An up-to-date candidate gets the vote for term 3.
        let reply = core.handle_request_vote(&RequestVoteArgs {
            term: 3,
            candidate_id: 3,
            last_log_index: 2,
            last_log_term: 2,
        });
        assert!(reply.vote_granted);

        // The vote is spent for this term, whatever the log looks like.
        let reply = core.handle_request_vote(&RequestVoteArgs {
            term: 3,
            candidate_id: 2,
            last_log_index: 9,
            last_log_term: 9,
        });
        assert!(!reply.vote_granted);

        // A higher last-log term wins regardless of index.
        let reply = core.handle_request_vote(&RequestVoteArgs {
            term: 4,
            candidate_id: 2,
            last_log_index: 1,
            last_log_term: 3,
        });
        assert!(reply.vote_granted);
    }

    #[test]
    fn test_append_entries_rejects_stale_term() {
        let dir = tempfile::tempdir().unwrap();
        let (core, _rx) = standalone(1, vec![2], dir.path());
        {
            let mut rf = core.inner.lock().unwrap();
            rf.current_term = 5;
        }
        let reply = core.handle_append_entries(&AppendEntriesArgs {
            term: 3,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![entry(1, 3, b"x")],
            leader_commit: 1,
        });
        assert!(!reply.success);
        assert_eq!(reply.term, 5);
        let rf = core.inner.lock().unwrap();
        assert_eq!(rf.log.last_index(), 0);
        assert_eq!(rf.commit_index, 0);
    }

    #[test]
    fn test_append_entries_past_end_hints_last_index() {
        let dir = tempfile::tempdir().unwrap();
        let (core, _rx) = standalone(1, vec![2], dir.path());
        let reply = core.handle_append_entries(&AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 5,
            prev_log_term: 1,
            entries: Vec::new(),
            leader_commit: 0,
        });
        assert!(!reply.success);
        assert_eq!(reply.update_next_index, 1);
    }

    #[test]
    fn test_append_entries_below_snapshot_boundary_hints_boundary() {
        // Scenario: prev_log_index 3 while the snapshot already covers 5.
        let dir = tempfile::tempdir().unwrap();
        let (core, _rx) = standalone(1, vec![2], dir.path());
        {
            let mut rf = core.inner.lock().unwrap();
            rf.current_term = 1;
            rf.log.compact_to(5, 1);
            rf.commit_index = 5;
            rf.last_applied = 5;
        }
        let reply = core.handle_append_entries(&AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 3,
            prev_log_term: 1,
            entries: Vec::new(),
            leader_commit: 5,
        });
        assert!(!reply.success);
        assert_eq!(reply.update_next_index, 6);
    }

    #[test]
    fn test_append_entries_conflict_hint_then_catch_up() {
        // Scenario: the peer's log diverges at index 4; the reply hints
        // update_next_index = 4 and the resend from 4 is accepted.
        let dir = tempfile::tempdir().unwrap();
        let (core, _rx) = standalone(1, vec![9], dir.path());
        {
            let mut rf = core.inner.lock().unwrap();
            rf.current_term = 2;
            rf.log.append(entry(1, 1, b"a"));
            rf.log.append(entry(2, 1, b"b"));
            rf.log.append(entry(3, 1, b"c"));
            rf.log.append(entry(4, 2, b"stale"));
        }

        let reply = core.handle_append_entries(&AppendEntriesArgs {
            term: 3,
            leader_id: 9,
            prev_log_index: 4,
            prev_log_term: 3,
            entries: Vec::new(),
            leader_commit: 0,
        });
        assert!(!reply.success);
        assert_eq!(reply.update_next_index, 4);

        let reply = core.handle_append_entries(&AppendEntriesArgs {
            term: 3,
            leader_id: 9,
            prev_log_index: 3,
            prev_log_term: 1,
            entries: vec![entry(4, 3, b"new4"), entry(5, 3, b"new5")],
            leader_commit: 4,
        });
        assert!(reply.success);

        let rf = core.inner.lock().unwrap();
        assert_eq!(rf.log.last_index(), 5);
        assert_eq!(rf.log.entry(4).command, b"new4");
        assert_eq!(rf.log.entry(4).term, 3);
        assert_eq!(rf.commit_index, 4);
    }

    #[test]
    #[should_panic(expected = "divergent commands")]
    fn test_append_entries_divergent_command_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let (core, _rx) = standalone(1, vec![2], dir.path());
        {
            let mut rf = core.inner.lock().unwrap();
            rf.current_term = 1;
            rf.log.append(entry(1, 1, b"mine"));
        }
        core.handle_append_entries(&AppendEntriesArgs {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![entry(1, 1, b"theirs")],
            leader_commit: 0,
        });
    }

    #[test]
    fn test_commit_advances_only_over_current_term_entries() {
        // Scenario: match_index [10, 7, 10] on a 3-node cluster.
        let dir = tempfile::tempdir().unwrap();

        let (core, _rx) = standalone(1, vec![2, 3], dir.path());
        {
            let mut rf = core.inner.lock().unwrap();
            for i in 1..=9 {
                rf.log.append(entry(i, 1, b"old"));
            }
            rf.log.append(entry(10, 2, b"fresh"));
            rf.current_term = 2;
            rf.role = Role::Leader;
            rf.match_index.insert(2, 7);
            rf.match_index.insert(3, 10);
            core.advance_commit_index(&mut rf);
            assert_eq!(rf.commit_index, 10);
        }

        // Same replication picture, but no entry of the leader's term is
        // on a majority: nothing may commit.
        let (core, _rx) = standalone(4, vec![2, 3], dir.path());
        {
            let mut rf = core.inner.lock().unwrap();
            for i in 1..=9 {
                rf.log.append(entry(i, 1, b"old"));
            }
            rf.log.append(entry(10, 2, b"stale"));
            rf.current_term = 3;
            rf.role = Role::Leader;
            rf.match_index.insert(2, 7);
            rf.match_index.insert(3, 10);
            core.advance_commit_index(&mut rf);
            assert_eq!(rf.commit_index, 0);
        }
    }

    #[test]
    fn test_install_snapshot_installs_and_rejects_stale() {
        let dir = tempfile::tempdir().unwrap();
        let (core, mut rx) = standalone(1, vec![2], dir.path());
        {
            let mut rf = core.inner.lock().unwrap();
            rf.current_term = 1;
            for i in 1..=12 {
                rf.log.append(entry(i, 1, b"cmd"));
            }
            rf.commit_index = 5;
            rf.last_applied = 5;
        }

        let reply = core.handle_install_snapshot(&InstallSnapshotArgs {
            term: 1,
            leader_id: 2,
            last_included_index: 10,
            last_included_term: 1,
            data: b"snap@10".to_vec(),
        });
        assert_eq!(reply.term, 1);
        {
            let rf = core.inner.lock().unwrap();
            assert_eq!(rf.log.last_snapshot_index(), 10);
            assert_eq!(rf.log.last_index(), 12);
            assert_eq!(rf.commit_index, 10);
            assert_eq!(rf.last_applied, 10);
            assert_eq!(rf.snapshot, b"snap@10");
        }
        match rx.try_recv().unwrap() {
            ApplyMsg::Snapshot { index, term, data } => {
                assert_eq!(index, 10);
                assert_eq!(term, 1);
                assert_eq!(data, b"snap@10");
            }
            other => panic!("expected snapshot delivery, got {:?}", other),
        }
        assert!(core.cond_install_snapshot(1, 10));

        // A snapshot not newer than the boundary changes nothing.
        core.handle_install_snapshot(&InstallSnapshotArgs {
            term: 1,
            leader_id: 2,
            last_included_index: 5,
            last_included_term: 1,
            data: b"old".to_vec(),
        });
        {
            let rf = core.inner.lock().unwrap();
            assert_eq!(rf.log.last_snapshot_index(), 10);
            assert_eq!(rf.snapshot, b"snap@10");
        }
        assert!(rx.try_recv().is_err());
        assert!(!core.cond_install_snapshot(1, 5));
    }

    #[test]
    fn test_snapshot_restart_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (core, _rx) = standalone(1, vec![2], dir.path());
            {
                let mut rf = core.inner.lock().unwrap();
                rf.current_term = 1;
                for i in 1..=5 {
                    rf.log.append(entry(i, 1, b"cmd"));
                }
                rf.commit_index = 5;
                rf.last_applied = 5;
            }
            // Not yet applied / already covered indices are rejected.
            core.snapshot(6, b"early".to_vec());
            core.snapshot(3, b"snap@3".to_vec());
            core.snapshot(3, b"again".to_vec());

            let rf = core.inner.lock().unwrap();
            assert_eq!(rf.log.last_snapshot_index(), 3);
            assert_eq!(rf.snapshot, b"snap@3");
        }

        let (core, _rx) = standalone(1, vec![2], dir.path());
        let rf = core.inner.lock().unwrap();
        assert_eq!(rf.log.last_snapshot_index(), 3);
        assert_eq!(rf.log.last_snapshot_term(), 1);
        assert_eq!(rf.log.last_index(), 5);
        assert_eq!(rf.log.entry(4).index, 4);
        assert_eq!(rf.commit_index, 3);
        assert_eq!(rf.last_applied, 3);
        assert_eq!(rf.snapshot, b"snap@3");
    }

    #[test]
    fn test_restart_preserves_term_and_vote() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (core, _rx) = standalone(1, vec![2], dir.path());
            let reply = core.handle_request_vote(&RequestVoteArgs {
                term: 5,
                candidate_id: 2,
                last_log_index: 0,
                last_log_term: 0,
            });
            assert!(reply.vote_granted);
        }
        let (core, _rx) = standalone(1, vec![2], dir.path());
        let rf = core.inner.lock().unwrap();
        assert_eq!(rf.current_term, 5);
        assert_eq!(rf.voted_for, Some(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cluster_elects_single_leader() {
        let dir = tempfile::tempdir().unwrap();
        let (router, nodes, _rxs) = launch_cluster(3, dir.path());

        let leader = wait_for_leader(&nodes, &router).await;
        let (leader_term, is_leader) = nodes[leader].get_state();
        assert!(is_leader);
        assert!(leader_term >= 1);

        // No other node may claim the same term.
        for (i, node) in nodes.iter().enumerate() {
            if i != leader {
                let (_, is_leader) = node.get_state();
                assert!(!is_leader);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cluster_replicates_and_applies_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (router, nodes, mut rxs) = launch_cluster(3, dir.path());

        let leader = wait_for_leader(&nodes, &router).await;
        for i in 0..5u32 {
            let command = format!("cmd-{}", i).into_bytes();
            assert!(nodes[leader].start(command).is_some());
        }

        let mut applied: Vec<Vec<(u64, Vec<u8>)>> = vec![Vec::new(); nodes.len()];
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            for (i, rx) in rxs.iter_mut().enumerate() {
                drain_commands(rx, &mut applied[i]);
            }
            if applied.iter().all(|seq| seq.len() >= 5) {
                break;
            }
        }

        for seq in &applied {
            assert_eq!(seq.len(), 5, "every node applies all five commands");
            for (offset, (index, command)) in seq.iter().enumerate() {
                assert_eq!(*index, offset as u64 + 1);
                assert_eq!(command, &format!("cmd-{}", offset).into_bytes());
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cluster_reelects_and_discards_uncommitted_entries() {
        let dir = tempfile::tempdir().unwrap();
        let (router, nodes, mut rxs) = launch_cluster(3, dir.path());
        let mut leaders_by_term: HashMap<u64, HashSet<u64>> = HashMap::new();

        let first = wait_for_leader(&nodes, &router).await;
        let (first_term, _) = nodes[first].get_state();
        nodes[first].start(b"a".to_vec()).unwrap();

        let mut applied: Vec<Vec<(u64, Vec<u8>)>> = vec![Vec::new(); nodes.len()];
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            observe_leaders(&nodes, &mut leaders_by_term);
            for (i, rx) in rxs.iter_mut().enumerate() {
                drain_commands(rx, &mut applied[i]);
            }
            if applied.iter().all(|seq| seq.len() >= 1) {
                break;
            }
        }
        assert!(applied.iter().all(|seq| seq.len() == 1));

        // Partition the leader away; a proposal it takes now can never
        // commit and must be discarded once a new leader owns the slot.
        router.disconnect(nodes[first].me);
        nodes[first].start(b"lost".to_vec()).unwrap();

        let second = wait_for_leader(&nodes, &router).await;
        assert_ne!(second, first);
        let (second_term, _) = nodes[second].get_state();
        assert!(second_term > first_term);
        nodes[second].start(b"b".to_vec()).unwrap();

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            observe_leaders(&nodes, &mut leaders_by_term);
            let done = applied
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != first)
                .all(|(_, seq)| seq.len() >= 2);
            if done {
                break;
            }
            for (i, rx) in rxs.iter_mut().enumerate() {
                drain_commands(rx, &mut applied[i]);
            }
        }

        router.reconnect(nodes[first].me);
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            observe_leaders(&nodes, &mut leaders_by_term);
            drain_commands(&mut rxs[first], &mut applied[first]);
            if applied[first].len() >= 2 {
                break;
            }
        }

        // The old leader rejoined as a follower of the newer term.
        let (rejoined_term, rejoined_is_leader) = nodes[first].get_state();
        assert!(!rejoined_is_leader);
        assert!(rejoined_term >= second_term);

        // Every node applied the same sequence; the unreplicated entry
        // from the deposed leader is gone.
        let expected = vec![(1u64, b"a".to_vec()), (2u64, b"b".to_vec())];
        for seq in &applied {
            assert_eq!(seq, &expected);
        }

        // Election safety: never two leaders within one term.
        for (term, ids) in &leaders_by_term {
            assert!(ids.len() <= 1, "term {} had multiple leaders: {:?}", term, ids);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cluster_lagging_follower_catches_up_via_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (router, nodes, mut rxs) = launch_cluster(3, dir.path());

        let leader = wait_for_leader(&nodes, &router).await;
        for i in 0..5u32 {
            nodes[leader].start(format!("early-{}", i).into_bytes()).unwrap();
        }
        let mut applied: Vec<Vec<(u64, Vec<u8>)>> = vec![Vec::new(); nodes.len()];
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            for (i, rx) in rxs.iter_mut().enumerate() {
                drain_commands(rx, &mut applied[i]);
            }
            if applied.iter().all(|seq| seq.len() >= 5) {
                break;
            }
        }

        let lagging = (0..nodes.len()).find(|&i| i != leader).unwrap();
        router.disconnect(nodes[lagging].me);

        for i in 5..10u32 {
            nodes[leader].start(format!("late-{}", i).into_bytes()).unwrap();
        }
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            drain_commands(&mut rxs[leader], &mut applied[leader]);
            if applied[leader].len() >= 10 {
                break;
            }
        }
        assert!(applied[leader].len() >= 10);

        // Wait until the other connected follower has applied through 10
        // as well, then compact both remaining nodes. Whichever of them
        // leads after the partition heals has to ship a snapshot.
        let third = (0..nodes.len())
            .find(|&i| i != leader && i != lagging)
            .unwrap();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if nodes[third].inner.lock().unwrap().last_applied >= 10 {
                break;
            }
        }
        nodes[leader].snapshot(10, b"state@10".to_vec());
        nodes[third].snapshot(10, b"state@10".to_vec());
        {
            let rf = nodes[leader].inner.lock().unwrap();
            assert_eq!(rf.log.last_snapshot_index(), 10);
        }

        router.reconnect(nodes[lagging].me);
        let mut installed = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            while let Ok(msg) = rxs[lagging].try_recv() {
                if let ApplyMsg::Snapshot { index, data, .. } = msg {
                    assert_eq!(index, 10);
                    assert_eq!(data, b"state@10");
                    installed = true;
                }
            }
            if installed {
                break;
            }
        }
        assert!(installed, "lagging follower never received the snapshot");

        let rf = nodes[lagging].inner.lock().unwrap();
        assert_eq!(rf.log.last_snapshot_index(), 10);
        assert!(rf.last_applied >= 10);
    }
}
