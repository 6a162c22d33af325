//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: uses message.rs for rpc types, log.rs for entry management,
//!            driven by raft-runtime which owns the timers and the network
//! what: NodeState enum, RaftNode with election, replication, commit,
//!       snapshot and apply logic; no i/o, no clocks

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{ApplyMsg, HardState, Log, LogEntry, PersistentState, RaftConfig, RaftError, RaftMessage, Snapshot};

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

/// A single Raft node in the cluster
#[derive(Debug)]
pub struct RaftNode {
    /// Unique identifier for this node
    pub id: u64,
    /// Every voting member, including this node
    pub cluster_nodes: Vec<u64>,
    pub config: RaftConfig,
    /// Current state (Follower, Candidate, or Leader)
    pub state: NodeState,
    /// Current term number
    pub current_term: u64,
    /// Node ID that received our vote in current term (if any)
    pub voted_for: Option<u64>,
    pub log: Log,
    /// Latest snapshot, covering the log up to its watermark
    pub snapshot: Option<Snapshot>,
    /// Highest index known to be committed
    pub commit_index: u64,
    /// Highest index handed to the application
    pub last_applied: u64,
    pub current_leader: Option<u64>,
    /// Voters that granted this candidacy, self included
    pub votes_received: Vec<u64>,
    /// Leader only: next index to send to each peer
    pub next_index: HashMap<u64, u64>,
    /// Leader only: highest index known replicated on each peer
    pub match_index: HashMap<u64, u64>,
    /// Application logical clock, stamped into new entries
    pub timestep: u64,
    persist_requested: bool,
    snapshot_requested: bool,
}

impl RaftNode {
    /// Create a new Raft node in Follower state
    pub fn new(id: u64, cluster_nodes: Vec<u64>) -> Self {
        Self::with_config(id, cluster_nodes, RaftConfig::default())
    }

    pub fn with_config(id: u64, cluster_nodes: Vec<u64>, config: RaftConfig) -> Self {
        Self {
            id,
            cluster_nodes,
            config,
            state: NodeState::Follower,
            current_term: 0,
            voted_for: None,
            log: Log::new(),
            snapshot: None,
            commit_index: 0,
            last_applied: 0,
            current_leader: None,
            votes_received: Vec::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            timestep: 0,
            persist_requested: false,
            snapshot_requested: false,
        }
    }

    /// Rebuild a node from what was persisted before a crash.
    ///
    /// Everything up to the snapshot watermark counts as committed; the
    /// apply cursor starts at zero so the snapshot is replayed first. The
    /// term is never behind the log: a crash between the log write and the
    /// term write leaves entries from a term the node has not recorded.
    pub fn restore(id: u64, cluster_nodes: Vec<u64>, config: RaftConfig, persisted: PersistentState) -> Self {
        let mut node = Self::with_config(id, cluster_nodes, config);
        node.current_term = persisted.hard_state.current_term;
        node.voted_for = persisted.hard_state.voted_for;
        node.log = persisted.log;
        node.snapshot = persisted.snapshot;
        node.commit_index = node.log.last_included_index();

        let log_term = node.log.last_term();
        if log_term > node.current_term {
            node.current_term = log_term;
            node.voted_for = None;
            node.request_persist();
        }
        node
    }

    // -- quorum --

    /// Strict majority of the whole cluster
    pub fn quorum_size(&self) -> usize {
        self.cluster_nodes.len() / 2 + 1
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    fn peers(&self) -> impl Iterator<Item = u64> + '_ {
        self.cluster_nodes.iter().copied().filter(move |n| *n != self.id)
    }

    // -- persistence bookkeeping --

    pub fn hard_state(&self) -> HardState {
        HardState {
            current_term: self.current_term,
            voted_for: self.voted_for,
        }
    }

    /// True once after any change to term, vote or log
    pub fn take_persist_request(&mut self) -> bool {
        std::mem::take(&mut self.persist_requested)
    }

    /// True once after a new snapshot was taken or installed
    pub fn take_snapshot_request(&mut self) -> bool {
        std::mem::take(&mut self.snapshot_requested)
    }

    fn request_persist(&mut self) {
        self.persist_requested = true;
    }

    // -- state transitions --

    /// Step down, adopting `term` if it is newer
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.current_leader = None;
        }
        self.state = NodeState::Follower;
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
        self.request_persist();
    }

    /// Take over replication for the current term
    pub fn become_leader(&mut self) {
        self.state = NodeState::Leader;
        self.current_leader = Some(self.id);
        self.votes_received.clear();

        let next = self.log.last_index() + 1;
        let peers: Vec<u64> = self.peers().collect();
        self.next_index = peers.iter().map(|p| (*p, next)).collect();
        self.match_index = peers.iter().map(|p| (*p, 0)).collect();
    }

    // -- election --

    /// Begin a new candidacy and build the vote request to broadcast
    pub fn start_election(&mut self) -> RaftMessage {
        self.current_term += 1;
        self.state = NodeState::Candidate;
        self.voted_for = Some(self.id);
        self.current_leader = None;
        self.votes_received = vec![self.id];
        self.request_persist();

        RaftMessage::RequestVote {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        }
    }

    /// Decide on a vote request; the flag says whether to reset the election timer
    pub fn handle_vote_request(
        &mut self,
        term: u64,
        candidate_id: u64,
        last_log_index: u64,
        last_log_term: u64,
    ) -> (RaftMessage, bool) {
        if term > self.current_term {
            self.become_follower(term);
        }

        let granted = term == self.current_term
            && self.voted_for.map_or(true, |v| v == candidate_id)
            && self.candidate_log_is_current(last_log_index, last_log_term);

        if granted {
            self.voted_for = Some(candidate_id);
            self.request_persist();
        }

        let reply = RaftMessage::RequestVoteReply {
            term: self.current_term,
            vote_granted: granted,
            voter_id: self.id,
        };
        (reply, granted)
    }

    /// Compare (last term, last index) lexicographically
    fn candidate_log_is_current(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_term = self.log.last_term();
        last_log_term > our_term || (last_log_term == our_term && last_log_index >= self.log.last_index())
    }

    /// Count a vote reply; returns true when it made this node leader
    pub fn handle_vote_response(&mut self, term: u64, vote_granted: bool, from: u64) -> bool {
        if term > self.current_term {
            self.become_follower(term);
            return false;
        }

        if self.state != NodeState::Candidate || term != self.current_term || !vote_granted {
            return false;
        }

        if !self.votes_received.contains(&from) {
            self.votes_received.push(from);
        }

        if self.has_quorum() {
            self.become_leader();
            return true;
        }
        false
    }

    // -- proposals --

    /// Leader-side append of a new command at the end of the log
    pub fn append_entry(&mut self, command: Vec<u8>) -> LogEntry {
        let entry = LogEntry::with_timestep(self.current_term, self.log.last_index() + 1, command, self.timestep);
        self.log.append(entry.clone());
        self.request_persist();
        entry
    }

    /// Accept a command if this node leads, otherwise point at the leader
    pub fn propose(&mut self, command: Vec<u8>) -> Result<LogEntry, RaftError> {
        self.check_payload(command.len())?;
        if !self.is_leader() {
            return Err(RaftError::NotLeader { leader: self.current_leader });
        }
        Ok(self.append_entry(command))
    }

    /// Reject payloads that no AppendEntries or InstallSnapshot could carry
    pub fn check_payload(&self, size: usize) -> Result<(), RaftError> {
        let limit = self.config.max_payload_len();
        if size > limit {
            return Err(RaftError::TooLarge { size, limit });
        }
        Ok(())
    }

    // -- replication (leader side) --

    /// Build the next replication message for `peer`.
    ///
    /// Returns InstallSnapshot when the entries the peer needs were
    /// compacted away, AppendEntries (possibly empty) otherwise. A batch
    /// stops at `max_entries_per_append` entries or `max_append_bytes`
    /// encoded bytes, but always carries at least one entry.
    pub fn create_append_entries(&self, peer: u64) -> Option<RaftMessage> {
        if !self.is_leader() {
            return None;
        }

        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(self.log.last_index() + 1)
            .max(1);
        let prev_log_index = next - 1;

        if prev_log_index < self.log.last_included_index() {
            return Some(RaftMessage::InstallSnapshot {
                term: self.current_term,
                leader_id: self.id,
                last_included_index: self.log.last_included_index(),
                last_included_term: self.log.last_included_term(),
                data: self.snapshot.as_ref().map(|s| s.data.clone()).unwrap_or_default(),
            });
        }

        let mut budget = self.config.max_append_bytes;
        let entries: Vec<LogEntry> = self
            .log
            .get_from(next)
            .into_iter()
            .take(self.config.max_entries_per_append)
            .enumerate()
            .take_while(|(taken, entry)| {
                let len = entry.encoded_len();
                let fits = *taken == 0 || len <= budget;
                budget = budget.saturating_sub(len);
                fits
            })
            .map(|(_, entry)| entry)
            .collect();

        Some(RaftMessage::AppendEntries {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.log.term_at(prev_log_index).unwrap_or(0),
            entries,
            leader_commit: self.commit_index,
            timestep: self.timestep,
        })
    }

    /// Fold an AppendEntries reply into the replication cursors.
    ///
    /// `match_hint` is `prev_log_index + entries.len()` of the request that
    /// was answered. Returns true if the commit index moved.
    pub fn handle_append_entries_response(
        &mut self,
        from: u64,
        request_term: u64,
        reply_term: u64,
        success: bool,
        conflict_index: u64,
        match_hint: u64,
    ) -> bool {
        if reply_term > self.current_term {
            self.become_follower(reply_term);
            return false;
        }
        if !self.is_leader() || request_term != self.current_term {
            return false;
        }

        if success {
            let matched = self.match_index.entry(from).or_insert(0);
            *matched = (*matched).max(match_hint);
            let next = *matched + 1;
            self.next_index.insert(from, next);
            self.advance_commit_index()
        } else {
            let next = conflict_index.clamp(1, self.log.last_index() + 1);
            self.next_index.insert(from, next);
            false
        }
    }

    /// Move the replication cursors past an installed snapshot.
    ///
    /// A snapshot never reaches past the leader's own commit index, so the
    /// reply cannot commit anything new.
    pub fn handle_install_snapshot_response(
        &mut self,
        from: u64,
        request_term: u64,
        reply_term: u64,
        last_included_index: u64,
    ) {
        if reply_term > self.current_term {
            self.become_follower(reply_term);
            return;
        }
        if !self.is_leader() || request_term != self.current_term {
            return;
        }

        let matched = self.match_index.entry(from).or_insert(0);
        *matched = (*matched).max(last_included_index);
        let next = *matched + 1;
        self.next_index.insert(from, next);
    }

    /// Commit the highest current-term index replicated on a majority.
    ///
    /// Entries from earlier terms only become committed through a later
    /// current-term entry.
    pub fn advance_commit_index(&mut self) -> bool {
        if !self.is_leader() {
            return false;
        }

        let quorum = self.quorum_size();
        let mut index = self.log.last_index();

        while index > self.commit_index {
            // the leader always holds its own entries
            let replicas = 1 + self.match_index.values().filter(|m| **m >= index).count();
            if replicas >= quorum && self.log.term_at(index) == Some(self.current_term) {
                self.commit_index = index;
                return true;
            }
            index -= 1;
        }
        false
    }

    // -- replication (follower side) --

    /// Consistency-check and store entries from a leader.
    ///
    /// The flag says whether the sender is a legitimate leader and the
    /// election timer should be reset.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_append_entries(
        &mut self,
        term: u64,
        leader_id: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
        timestep: u64,
    ) -> (RaftMessage, bool) {
        if term < self.current_term {
            return (self.append_reply(false, self.log.last_index() + 1), false);
        }
        if term > self.current_term || self.state == NodeState::Candidate {
            self.become_follower(term);
        }
        self.current_leader = Some(leader_id);

        let watermark = self.log.last_included_index();
        // entries at or below the watermark are committed and already covered by the snapshot
        let (prev_log_index, prev_log_term, entries) = if prev_log_index < watermark {
            let skipped: Vec<LogEntry> = entries.into_iter().filter(|e| e.index > watermark).collect();
            (watermark, self.log.last_included_term(), skipped)
        } else {
            (prev_log_index, prev_log_term, entries)
        };

        match self.log.term_at(prev_log_index) {
            None => {
                return (self.append_reply(false, self.log.last_index() + 1), true);
            }
            Some(local_term) if local_term != prev_log_term => {
                let conflict_index = self.log.first_index_of_term(local_term).unwrap_or(prev_log_index);
                return (self.append_reply(false, conflict_index), true);
            }
            Some(_) => {}
        }

        let verified_through = prev_log_index + entries.len() as u64;
        let mut changed = false;
        for entry in entries {
            match self.log.get(entry.index).map(|existing| existing.term) {
                Some(existing_term) if existing_term == entry.term => {}
                Some(_) => {
                    self.log.truncate_from(entry.index);
                    self.log.append(entry);
                    changed = true;
                }
                None => {
                    self.log.append(entry);
                    changed = true;
                }
            }
        }
        if changed {
            self.request_persist();
        }

        self.timestep = self.timestep.max(timestep);

        if leader_commit > self.commit_index {
            self.commit_index = self.commit_index.max(leader_commit.min(verified_through));
        }

        (self.append_reply(true, self.log.last_index() + 1), true)
    }

    fn append_reply(&self, success: bool, conflict_index: u64) -> RaftMessage {
        RaftMessage::AppendEntriesReply {
            term: self.current_term,
            success,
            conflict_index,
        }
    }

    /// Adopt a leader's snapshot, keeping any suffix that already follows it
    pub fn handle_install_snapshot(
        &mut self,
        term: u64,
        leader_id: u64,
        last_included_index: u64,
        last_included_term: u64,
        data: Vec<u8>,
    ) -> (RaftMessage, bool) {
        if term < self.current_term {
            return (RaftMessage::InstallSnapshotReply { term: self.current_term }, false);
        }
        if term > self.current_term || self.state == NodeState::Candidate {
            self.become_follower(term);
        }
        self.current_leader = Some(leader_id);

        if last_included_index <= self.log.last_included_index() {
            return (RaftMessage::InstallSnapshotReply { term: self.current_term }, true);
        }

        let has_matching_suffix = last_included_index < self.log.last_index()
            && self.log.term_at(last_included_index) == Some(last_included_term);

        if has_matching_suffix {
            self.log.truncate_before(last_included_index + 1);
            self.log.set_watermark(last_included_index, last_included_term);
        } else {
            self.log.reset_to_snapshot(last_included_index, last_included_term);
        }

        self.snapshot = Some(Snapshot {
            last_included_index,
            last_included_term,
            data,
        });
        self.commit_index = self.commit_index.max(last_included_index);
        self.snapshot_requested = true;
        self.request_persist();

        (RaftMessage::InstallSnapshotReply { term: self.current_term }, true)
    }

    // -- compaction and application --

    /// Replace the log prefix through `index` with an application snapshot
    pub fn compact(&mut self, index: u64, data: Vec<u8>) -> Result<(), RaftError> {
        self.check_payload(data.len())?;
        let first = self.log.last_included_index();
        if index <= first {
            return Ok(());
        }

        let out_of_range = RaftError::CompactionOutOfRange {
            index,
            first,
            last: self.commit_index,
        };
        if index > self.commit_index {
            return Err(out_of_range);
        }
        let term = self.log.get(index).map(|e| e.term).ok_or(out_of_range)?;

        self.log.truncate_before(index + 1);
        self.log.set_watermark(index, term);
        self.snapshot = Some(Snapshot {
            last_included_index: index,
            last_included_term: term,
            data,
        });
        self.snapshot_requested = true;
        self.request_persist();
        Ok(())
    }

    /// Next committed message for the application, advancing `last_applied`
    pub fn next_apply(&mut self) -> Option<ApplyMsg> {
        let index = self.last_applied + 1;
        if index > self.commit_index {
            return None;
        }

        let watermark = self.log.last_included_index();
        if index <= watermark {
            self.last_applied = watermark;
            return Some(ApplyMsg::Snapshot {
                data: self.snapshot.as_ref().map(|s| s.data.clone()).unwrap_or_default(),
                index: watermark,
                term: self.log.last_included_term(),
            });
        }

        let entry = match self.log.get(index) {
            Some(entry) => entry.clone(),
            None => panic!(
                "committed entry {} missing (commit_index={}, last_index={}, watermark={})",
                index,
                self.commit_index,
                self.log.last_index(),
                watermark
            ),
        };

        self.last_applied = index;
        Some(ApplyMsg::Command {
            command: entry.command,
            index,
            timestep: entry.timestep,
        })
    }
}
