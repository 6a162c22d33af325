//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: owned by node.rs behind the engine lock, persisted via raft-storage
//! what: LogEntry struct, Log with snapshot watermark, truncation and compaction

use serde::{Deserialize, Serialize};

use crate::error::RaftError;

/// Wire size of an entry's fields and keys, excluding the command bytes
pub const ENTRY_OVERHEAD: usize = 128;

/// A byte is written as up to three digits and a separator
pub const ENCODED_BYTE_WIDTH: usize = 4;

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    /// The command to be applied to the state machine
    pub command: Vec<u8>,
    /// Application logical timestep when the leader accepted the command
    pub timestep: u64,
}

impl LogEntry {
    /// Create a new log entry at timestep 0
    pub fn new(term: u64, index: u64, command: Vec<u8>) -> Self {
        Self { term, index, command, timestep: 0 }
    }

    /// Create a new log entry stamped with a logical timestep
    pub fn with_timestep(term: u64, index: u64, command: Vec<u8>, timestep: u64) -> Self {
        Self { term, index, command, timestep }
    }

    /// Upper bound on the encoded size of this entry inside a message
    pub fn encoded_len(&self) -> usize {
        ENTRY_OVERHEAD + ENCODED_BYTE_WIDTH * self.command.len()
    }
}

/// Ordered, contiguous run of entries following a snapshot watermark.
///
/// The entry at position `p` (1-based) always has
/// `index == last_included_index + p`. Entries at or below the watermark
/// have been compacted away and are never retained.
///
/// Readers take `&self`, mutators `&mut self`; the owning node serializes
/// mutation behind its lock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    entries: Vec<LogEntry>,
    last_included_index: u64,
    last_included_term: u64,
}

impl Log {
    /// Create an empty log with no snapshot
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from persisted parts, rejecting gaps or misplaced entries
    pub fn from_parts(
        entries: Vec<LogEntry>,
        last_included_index: u64,
        last_included_term: u64,
    ) -> Result<Self, RaftError> {
        for (offset, entry) in entries.iter().enumerate() {
            let expected = last_included_index + offset as u64 + 1;
            if entry.index != expected {
                return Err(RaftError::CorruptLog { expected, found: entry.index });
            }
        }

        Ok(Self { entries, last_included_index, last_included_term })
    }

    pub fn append(&mut self, entry: LogEntry) {
        self.append_batch(vec![entry]);
    }

    pub fn append_batch(&mut self, entries: Vec<LogEntry>) {
        self.entries.extend(entries);
    }

    /// Look up the entry at `index`.
    ///
    /// Returns `None` for indices that are compacted or past the end.
    ///
    /// # Panics
    ///
    /// Panics if the entry stored at the computed position carries a
    /// different index. That is local corruption and the node must not keep
    /// running on top of it.
    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        let position = self.position(index)?;
        let entry = &self.entries[position];

        if entry.index != index {
            panic!(
                "log corruption: position of index {} holds index {} (last_included_index={})",
                index, entry.index, self.last_included_index
            );
        }

        Some(entry)
    }

    /// Copy the entry at `index` and everything after it
    pub fn get_from(&self, index: u64) -> Vec<LogEntry> {
        match self.position(index) {
            Some(position) => self.entries[position..].to_vec(),
            None => Vec::new(),
        }
    }

    /// Term of a retained entry, or of the watermark itself
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.last_included_index {
            return Some(self.last_included_term);
        }
        self.get(index).map(|e| e.term)
    }

    pub fn last_index(&self) -> u64 {
        self.entries
            .last()
            .map_or(self.last_included_index, |e| e.index)
    }

    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map_or(self.last_included_term, |e| e.term)
    }

    /// Delete the entry at `index` and all entries after it.
    ///
    /// Out of range indices leave the log untouched.
    pub fn truncate_from(&mut self, index: u64) {
        if let Some(position) = self.position(index) {
            self.entries.truncate(position);
        }
    }

    /// Delete every entry with an index lower than `index`
    pub fn truncate_before(&mut self, index: u64) {
        if index <= self.last_included_index + 1 {
            return;
        }
        let count = ((index - self.last_included_index - 1) as usize).min(self.entries.len());
        self.entries.drain(..count);
    }

    /// Earliest retained index carrying `term`
    pub fn first_index_of_term(&self, term: u64) -> Option<u64> {
        self.entries.iter().find(|e| e.term == term).map(|e| e.index)
    }

    /// Drop every entry and restart the log after a snapshot
    pub fn reset_to_snapshot(&mut self, last_included_index: u64, last_included_term: u64) {
        self.entries.clear();
        self.set_watermark(last_included_index, last_included_term);
    }

    pub fn last_included_index(&self) -> u64 {
        self.last_included_index
    }

    pub fn last_included_term(&self) -> u64 {
        self.last_included_term
    }

    pub fn set_watermark(&mut self, last_included_index: u64, last_included_term: u64) {
        self.last_included_index = last_included_index;
        self.last_included_term = last_included_term;
    }

    /// Retained entries in index order
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, index: u64) -> Option<usize> {
        if index <= self.last_included_index {
            return None;
        }
        let position = (index - self.last_included_index - 1) as usize;
        (position < self.entries.len()).then_some(position)
    }
}
