use super::{NodeID, Term};

use serde_derive::{Deserialize, Serialize};

/// A log index. The log is 0-indexed; -1 indicates "before the log".
pub type Index = i64;

/// A client key/value mutation, encoded on the wire as `[key, value]`.
pub type Command = (String, String);

/// A log entry: the term in which it was proposed and the mutation it
/// carries. Encoded on the wire as `[term, [key, value]]`. None (noop)
/// commands are proposed during leader election to commit entries from
/// prior terms, see section 5.4.2 in the Raft paper; they encode as
/// `[term, null]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry(pub Term, pub Option<Command>);

impl Entry {
    /// Returns the term in which the entry was proposed.
    pub fn term(&self) -> Term {
        self.0
    }

    /// Returns the entry's key/value mutation, or None for a noop.
    pub fn command(&self) -> Option<(&str, &str)> {
        self.1.as_ref().map(|(key, value)| (key.as_str(), value.as_str()))
    }
}

/// The replicated log: an in-memory sequence of client mutations, replicated
/// from the leader to followers and applied in order to the key/value state
/// machine once committed. Also tracks the current term and vote, since both
/// must move in lockstep with the log.
///
/// The log has the following invariants:
///
/// * Entry indexes are contiguous starting at 0 (no index gaps).
/// * Entry terms never decrease from the previous entry.
/// * Entry terms are at or below the current term.
/// * Appended entries use the current term.
/// * Committed entries are never changed or removed.
/// * Entries with the same index/term contain the same command, and identical
///   prefixes (see section 5.3 in the Raft paper).
///
/// Nothing is persisted: a crashed replica is modeled as lost, and rejoins
/// the cluster as a fresh node that gets caught up by the leader.
pub struct Log {
    /// The log entries, where index i is stored at position i.
    entries: Vec<Entry>,
    /// The current term.
    term: Term,
    /// Our leader vote in the current term, if any.
    vote: Option<NodeID>,
    /// The index of the last committed entry, or -1 if none.
    commit_index: Index,
    /// The term of the last committed entry, or 0 if none.
    commit_term: Term,
}

impl Log {
    /// Creates a new, empty log.
    pub fn new() -> Self {
        Self { entries: Vec::new(), term: 0, vote: None, commit_index: -1, commit_term: 0 }
    }

    /// Returns the current term (0 if none).
    pub fn term(&self) -> Term {
        self.term
    }

    /// Returns our vote in the current term, if any.
    pub fn vote(&self) -> Option<&NodeID> {
        self.vote.as_ref()
    }

    /// Sets the current term and cast vote (if any). Enforces that the term
    /// does not regress, and that we only vote for one node per term.
    pub fn set_term(&mut self, term: Term, vote: Option<NodeID>) {
        assert!(term > 0, "can't set term 0");
        assert!(term >= self.term, "term regression {} → {}", self.term, term);
        assert!(term > self.term || self.vote.is_none() || vote == self.vote, "can't change vote");
        self.term = term;
        self.vote = vote;
    }

    /// Returns the number of entries in the log.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the index of the last entry, or -1 if the log is empty.
    pub fn last_index(&self) -> Index {
        self.entries.len() as Index - 1
    }

    /// Returns the term of the last entry, or 0 if the log is empty.
    pub fn last_term(&self) -> Term {
        self.entries.last().map(Entry::term).unwrap_or(0)
    }

    /// Returns the commit index, or -1 if no entries are committed.
    pub fn commit_index(&self) -> Index {
        self.commit_index
    }

    /// Returns the term of the last committed entry, or 0 if none.
    pub fn commit_term(&self) -> Term {
        self.commit_term
    }

    /// Appends a command to the log at the current term, returning its index.
    /// None implies a noop command, used after leader elections.
    pub fn append(&mut self, command: Option<Command>) -> Index {
        assert!(self.term > 0, "can't append entry in term 0");
        self.entries.push(Entry(self.term, command));
        self.last_index()
    }

    /// Fetches the entry at an index, or None if it does not exist.
    pub fn get(&self, index: Index) -> Option<&Entry> {
        if index < 0 {
            return None;
        }
        self.entries.get(index as usize)
    }

    /// Checks if the log contains an entry with the given index and term.
    pub fn has(&self, index: Index, term: Term) -> bool {
        self.get(index).map(|e| e.term() == term).unwrap_or(false)
    }

    /// Splices a batch of entries into the log immediately after prev_index.
    /// Entries already in the log with matching terms are skipped (duplicate
    /// and overlapping deliveries are idempotent), the log is truncated at
    /// the first conflicting entry, and the remainder is appended. Returns
    /// the resulting last index.
    ///
    /// Panics if the splice would remove a committed entry: a conflict below
    /// the commit index means the cluster has diverged.
    pub fn splice(&mut self, prev_index: Index, entries: Vec<Entry>) -> Index {
        assert!(prev_index >= -1, "invalid splice base {prev_index}");
        assert!(prev_index <= self.last_index(), "splice base {prev_index} beyond log");

        // Skip entries that are already in the log.
        let mut skip = 0;
        while skip < entries.len() {
            let index = prev_index + 1 + skip as Index;
            match self.get(index) {
                Some(entry) if entry.term() == entries[skip].term() => {
                    debug_assert_eq!(entry, &entries[skip], "command mismatch at index {index}");
                    skip += 1;
                }
                _ => break,
            }
        }
        if skip == entries.len() {
            return self.last_index();
        }

        // Truncate the conflicting tail (if any) and append the rest.
        let from = prev_index + 1 + skip as Index;
        assert!(from > self.commit_index, "spliced entries below commit index");
        self.entries.truncate(from as usize);
        self.entries.extend(entries.into_iter().skip(skip));
        self.last_index()
    }

    /// Returns a copy of up to max entries starting at the given index.
    pub fn scan(&self, from: Index, max: usize) -> Vec<Entry> {
        assert!(from >= 0, "invalid scan start {from}");
        let from = from as usize;
        let to = std::cmp::min(from + max, self.entries.len());
        self.entries[from..to].to_vec()
    }

    /// Commits entries up to and including the given index. The index must
    /// exist and be at or after the current commit index.
    pub fn commit(&mut self, index: Index) -> Index {
        assert!(index >= self.commit_index, "commit regression {} → {index}", self.commit_index);
        if index == self.commit_index {
            return index;
        }
        let term = self.get(index).expect("commit index does not exist").term();
        self.commit_index = index;
        self.commit_term = term;
        index
    }
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}
