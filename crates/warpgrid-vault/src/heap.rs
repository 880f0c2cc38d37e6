//! Indexed min-heap of renewal requests.
//!
//! A binary heap stored in a `Vec`, ordered by next renewal deadline, plus
//! an `id → position` map so that any entry (not just the root) can be
//! rescheduled or removed in O(log n). Cancellation and rescheduling both
//! act on arbitrary entries, which `std::collections::BinaryHeap` cannot do.
//!
//! The heap is not internally synchronized; the renewer wraps it in a mutex.

use std::collections::HashMap;

use tokio::time::Instant;

use crate::error::{VaultError, VaultResult};
use crate::request::RenewalRequest;

struct HeapEntry {
    deadline: Instant,
    request: RenewalRequest,
}

/// Renewal requests keyed ascending by deadline, addressable by id.
#[derive(Default)]
pub struct RenewalHeap {
    entries: Vec<HeapEntry>,
    /// Lease id → index into `entries`.
    index: HashMap<String, usize>,
}

impl RenewalHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a request due at `deadline`.
    pub fn push(&mut self, request: RenewalRequest, deadline: Instant) -> VaultResult<()> {
        if self.index.contains_key(request.id()) {
            return Err(VaultError::DuplicateId(request.id().to_string()));
        }

        let pos = self.entries.len();
        self.index.insert(request.id().to_string(), pos);
        self.entries.push(HeapEntry { deadline, request });
        self.sift_up(pos);
        Ok(())
    }

    /// Move an existing request to a new deadline, earlier or later.
    pub fn update(&mut self, id: &str, deadline: Instant) -> VaultResult<()> {
        let pos = *self
            .index
            .get(id)
            .ok_or_else(|| VaultError::NotTracked(id.to_string()))?;

        self.entries[pos].deadline = deadline;
        self.fix(pos);
        Ok(())
    }

    /// Remove a request wherever it sits in the heap and hand it back.
    pub fn remove(&mut self, id: &str) -> VaultResult<RenewalRequest> {
        let pos = self
            .index
            .remove(id)
            .ok_or_else(|| VaultError::NotTracked(id.to_string()))?;

        let removed = self.entries.swap_remove(pos);
        if pos < self.entries.len() {
            // The former last entry now sits at `pos`.
            if let Some(slot) = self.index.get_mut(self.entries[pos].request.id()) {
                *slot = pos;
            }
            self.fix(pos);
        }
        Ok(removed.request)
    }

    /// The request with the earliest deadline, without removing it.
    pub fn peek(&self) -> Option<(&RenewalRequest, Instant)> {
        self.entries.first().map(|e| (&e.request, e.deadline))
    }

    pub fn get(&self, id: &str) -> Option<(&RenewalRequest, Instant)> {
        let pos = *self.index.get(id)?;
        let entry = &self.entries[pos];
        Some((&entry.request, entry.deadline))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every request, in no particular order.
    pub fn drain(&mut self) -> Vec<RenewalRequest> {
        self.index.clear();
        self.entries.drain(..).map(|e| e.request).collect()
    }

    // ── Heap maintenance ────────────────────────────────────────────

    fn fix(&mut self, pos: usize) {
        if self.sift_up(pos) == pos {
            self.sift_down(pos);
        }
    }

    /// Returns the entry's final position.
    fn sift_up(&mut self, mut pos: usize) -> usize {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.entries[pos].deadline >= self.entries[parent].deadline {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
        pos
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut smallest = pos;

            if left < len && self.entries[left].deadline < self.entries[smallest].deadline {
                smallest = left;
            }
            if right < len && self.entries[right].deadline < self.entries[smallest].deadline {
                smallest = right;
            }
            if smallest == pos {
                break;
            }
            self.swap(pos, smallest);
            pos = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.entries.swap(a, b);
        for pos in [a, b] {
            if let Some(slot) = self.index.get_mut(self.entries[pos].request.id()) {
                *slot = pos;
            }
        }
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        assert_eq!(self.entries.len(), self.index.len());
        for (pos, entry) in self.entries.iter().enumerate() {
            assert_eq!(self.index.get(entry.request.id()), Some(&pos));
            if pos > 0 {
                let parent = (pos - 1) / 2;
                assert!(self.entries[parent].deadline <= entry.deadline);
            }
        }
    }
}
