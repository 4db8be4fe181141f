//! Approval backlog
//!
//! Deduplicating FIFO queue of pending requests. This is the only structure
//! touched by more than one actor (fetch workers add, the prompt loop reads
//! and pops, the session controller clears), so every operation takes the one
//! lock and nothing else.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use crate::proto::ApproveRequest;

#[derive(Default)]
struct Inner {
    queue: VecDeque<ApproveRequest>,
    ids: HashSet<String>,
}

/// Pending approval requests in arrival order, at most one entry per id.
#[derive(Default)]
pub struct Backlog {
    inner: Mutex<Inner>,
}

impl Backlog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert at the tail unless the id is already queued.
    ///
    /// Returns whether the request was actually inserted. A duplicate is not
    /// an error; the stream redelivers ids on reconnect.
    pub fn add(&self, req: ApproveRequest) -> bool {
        let mut inner = self.inner.lock().expect("backlog lock poisoned");
        if inner.ids.contains(req.id()) {
            return false;
        }
        inner.ids.insert(req.id().to_string());
        inner.queue.push_back(req);
        true
    }

    /// Oldest pending request, without removing it.
    pub fn head(&self) -> Option<ApproveRequest> {
        let inner = self.inner.lock().expect("backlog lock poisoned");
        inner.queue.front().cloned()
    }

    /// Remove and return the oldest pending request, freeing its id.
    pub fn pop(&self) -> Option<ApproveRequest> {
        let mut inner = self.inner.lock().expect("backlog lock poisoned");
        let req = inner.queue.pop_front();
        if let Some(req) = &req {
            inner.ids.remove(req.id());
        }
        req
    }

    /// Drop everything. Used on stream stop so stale requests cannot be
    /// approved after a reconnect changes context.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("backlog lock poisoned");
        inner.queue.clear();
        inner.ids.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("backlog lock poisoned").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::ApproveRequest;
    use std::sync::Arc;

    fn req(id: &str) -> ApproveRequest {
        ApproveRequest {
            id: Some(id.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn duplicate_add_is_ignored() {
        let backlog = Backlog::new();
        assert!(backlog.add(req("A")));
        assert!(backlog.add(req("B")));
        assert!(!backlog.add(req("A")));

        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog.head().unwrap().id(), "A");
        assert_eq!(backlog.pop().unwrap().id(), "A");
        assert_eq!(backlog.head().unwrap().id(), "B");
    }

    #[test]
    fn pop_frees_the_id_for_reuse() {
        let backlog = Backlog::new();
        assert!(backlog.add(req("A")));
        assert_eq!(backlog.pop().unwrap().id(), "A");
        assert!(backlog.add(req("A")));
        assert_eq!(backlog.len(), 1);
    }

    #[test]
    fn pop_on_empty_returns_none() {
        let backlog = Backlog::new();
        assert!(backlog.pop().is_none());
        assert!(backlog.head().is_none());
    }

    #[test]
    fn clear_resets_length_and_membership() {
        let backlog = Backlog::new();
        for id in ["A", "B", "C"] {
            backlog.add(req(id));
        }
        backlog.clear();
        assert!(backlog.is_empty());
        // Cleared ids must be insertable again.
        assert!(backlog.add(req("B")));
        assert_eq!(backlog.head().unwrap().id(), "B");
    }

    #[test]
    fn add_after_clear_becomes_the_new_head() {
        // A fetch finishing just after stop() lands in the cleared backlog.
        let backlog = Backlog::new();
        backlog.add(req("OLD"));
        backlog.clear();
        backlog.add(req("LATE"));
        assert_eq!(backlog.head().unwrap().id(), "LATE");
    }

    #[test]
    fn concurrent_adds_of_the_same_id_insert_exactly_once() {
        let backlog = Arc::new(Backlog::new());
        let mut handles = Vec::new();
        for _ in 0..2 {
            let backlog = backlog.clone();
            handles.push(std::thread::spawn(move || backlog.add(req("X"))));
        }
        let results: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|inserted| **inserted).count(), 1);
        assert_eq!(backlog.len(), 1);
    }

    #[test]
    fn many_threads_never_produce_duplicates() {
        let backlog = Arc::new(Backlog::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let backlog = backlog.clone();
            handles.push(std::thread::spawn(move || {
                // Every thread adds the same 50 ids.
                for i in 0..50 {
                    backlog.add(req(&format!("id-{i}")));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(backlog.len(), 50);
        let mut seen = std::collections::HashSet::new();
        while let Some(r) = backlog.pop() {
            assert!(seen.insert(r.id().to_string()));
        }
    }
}
