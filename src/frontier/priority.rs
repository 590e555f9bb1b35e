//! Priority traversal: batches sorted once by priority, fetched concurrently

use std::cmp::Reverse;

use super::{Candidate, Traversal};

impl Traversal {
    /// Crawl in rounds. Each round is sorted by priority (stable, so equal
    /// priorities keep discovery order) and fetched with bounded concurrency.
    ///
    /// `rank` assigns each discovered link its priority for the next round;
    /// links it rejects are returned with the budget leftovers.
    pub(super) async fn prioritized<F>(&mut self, start: Vec<Candidate>, rank: F) -> Vec<Candidate>
    where
        F: Fn(&Candidate) -> Option<i64>,
    {
        let mut leftovers = Vec::new();
        let mut round = start;

        loop {
            round.sort_by_key(|c| Reverse(c.priority));

            let mut batch = Vec::new();
            for candidate in round {
                if let Some(admitted) = self.offer(candidate, &mut leftovers) {
                    batch.push(admitted);
                }
            }
            if batch.is_empty() {
                break;
            }

            let results = self.visit_batch(&batch).await;

            let mut next = Vec::new();
            for (candidate, result) in batch.iter().zip(results) {
                for child in self.record(candidate, result) {
                    match rank(&child) {
                        Some(priority) => next.push(Candidate { priority, ..child }),
                        None => leftovers.push(child),
                    }
                }
            }
            round = next;
        }

        leftovers
    }
}
