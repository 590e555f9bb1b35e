//! Breadth-first traversal: every page at depth d before any page at d+1

use super::{Candidate, Traversal};

impl Traversal {
    /// Crawl level by level. Returns candidates rejected for budget.
    pub(super) async fn breadth_first(&mut self, start: Vec<Candidate>) -> Vec<Candidate> {
        let mut leftovers = Vec::new();
        let mut level: Vec<Candidate> = start
            .into_iter()
            .filter_map(|c| self.offer(c, &mut leftovers))
            .collect();

        while !level.is_empty() {
            tracing::debug!(
                depth = level[0].depth,
                pages = level.len(),
                "Crawling BFS level"
            );

            let results = self.visit_batch(&level).await;

            let mut next = Vec::new();
            for (candidate, result) in level.iter().zip(results) {
                for child in self.record(candidate, result) {
                    if let Some(child) = self.offer(child, &mut leftovers) {
                        next.push(child);
                    }
                }
            }
            level = next;
        }

        leftovers
    }
}
