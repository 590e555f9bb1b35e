//! Depth-first traversal
//!
//! Sequential: a page is fetched and its first new link followed before any
//! sibling. Candidates are admitted when popped from the stack, so a link
//! seen on several pages is still fetched once.

use super::{Admission, Candidate, Traversal};

impl Traversal {
    /// Crawl depth first. Returns candidates rejected for budget.
    pub(super) async fn depth_first(&mut self, start: Vec<Candidate>) -> Vec<Candidate> {
        let mut leftovers = Vec::new();
        let mut stack: Vec<Candidate> = start.into_iter().rev().collect();
        let mut fetched = false;

        while let Some(candidate) = stack.pop() {
            let url = match self.frontier.admit(&candidate.url, candidate.depth) {
                Admission::Admitted(url) => url,
                Admission::OverBudget => {
                    leftovers.push(candidate);
                    leftovers.extend(stack.drain(..).rev());
                    break;
                }
                Admission::Seen | Admission::TooDeep | Admission::Invalid => continue,
            };
            let candidate = Candidate { url, ..candidate };

            if fetched && !self.settings.delay.is_zero() {
                tokio::time::sleep(self.settings.delay).await;
            }
            fetched = true;

            let result = self.visitor.visit(&candidate.url, candidate.depth).await;
            let children = self.record(&candidate, result);
            stack.extend(children.into_iter().rev());
        }

        leftovers
    }
}

#[cfg(test)]
mod tests {
    use crate::frontier::test_support::FakeSite;
    use crate::frontier::{run_local, Seed, TraversalSettings, TraversalStrategy};
    use std::sync::Arc;
    use std::time::Duration;

    fn site() -> Arc<FakeSite> {
        Arc::new(FakeSite::new(&[
            ("https://d.example/", &["https://d.example/a", "https://d.example/b"]),
            ("https://d.example/a", &["https://d.example/a1", "https://d.example/b"]),
            ("https://d.example/a1", &[]),
            ("https://d.example/b", &["https://d.example/b1"]),
            ("https://d.example/b1", &[]),
        ]))
    }

    fn settings(delay: Duration) -> TraversalSettings {
        TraversalSettings {
            max_depth: 5,
            max_pages: 100,
            concurrency: 1,
            delay,
            high_value_patterns: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_first_link_followed_before_siblings() {
        let site = site();
        run_local(
            TraversalStrategy::Dfs,
            vec![Seed::new("https://d.example/")],
            site.clone(),
            settings(Duration::ZERO),
        )
        .await
        .unwrap();

        assert_eq!(
            site.visited(),
            vec![
                "https://d.example/",
                "https://d.example/a",
                "https://d.example/a1",
                "https://d.example/b",
                "https://d.example/b1",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_between_sequential_fetches() {
        let start = tokio::time::Instant::now();
        let report = run_local(
            TraversalStrategy::Dfs,
            vec![Seed::new("https://d.example/")],
            site(),
            settings(Duration::from_millis(250)),
        )
        .await
        .unwrap();

        assert_eq!(report.pages_crawled(), 5);
        assert!(start.elapsed() >= Duration::from_millis(1000));
    }
}
