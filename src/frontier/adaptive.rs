//! Adaptive (hybrid) traversal
//!
//! Three phases share the page budget:
//!
//! | phase    | share | candidates                                   |
//! |----------|-------|----------------------------------------------|
//! | bfs      | 25 %  | the seeds                                    |
//! | priority | 50 %  | high-value discovered links                   |
//! | dfs      | rest  | discovered deep-exploration links            |
//!
//! A link is high-value when it matches a pattern, or when the page it was
//! found on links to a matching URL. Links a phase discovers but does not
//! admit form the candidate pool of the next phase. Budget a phase leaves
//! unused carries over.

use super::url::{high_value_score, is_deep_exploration};
use super::{Candidate, PhaseSummary, Traversal};

const BFS_SHARE_PERCENT: usize = 25;
const PRIORITY_SHARE_PERCENT: usize = 50;

/// Page budgets of the first two phases for a run of `max_pages`
pub fn phase_budgets(max_pages: usize) -> (usize, usize) {
    let bfs = (max_pages * BFS_SHARE_PERCENT / 100).max(1).min(max_pages);
    let priority = max_pages * PRIORITY_SHARE_PERCENT / 100;
    (bfs, priority)
}

/// Own pattern matches, plus one when the candidate's page links to a match
fn score(candidate: &Candidate, patterns: &[String]) -> usize {
    high_value_score(&candidate.url, patterns) + usize::from(candidate.linked_high_value)
}

impl Traversal {
    pub(super) async fn adaptive(&mut self, seeds: Vec<Candidate>) {
        let (bfs_budget, priority_budget) = phase_budgets(self.settings.max_pages);
        let patterns = self.settings.high_value_patterns.clone();

        // Phase 1: breadth-first over the seeds
        self.frontier.begin_phase(Some(bfs_budget));
        let pool = self.breadth_first(seeds).await;
        let unused = bfs_budget.saturating_sub(self.frontier.phase_admitted());
        self.close_phase("bfs", Some(bfs_budget));

        // Phase 2: high-value links, best score first
        let (high_value, mut pool): (Vec<_>, Vec<_>) = pool
            .into_iter()
            .partition(|c| score(c, &patterns) > 0);
        let high_value: Vec<Candidate> = high_value
            .into_iter()
            .map(|c| Candidate {
                priority: score(&c, &patterns) as i64,
                ..c
            })
            .collect();

        let budget = priority_budget + unused;
        self.frontier.begin_phase(Some(budget));
        let leftovers = self
            .prioritized(high_value, |child| {
                let score = score(child, &patterns);
                (score > 0).then_some(score as i64)
            })
            .await;
        pool.extend(leftovers);
        self.close_phase("priority", Some(budget));

        // Phase 3: depth-first into deep-exploration links with what is left
        let deep: Vec<Candidate> = pool
            .into_iter()
            .filter(|c| is_deep_exploration(&c.url))
            .collect();
        self.frontier.begin_phase(None);
        self.depth_first(deep).await;
        self.close_phase("dfs", None);
    }

    fn close_phase(&mut self, name: &'static str, budget: Option<usize>) {
        let admitted = self.frontier.phase_admitted();
        tracing::debug!(phase = name, admitted, "Adaptive phase finished");
        self.report.phases.push(PhaseSummary {
            name,
            budget,
            admitted,
        });
    }
}
