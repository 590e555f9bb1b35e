//! Load balancer: capacity and performance aware node selection
//!
//! Scoring is a pure function of a registry snapshot, so it can be tested
//! without any runtime.
//!
//! ```text
//! score = 0.4 availability + 0.3 performance + 0.2 completion_rate + 0.1 responsiveness
//! ```

use serde::Serialize;

use crate::models::{CrawlTask, CrawlerNode};

const WEIGHT_AVAILABILITY: f64 = 0.4;
const WEIGHT_PERFORMANCE: f64 = 0.3;
const WEIGHT_COMPLETION: f64 = 0.2;
const WEIGHT_RESPONSIVENESS: f64 = 0.1;

/// Completed-task count at which a node's track record saturates
const COMPLETION_SATURATION: f64 = 1000.0;

/// Mean task time (seconds) at which responsiveness bottoms out
const RESPONSIVENESS_HORIZON_SECS: f64 = 60.0;

const MIN_RESPONSIVENESS: f64 = 0.1;

/// Score of one node, broken down by component
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NodeScore {
    pub availability: f64,
    pub performance: f64,
    pub completion_rate: f64,
    pub responsiveness: f64,
    pub total: f64,
}

/// Score a node. Callers must filter out nodes without spare capacity first.
pub fn score_node(node: &CrawlerNode) -> NodeScore {
    let metrics = &node.performance_metrics;

    let availability = if node.max_concurrent_tasks == 0 {
        0.0
    } else {
        1.0 - node.current_tasks as f64 / node.max_concurrent_tasks as f64
    };

    let performance = 0.4 * (1.0 - metrics.cpu_usage / 100.0)
        + 0.3 * (1.0 - metrics.memory_usage / 100.0)
        + 0.3 * metrics.success_rate;

    let completion_rate = (metrics.tasks_completed as f64 / COMPLETION_SATURATION).min(1.0);

    let responsiveness =
        (1.0 - metrics.avg_task_time / RESPONSIVENESS_HORIZON_SECS).max(MIN_RESPONSIVENESS);

    let total = WEIGHT_AVAILABILITY * availability
        + WEIGHT_PERFORMANCE * performance
        + WEIGHT_COMPLETION * completion_rate
        + WEIGHT_RESPONSIVENESS * responsiveness;

    NodeScore {
        availability,
        performance,
        completion_rate,
        responsiveness,
        total,
    }
}

/// Whether a node advertises every capability the task requires
pub fn satisfies_requirements(node: &CrawlerNode, task: &CrawlTask) -> bool {
    task.requirements()
        .iter()
        .all(|cap| node.capabilities.contains(cap))
}

/// Pick the best node for a task.
///
/// Nodes without spare capacity or missing a required capability are
/// skipped. Ties go to the earliest candidate. Returns `None` when no
/// candidate qualifies.
pub fn select_node<'a>(candidates: &'a [CrawlerNode], task: &CrawlTask) -> Option<&'a CrawlerNode> {
    let mut best: Option<(&CrawlerNode, f64)> = None;

    for node in candidates
        .iter()
        .filter(|n| n.has_capacity())
        .filter(|n| satisfies_requirements(n, task))
    {
        let score = score_node(node).total;
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((node, score)),
        }
    }

    if let Some((node, score)) = best {
        tracing::debug!(task_id = %task.id, node = %node.id, score, "Selected node");
    }
    best.map(|(node, _)| node)
}
