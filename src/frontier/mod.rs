//! Frontier traversal policies
//!
//! A frontier decides which discovered URLs are admitted and in what order.
//! Every policy shares one admission rule: a normalized URL is admitted at
//! most once per run, within `max_depth` and the `max_pages` budget, and it is
//! marked visited at admission time so the same URL is never in flight twice.
//!
//! Two runners build on it:
//!
//! - [`Traversal`] crawls in a single process through a [`PageVisitor`]
//!   (`bfs`, `dfs`, `priority` and `adaptive` submodules).
//! - [`QueueFrontier`] feeds the distributed [`TaskQueue`](crate::queue::TaskQueue),
//!   approximating each policy with task priorities.

pub mod adaptive;
pub mod bfs;
pub mod dfs;
pub mod feeder;
pub mod priority;
pub mod url;

pub use feeder::QueueFrontier;
pub use url::{is_deep_exploration, matches_any, normalize_url};

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::CrawlerConfig;
use crate::error::{ErrorCategory, FleetErrorTrait};
use crate::fetcher::{FetchError, PageVisit, SharedVisitor};
use crate::queue::QueueError;

// ============================================================================
// Strategy
// ============================================================================

/// Traversal policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraversalStrategy {
    /// Level by level, shallow pages first
    #[default]
    Bfs,
    /// Follow the first new link before siblings
    Dfs,
    /// Caller-supplied priorities
    Priority,
    /// BFS, then high-value priority, then deep DFS
    Adaptive,
}

impl TraversalStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bfs => "bfs",
            Self::Dfs => "dfs",
            Self::Priority => "priority",
            Self::Adaptive => "adaptive",
        }
    }
}

impl fmt::Display for TraversalStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TraversalStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bfs" | "breadth-first" => Ok(Self::Bfs),
            "dfs" | "depth-first" => Ok(Self::Dfs),
            "priority" => Ok(Self::Priority),
            "adaptive" | "hybrid" => Ok(Self::Adaptive),
            other => Err(format!(
                "unknown strategy '{other}' (expected bfs, dfs, priority or adaptive)"
            )),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Frontier errors
#[derive(Error, Debug)]
pub enum FrontierError {
    #[error("No seed URLs given")]
    NoSeeds,

    #[error("Invalid seed URL '{0}'")]
    InvalidSeed(String),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl FleetErrorTrait for FrontierError {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Queue(e) => e.is_recoverable(),
            Self::NoSeeds | Self::InvalidSeed(_) => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Queue(e) => e.category(),
            Self::NoSeeds | Self::InvalidSeed(_) => ErrorCategory::Input,
        }
    }
}

// ============================================================================
// Settings & Seeds
// ============================================================================

/// Limits and knobs shared by every policy
#[derive(Debug, Clone, PartialEq)]
pub struct TraversalSettings {
    pub max_depth: u32,
    pub max_pages: usize,
    /// Pages fetched at once by BFS and priority batches
    pub concurrency: usize,
    /// Pause between sequential DFS fetches
    pub delay: Duration,
    pub high_value_patterns: Vec<String>,
}

impl TraversalSettings {
    pub fn from_config(config: &CrawlerConfig) -> Self {
        Self {
            max_depth: config.max_depth,
            max_pages: config.max_pages,
            concurrency: config.max_concurrency.max(1),
            delay: config.delay(),
            high_value_patterns: config.high_value_patterns.clone(),
        }
    }
}

impl Default for TraversalSettings {
    fn default() -> Self {
        Self::from_config(&CrawlerConfig::default())
    }
}

/// Starting URL with an optional caller priority
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seed {
    pub url: String,
    pub priority: i64,
}

impl Seed {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

impl From<&str> for Seed {
    fn from(url: &str) -> Self {
        Self::new(url)
    }
}

impl From<String> for Seed {
    fn from(url: String) -> Self {
        Self::new(url)
    }
}

/// Normalize seeds, failing on the first invalid one
pub(crate) fn validate_seeds(seeds: &[Seed]) -> Result<Vec<Seed>, FrontierError> {
    if seeds.is_empty() {
        return Err(FrontierError::NoSeeds);
    }
    seeds
        .iter()
        .map(|seed| {
            normalize_url(&seed.url)
                .map(|url| Seed {
                    url,
                    priority: seed.priority,
                })
                .ok_or_else(|| FrontierError::InvalidSeed(seed.url.clone()))
        })
        .collect()
}

// ============================================================================
// Admission
// ============================================================================

/// Result of offering a URL to the frontier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Newly admitted, carrying the normalized URL
    Admitted(String),
    /// Already admitted earlier in this run
    Seen,
    TooDeep,
    /// Page budget of the run or the current phase is used up
    OverBudget,
    /// Not an http(s) URL
    Invalid,
}

/// Visited set and page budget of one run
#[derive(Debug, Clone)]
pub struct Frontier {
    visited: HashSet<String>,
    max_depth: u32,
    max_pages: usize,
    admitted: usize,
    phase_limit: Option<usize>,
    phase_admitted: usize,
}

impl Frontier {
    pub fn new(max_depth: u32, max_pages: usize) -> Self {
        Self {
            visited: HashSet::new(),
            max_depth,
            max_pages,
            admitted: 0,
            phase_limit: None,
            phase_admitted: 0,
        }
    }

    /// Offer a URL discovered at `depth`
    pub fn admit(&mut self, url: &str, depth: u32) -> Admission {
        let Some(normalized) = normalize_url(url) else {
            return Admission::Invalid;
        };
        if depth > self.max_depth {
            return Admission::TooDeep;
        }
        if self.visited.contains(&normalized) {
            return Admission::Seen;
        }
        if self.remaining() == 0 {
            return Admission::OverBudget;
        }

        self.visited.insert(normalized.clone());
        self.admitted += 1;
        self.phase_admitted += 1;
        Admission::Admitted(normalized)
    }

    /// Undo the admission of a URL that never reached the queue, returning
    /// its budget slot
    pub fn forget(&mut self, url: &str) {
        let normalized = normalize_url(url).unwrap_or_else(|| url.to_string());
        if self.visited.remove(&normalized) {
            self.admitted = self.admitted.saturating_sub(1);
            self.phase_admitted = self.phase_admitted.saturating_sub(1);
        }
    }

    /// Whether a URL was already admitted
    pub fn is_visited(&self, url: &str) -> bool {
        normalize_url(url).is_some_and(|u| self.visited.contains(&u))
    }

    /// Pages admitted over the whole run
    pub fn admitted(&self) -> usize {
        self.admitted
    }

    /// Pages that can still be admitted, honoring the phase limit
    pub fn remaining(&self) -> usize {
        let total = self.max_pages.saturating_sub(self.admitted);
        match self.phase_limit {
            Some(limit) => total.min(limit.saturating_sub(self.phase_admitted)),
            None => total,
        }
    }

    /// Start a phase capped at `limit` admissions (`None` = run budget only)
    pub fn begin_phase(&mut self, limit: Option<usize>) {
        self.phase_limit = limit;
        self.phase_admitted = 0;
    }

    pub fn phase_admitted(&self) -> usize {
        self.phase_admitted
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    pub fn max_pages(&self) -> usize {
        self.max_pages
    }
}

// ============================================================================
// Single-process Traversal
// ============================================================================

/// URL waiting to be admitted, with the depth and priority it would get
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub url: String,
    pub depth: u32,
    pub priority: i64,
    /// Found on a page that links to high-value URLs
    pub linked_high_value: bool,
}

impl Candidate {
    fn seed(seed: Seed) -> Self {
        Self {
            url: seed.url,
            depth: 0,
            priority: seed.priority,
            linked_high_value: false,
        }
    }

    /// Link found on `parent`'s page; inherits its priority
    fn child(parent: &Candidate, url: String, linked_high_value: bool) -> Self {
        Self {
            url,
            depth: parent.depth + 1,
            priority: parent.priority,
            linked_high_value,
        }
    }
}

/// Page that could not be visited
#[derive(Debug, Clone, PartialEq)]
pub struct FailedVisit {
    pub url: String,
    pub depth: u32,
    pub error: String,
}

/// Pages admitted by one adaptive phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseSummary {
    pub name: &'static str,
    pub budget: Option<usize>,
    pub admitted: usize,
}

/// Outcome of a single-process run
#[derive(Debug, Clone)]
pub struct TraversalReport {
    pub strategy: TraversalStrategy,
    /// Visits in the order they finished
    pub pages: Vec<PageVisit>,
    pub failures: Vec<FailedVisit>,
    pub admitted: usize,
    pub phases: Vec<PhaseSummary>,
    pub elapsed: Duration,
}

impl TraversalReport {
    fn new(strategy: TraversalStrategy) -> Self {
        Self {
            strategy,
            pages: Vec::new(),
            failures: Vec::new(),
            admitted: 0,
            phases: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    /// Pages visited successfully (robots skips included)
    pub fn pages_crawled(&self) -> usize {
        self.pages.len()
    }

    pub fn visited_urls(&self) -> Vec<&str> {
        self.pages.iter().map(|p| p.url.as_str()).collect()
    }
}

/// Single-process crawl driven by one policy
pub struct Traversal {
    strategy: TraversalStrategy,
    visitor: SharedVisitor,
    settings: TraversalSettings,
    frontier: Frontier,
    report: TraversalReport,
}

impl Traversal {
    pub fn new(
        strategy: TraversalStrategy,
        visitor: SharedVisitor,
        settings: TraversalSettings,
    ) -> Self {
        let frontier = Frontier::new(settings.max_depth, settings.max_pages);
        Self {
            strategy,
            visitor,
            settings,
            frontier,
            report: TraversalReport::new(strategy),
        }
    }

    /// Crawl from `seeds` until the frontier is exhausted or the budget is spent
    pub async fn run(mut self, seeds: Vec<Seed>) -> Result<TraversalReport, FrontierError> {
        let seeds = validate_seeds(&seeds)?;
        let start = Instant::now();
        let candidates: Vec<Candidate> = seeds.into_iter().map(Candidate::seed).collect();

        tracing::info!(
            strategy = %self.strategy,
            seeds = candidates.len(),
            max_depth = self.settings.max_depth,
            max_pages = self.settings.max_pages,
            "Starting traversal"
        );

        match self.strategy {
            TraversalStrategy::Bfs => {
                self.breadth_first(candidates).await;
            }
            TraversalStrategy::Dfs => {
                self.depth_first(candidates).await;
            }
            TraversalStrategy::Priority => {
                self.prioritized(candidates, |child| Some(child.priority))
                    .await;
            }
            TraversalStrategy::Adaptive => self.adaptive(candidates).await,
        }

        self.report.admitted = self.frontier.admitted();
        self.report.elapsed = start.elapsed();

        tracing::info!(
            strategy = %self.strategy,
            pages = self.report.pages_crawled(),
            failures = self.report.failures.len(),
            elapsed_ms = self.report.elapsed.as_millis() as u64,
            "Traversal finished"
        );
        Ok(self.report)
    }

    /// Visit a batch concurrently, results in batch order
    async fn visit_batch(&self, batch: &[Candidate]) -> Vec<Result<PageVisit, FetchError>> {
        let visitor = &self.visitor;
        stream::iter(batch)
            .map(|candidate| visitor.visit(&candidate.url, candidate.depth))
            .buffered(self.settings.concurrency.max(1))
            .collect()
            .await
    }

    /// Record a visit and return the links it discovered as candidates one
    /// level deeper
    fn record(&mut self, candidate: &Candidate, result: Result<PageVisit, FetchError>) -> Vec<Candidate> {
        match result {
            Ok(visit) => {
                let patterns = &self.settings.high_value_patterns;
                let linked_high_value = visit.links.iter().any(|link| matches_any(link, patterns));
                let children = visit
                    .links
                    .iter()
                    .map(|link| Candidate::child(candidate, link.clone(), linked_high_value))
                    .collect();
                self.report.pages.push(visit);
                children
            }
            Err(e) => {
                tracing::warn!(url = %candidate.url, depth = candidate.depth, error = %e, "Failed to visit page");
                self.report.failures.push(FailedVisit {
                    url: candidate.url.clone(),
                    depth: candidate.depth,
                    error: e.to_string(),
                });
                Vec::new()
            }
        }
    }

    /// Admit a candidate; budget overflow is kept for later phases
    fn offer(&mut self, candidate: Candidate, leftovers: &mut Vec<Candidate>) -> Option<Candidate> {
        match self.frontier.admit(&candidate.url, candidate.depth) {
            Admission::Admitted(url) => Some(Candidate { url, ..candidate }),
            Admission::OverBudget => {
                leftovers.push(candidate);
                None
            }
            Admission::Seen | Admission::TooDeep | Admission::Invalid => None,
        }
    }
}

/// Crawl `seeds` in this process with the given policy
pub async fn run_local(
    strategy: TraversalStrategy,
    seeds: Vec<Seed>,
    visitor: SharedVisitor,
    settings: TraversalSettings,
) -> Result<TraversalReport, FrontierError> {
    Traversal::new(strategy, visitor, settings).run(seeds).await
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Deterministic in-memory site for traversal tests

    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use crate::fetcher::{FetchError, PageVisit, PageVisitor};

    /// Map of URL → outgoing links; unknown URLs fail with 404
    pub struct FakeSite {
        pages: HashMap<String, Vec<String>>,
        pub visits: Mutex<Vec<String>>,
    }

    impl FakeSite {
        pub fn new(pages: &[(&str, &[&str])]) -> Self {
            Self {
                pages: pages
                    .iter()
                    .map(|(url, links)| {
                        (
                            url.to_string(),
                            links.iter().map(|l| l.to_string()).collect(),
                        )
                    })
                    .collect(),
                visits: Mutex::new(Vec::new()),
            }
        }

        pub fn visited(&self) -> Vec<String> {
            self.visits.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageVisitor for FakeSite {
        async fn visit(&self, url: &str, depth: u32) -> Result<PageVisit, FetchError> {
            self.visits.lock().unwrap().push(url.to_string());
            let links = self
                .pages
                .get(url)
                .cloned()
                .ok_or(FetchError::HttpStatus(404))?;
            Ok(PageVisit {
                url: url.to_string(),
                depth,
                status_code: 200,
                content_length: 0,
                links,
                elapsed_ms: 0,
                skipped: None,
            })
        }
    }
}
