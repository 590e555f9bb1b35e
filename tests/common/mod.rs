//! Common test utilities

use async_trait::async_trait;
use fleetcrawl::config::Config;
use fleetcrawl::fetcher::{FetchError, PageVisit, PageVisitor};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// In-memory site: URL to outgoing links. Unknown URLs answer 404.
pub struct FakeSite {
    pages: HashMap<String, Vec<String>>,
    visits: Mutex<Vec<String>>,
    latency: Duration,
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
            latency: Duration::ZERO,
        }
    }

    /// Delay every visit by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Site with `fanout` children under the root, each a leaf
    pub fn star(root: &str, fanout: usize) -> Self {
        let children: Vec<String> = (0..fanout).map(|i| format!("{root}page/{i}")).collect();
        let mut pages: HashMap<String, Vec<String>> = children
            .iter()
            .map(|c| (c.clone(), Vec::new()))
            .collect();
        pages.insert(root.to_string(), children);
        Self {
            pages,
            visits: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
        }
    }

    pub fn visited(&self) -> Vec<String> {
        self.visits.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageVisitor for FakeSite {
    async fn visit(&self, url: &str, depth: u32) -> Result<PageVisit, FetchError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
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
            content_length: 128,
            links,
            elapsed_ms: self.latency.as_millis() as u64,
            skipped: None,
        })
    }
}

/// Configuration with fast loops for in-process clusters
#[allow(dead_code)]
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.crawler.delay_ms = 0;
    config.crawler.max_pages = 100;
    config.crawler.max_depth = 3;
    config.cluster.heartbeat_interval_secs = 1;
    config.cluster.monitor_interval_secs = 1;
    config.cluster.idle_poll_ms = 10;
    config.cluster.no_capacity_backoff_ms = 10;
    config.cluster.max_concurrent_tasks = 2;
    config
}
