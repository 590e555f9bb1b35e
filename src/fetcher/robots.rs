//! robots.txt checker with a per-origin cache
//!
//! Rules are fetched once per origin and kept for a day. A robots.txt that
//! cannot be fetched, or answers with an error status, allows everything.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use robotstxt::DefaultMatcher;
use std::collections::HashMap;
use tokio::sync::Mutex;
use url::Url;

use super::{FetchError, RobotsChecker};

/// How long fetched rules stay valid
const ROBOTS_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone)]
struct CachedRobots {
    /// Raw robots.txt body; empty allows everything
    content: String,
    fetched_at: DateTime<Utc>,
}

impl CachedRobots {
    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now - self.fetched_at > Duration::hours(ROBOTS_TTL_HOURS)
    }
}

/// [`RobotsChecker`] that downloads `/robots.txt` over HTTP
pub struct HttpRobotsChecker {
    client: Client,
    /// Product token matched against `User-agent` lines
    agent: String,
    cache: Mutex<HashMap<String, CachedRobots>>,
}

impl HttpRobotsChecker {
    pub fn new(user_agent: &str, timeout: std::time::Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;

        Ok(Self {
            client,
            agent: product_token(user_agent),
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Number of origins with cached rules
    pub async fn cached_origins(&self) -> usize {
        self.cache.lock().await.len()
    }

    async fn rules_for(&self, origin: &str) -> String {
        let now = Utc::now();
        if let Some(cached) = self.cache.lock().await.get(origin) {
            if !cached.is_stale(now) {
                return cached.content.clone();
            }
        }

        let content = self.download(origin).await;
        self.cache.lock().await.insert(
            origin.to_string(),
            CachedRobots {
                content: content.clone(),
                fetched_at: now,
            },
        );
        content
    }

    async fn download(&self, origin: &str) -> String {
        let robots_url = format!("{origin}/robots.txt");
        match self.client.get(&robots_url).send().await {
            Ok(response) if response.status().is_success() => {
                response.text().await.unwrap_or_default()
            }
            Ok(response) => {
                tracing::debug!(url = %robots_url, status = response.status().as_u16(), "No robots.txt");
                String::new()
            }
            Err(e) => {
                tracing::debug!(url = %robots_url, error = %e, "Failed to fetch robots.txt");
                String::new()
            }
        }
    }
}

#[async_trait]
impl RobotsChecker for HttpRobotsChecker {
    async fn can_fetch(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return true;
        };
        let origin = parsed.origin().ascii_serialization();

        let content = self.rules_for(&origin).await;
        if content.trim().is_empty() {
            return true;
        }

        let mut matcher = DefaultMatcher::default();
        matcher.one_agent_allowed_by_robots(&content, &self.agent, url)
    }
}

/// `"fleetcrawl/0.1 (+https://...)"` → `"fleetcrawl"`
fn product_token(user_agent: &str) -> String {
    user_agent
        .split(|c: char| c == '/' || c.is_whitespace())
        .next()
        .filter(|token| !token.is_empty())
        .unwrap_or("*")
        .to_string()
}
