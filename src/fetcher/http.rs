//! reqwest-based fetcher with a global rate limit and link extraction

use async_trait::async_trait;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use reqwest::Client;
use scraper::{Html, Selector};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroU32;
use std::time::Duration;
use tokio::sync::Mutex;
use url::Url;

use super::{FetchError, FetchRequest, FetchResponse, Fetcher};
use crate::config::CrawlerConfig;

/// Schemes that never lead to a crawlable page
const SKIPPED_SCHEMES: &[&str] = &["javascript:", "mailto:", "tel:", "data:"];

/// HTTP fetcher shared by every task a worker runs
pub struct HttpFetcher {
    /// Client used for requests without a proxy
    client: Client,

    /// Clients built for individual proxies
    proxied: Mutex<HashMap<String, Client>>,

    /// Process-wide request rate limit
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,

    user_agent: String,
    timeout: Duration,
}

impl HttpFetcher {
    /// Create a fetcher from the crawler settings
    pub fn new(config: &CrawlerConfig) -> Result<Self, FetchError> {
        Self::with_settings(
            &config.user_agent,
            config.requests_per_second,
            config.request_timeout(),
        )
    }

    pub fn with_settings(
        user_agent: &str,
        requests_per_second: u32,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let client = Self::build_client(user_agent, timeout, None)?;

        let rate = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = RateLimiter::direct(Quota::per_second(rate));

        Ok(Self {
            client,
            proxied: Mutex::new(HashMap::new()),
            rate_limiter,
            user_agent: user_agent.to_string(),
            timeout,
        })
    }

    fn build_client(
        user_agent: &str,
        timeout: Duration,
        proxy: Option<&str>,
    ) -> Result<Client, FetchError> {
        let mut builder = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .gzip(true);

        if let Some(proxy) = proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| FetchError::Client(format!("invalid proxy {proxy}: {e}")))?;
            builder = builder.proxy(proxy);
        }

        builder
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))
    }

    async fn client_for(&self, proxy: Option<&str>) -> Result<Client, FetchError> {
        let Some(proxy) = proxy else {
            return Ok(self.client.clone());
        };

        let mut proxied = self.proxied.lock().await;
        if let Some(client) = proxied.get(proxy) {
            return Ok(client.clone());
        }
        let client = Self::build_client(&self.user_agent, self.timeout, Some(proxy))?;
        proxied.insert(proxy.to_string(), client.clone());
        Ok(client)
    }

    fn map_send_error(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.timeout.as_secs())
        } else {
            FetchError::Http(err)
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        let url = Url::parse(&request.url)
            .map_err(|e| FetchError::InvalidUrl(format!("{}: {e}", request.url)))?;

        self.rate_limiter.until_ready().await;

        let client = self.client_for(request.proxy.as_deref()).await?;
        let mut builder = client.get(url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|e| self.map_send_error(e))?;
        let status = response.status().as_u16();
        if status == 429 {
            return Err(FetchError::RateLimited);
        }
        if status >= 400 {
            return Err(FetchError::HttpStatus(status));
        }

        let base = response.url().clone();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let content = response.text().await.map_err(|e| self.map_send_error(e))?;
        let links = extract_links(&content, &base);

        tracing::debug!(url = %base, status, links = links.len(), "Fetched page");

        Ok(FetchResponse {
            status_code: status,
            content,
            links,
            headers,
        })
    }
}

// ============================================================================
// Link Extraction
// ============================================================================

/// Absolute http(s) links of a page, fragments stripped, first occurrence kept
pub fn extract_links(html: &str, base: &Url) -> Vec<String> {
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        if let Some(link) = resolve_link(href, base) {
            if seen.insert(link.clone()) {
                links.push(link);
            }
        }
    }

    links
}

/// Resolve `href` against the page URL
fn resolve_link(href: &str, base: &Url) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    let lower = href.to_lowercase();
    if SKIPPED_SCHEMES.iter().any(|scheme| lower.starts_with(scheme)) {
        return None;
    }

    let mut resolved = base.join(href).ok()?;
    if !matches!(resolved.scheme(), "http" | "https") {
        return None;
    }
    resolved.set_fragment(None);
    Some(resolved.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn base() -> Url {
        Url::parse("https://example.com/docs/index.html").unwrap()
    }

    #[test]
    fn test_extract_links_resolves_and_filters() {
        let html = r##"
            <a href="/about">About</a>
            <a href="guide.html#intro">Guide</a>
            <a href="https://other.org/x">Other</a>
            <a href="#top">Top</a>
            <a href="mailto:me@example.com">Mail</a>
            <a href="javascript:void(0)">JS</a>
            <a href="ftp://files.example.com/a">FTP</a>
            <a href="/about">About again</a>
        "##;

        let links = extract_links(html, &base());
        assert_eq!(
            links,
            vec![
                "https://example.com/about".to_string(),
                "https://example.com/docs/guide.html".to_string(),
                "https://other.org/x".to_string(),
            ]
        );
    }

    #[test]
    fn test_extract_links_empty_document() {
        assert!(extract_links("", &base()).is_empty());
        assert!(extract_links("<p>no links</p>", &base()).is_empty());
    }

    fn fetcher() -> HttpFetcher {
        HttpFetcher::with_settings("fleetcrawl-test/0.1", 100, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_success_extracts_links() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"<html><body><a href="/next">next</a></body></html>"#),
            )
            .mount(&server)
            .await;

        let response = fetcher()
            .fetch(FetchRequest::new(format!("{}/page", server.uri())))
            .await
            .unwrap();

        assert_eq!(response.status_code, 200);
        assert_eq!(response.links, vec![format!("{}/next", server.uri())]);
    }

    #[tokio::test]
    async fn test_fetch_sends_custom_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth"))
            .and(header("x-crawl-run", "42"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let request =
            FetchRequest::new(format!("{}/auth", server.uri())).with_header("x-crawl-run", "42");
        let response = fetcher().fetch(request).await.unwrap();
        assert_eq!(response.content, "ok");
    }

    #[tokio::test]
    async fn test_fetch_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/busy"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let fetcher = fetcher();
        let missing = fetcher
            .fetch(FetchRequest::new(format!("{}/missing", server.uri())))
            .await;
        assert!(matches!(missing, Err(FetchError::HttpStatus(404))));

        let busy = fetcher
            .fetch(FetchRequest::new(format!("{}/busy", server.uri())))
            .await;
        assert!(matches!(busy, Err(FetchError::RateLimited)));
    }

    #[tokio::test]
    async fn test_fetch_invalid_url() {
        let result = fetcher().fetch(FetchRequest::new("not a url")).await;
        assert!(matches!(result, Err(FetchError::InvalidUrl(_))));
    }
}
