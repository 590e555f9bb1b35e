//! URL normalization and classification for frontier admission

use url::Url;

/// Path markers of pages worth exploring in depth
const DEEP_INDICATORS: &[&str] = &["archive", "detail", "full"];

/// Path segments a query URL needs before it counts as deep
const DEEP_MIN_SEGMENTS: usize = 4;

/// Canonical form used for the visited set.
///
/// Only http(s) URLs with a host are admitted. The fragment, an empty query
/// and the default port are dropped; scheme and host are lowercased.
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }

    url.set_fragment(None);
    if url.query() == Some("") {
        url.set_query(None);
    }
    Some(url.to_string())
}

/// Case-insensitive substring match against any of `patterns`
pub fn matches_any(url: &str, patterns: &[String]) -> bool {
    high_value_score(url, patterns) > 0
}

/// Number of `patterns` found in `url`, ignoring case
pub fn high_value_score(url: &str, patterns: &[String]) -> usize {
    let lower = url.to_lowercase();
    patterns
        .iter()
        .filter(|p| !p.is_empty())
        .filter(|p| lower.contains(&p.to_lowercase()))
        .count()
}

/// Links that lead into archives, detail pages or long parameterized paths
pub fn is_deep_exploration(url: &str) -> bool {
    let lower = url.to_lowercase();
    if DEEP_INDICATORS.iter().any(|marker| lower.contains(marker)) {
        return true;
    }

    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let has_query = parsed.query().is_some_and(|q| !q.is_empty());
    let segments = parsed
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).count())
        .unwrap_or(0);

    has_query && segments >= DEEP_MIN_SEGMENTS
}
