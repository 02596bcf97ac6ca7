//! Feed fetching: HTTP download plus RSS / Atom / JSON Feed parsing.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use feedforge_shared::{DiscoveredItem, FeedforgeError, Result, Source};
use reqwest::Client;
use tracing::debug;
use url::Url;

const USER_AGENT: &str = concat!("feedforge/", env!("CARGO_PKG_VERSION"));

/// Downloads one source and returns the entries it currently lists.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, source: &Source) -> Result<Vec<DiscoveredItem>>;
}

/// reqwest + feed-rs fetcher.
pub struct HttpFeedFetcher {
    client: Client,
    /// Allow localhost/private IPs (for tests against mock servers).
    allow_localhost: bool,
}

impl HttpFeedFetcher {
    /// `timeout` bounds the whole request; the scheduler applies its own
    /// per-fetch deadline on top.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(timeout)
            .build()
            .map_err(|e| FeedforgeError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            allow_localhost: false,
        })
    }

    /// Allow fetching from localhost/private IPs.
    pub fn allow_localhost(mut self) -> Self {
        self.allow_localhost = true;
        self
    }
}

#[async_trait]
impl FeedFetcher for HttpFeedFetcher {
    async fn fetch(&self, source: &Source) -> Result<Vec<DiscoveredItem>> {
        let url = Url::parse(&source.url)
            .map_err(|e| FeedforgeError::validation(format!("invalid feed URL: {e}")))?;
        if !self.allow_localhost && is_ssrf_target(&url) {
            return Err(FeedforgeError::validation(format!(
                "refusing to fetch private or non-http target {url}"
            )));
        }

        debug!(%url, "fetching feed");
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| FeedforgeError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FeedforgeError::Network(format!("{url}: HTTP {status}")));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FeedforgeError::Network(format!("{url}: {e}")))?;

        parse_feed(source, &bytes)
    }
}

/// Parse a feed document into items attributed to `source`.
pub fn parse_feed(source: &Source, bytes: &[u8]) -> Result<Vec<DiscoveredItem>> {
    let feed = feed_rs::parser::parse(bytes)
        .map_err(|e| FeedforgeError::parse(format!("{}: {e}", source.url)))?;

    let items = feed
        .entries
        .into_iter()
        .filter_map(|entry| {
            let link = entry
                .links
                .first()
                .map(|l| l.href.clone())
                .unwrap_or_default();
            let guid = if entry.id.trim().is_empty() {
                link.clone()
            } else {
                entry.id
            };
            if guid.is_empty() {
                return None;
            }

            let raw_content = entry
                .content
                .and_then(|c| c.body)
                .or_else(|| entry.summary.map(|s| s.content))
                .unwrap_or_default();

            Some(DiscoveredItem {
                guid,
                source_id: source.id.clone(),
                title: entry
                    .title
                    .map(|t| t.content)
                    .unwrap_or_else(|| "Untitled".to_string()),
                link,
                raw_content,
                published_at: entry.published.or(entry.updated),
                artifact_hash: None,
            })
        })
        .collect();

    Ok(items)
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            host == "localhost" || host.ends_with(".local") || host.ends_with(".internal")
        }
        None => true,
    }
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10
                || (a == 100 && (b & 0xC0) == 64)
                // 192.0.0.0/24
                || (a == 192 && b == 0 && c == 0)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local, fe80::/10 link local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use feedforge_shared::SourceId;

    use super::*;

    fn source(url: &str) -> Source {
        Source {
            id: SourceId::new(),
            url: url.into(),
            name: "test".into(),
            active: true,
            last_fetched_at: None,
            last_attempt_at: None,
            consecutive_failure_count: 0,
            min_fetch_interval_secs: 0,
            quality_score: 0.5,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn ssrf_blocks_private_and_local() {
        for raw in [
            "file:///etc/passwd",
            "http://127.0.0.1/feed",
            "http://10.0.0.5/feed",
            "http://192.168.1.1/feed",
            "http://169.254.169.254/latest",
            "http://localhost:8080/feed",
            "http://printer.local/feed",
            "http://[::1]/feed",
        ] {
            let url = Url::parse(raw).unwrap();
            assert!(is_ssrf_target(&url), "{raw} should be blocked");
        }
    }

    #[test]
    fn ssrf_allows_public() {
        let url = Url::parse("https://news.example.com/rss").unwrap();
        assert!(!is_ssrf_target(&url));
    }

    #[test]
    fn parses_rss_entries() {
        let rss = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>T</title>
  <item><guid>g-1</guid><title>One</title><link>https://e.com/1</link>
    <description>first body</description></item>
  <item><guid>g-2</guid><title>Two</title><link>https://e.com/2</link></item>
</channel></rss>"#;
        let s = source("https://e.com/rss");
        let items = parse_feed(&s, rss.as_bytes()).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].guid, "g-1");
        assert_eq!(items[0].title, "One");
        assert_eq!(items[0].link, "https://e.com/1");
        assert_eq!(items[0].raw_content, "first body");
        assert_eq!(items[0].source_id, s.id);
    }

    #[test]
    fn parses_atom_entries() {
        let atom = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atom</title><id>urn:feed</id><updated>2026-01-01T00:00:00Z</updated>
  <entry><id>urn:entry:1</id><title>Entry</title>
    <link href="https://e.com/a"/><updated>2026-01-02T00:00:00Z</updated>
    <summary>short</summary></entry>
</feed>"#;
        let items = parse_feed(&source("https://e.com/atom"), atom.as_bytes()).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].guid, "urn:entry:1");
        assert_eq!(items[0].raw_content, "short");
        assert!(items[0].published_at.is_some());
    }

    #[test]
    fn garbage_is_parse_error() {
        let err = parse_feed(&source("https://e.com/x"), b"<html>nope</html>").unwrap_err();
        assert!(matches!(err, FeedforgeError::Parse { .. }));
    }
}
