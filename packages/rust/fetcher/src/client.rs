//! HTTP retrieval of a single source.
//!
//! One GET per locator with a bounded timeout. Failures come back as
//! [`PostDigestError::Fetch`]; there is no retry here, the next scheduled run
//! is the retry.

use std::time::Duration;

use reqwest::Client;
use tracing::{debug, instrument};

use postdigest_shared::{PostDigestError, Result, SourceLocator};

use crate::extract::{extract_blocks, parse_selector};

/// User-Agent string for source requests.
const USER_AGENT: &str = concat!("postdigest/", env!("CARGO_PKG_VERSION"));

/// Fetches a source page and extracts its post blocks.
pub struct HttpFetcher {
    client: Client,
    block_selector: String,
}

impl HttpFetcher {
    /// Create a fetcher with a per-request `timeout` and a CSS `block_selector`.
    pub fn new(timeout: Duration, block_selector: &str) -> Result<Self> {
        parse_selector(block_selector)?;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(timeout)
            .build()
            .map_err(|e| PostDigestError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            block_selector: block_selector.to_string(),
        })
    }

    /// Retrieve `locator` and return its non-empty text blocks in page order.
    #[instrument(skip_all, fields(source = %locator))]
    pub async fn fetch(&self, locator: &SourceLocator) -> Result<Vec<String>> {
        let response = self
            .client
            .get(locator.as_str())
            .send()
            .await
            .map_err(|e| PostDigestError::fetch(locator.as_str(), describe(&e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PostDigestError::fetch(
                locator.as_str(),
                format!("HTTP {status}"),
            ));
        }

        let body = response.text().await.map_err(|e| {
            PostDigestError::fetch(locator.as_str(), format!("body read failed: {}", describe(&e)))
        })?;

        let selector = parse_selector(&self.block_selector)?;
        let blocks = extract_blocks(&body, &selector);
        debug!(blocks = blocks.len(), bytes = body.len(), "source fetched");
        Ok(blocks)
    }
}

fn describe(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("timed out: {e}")
    } else {
        e.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SELECTOR: &str = "div.tgme_widget_message_text";

    fn locator(server: &MockServer, p: &str) -> SourceLocator {
        SourceLocator::parse(&format!("{}{p}", server.uri())).unwrap()
    }

    #[tokio::test]
    async fn fetches_and_extracts_blocks() {
        let server = MockServer::start().await;
        let page = r#"<html><body>
            <div class="tgme_widget_message_text">Junior Rust developer, Pune</div>
            <div class="tgme_widget_message_text">QA intern, remote</div>
        </body></html>"#;

        Mock::given(method("GET"))
            .and(path("/s/jobs"))
            .respond_with(ResponseTemplate::new(200).set_body_string(page))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(Duration::from_secs(5), SELECTOR).unwrap();
        let blocks = fetcher.fetch(&locator(&server, "/s/jobs")).await.unwrap();
        assert_eq!(blocks, vec!["Junior Rust developer, Pune", "QA intern, remote"]);
    }

    #[tokio::test]
    async fn non_success_status_is_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(Duration::from_secs(5), SELECTOR).unwrap();
        let err = fetcher.fetch(&locator(&server, "/s/down")).await.unwrap_err();
        assert!(matches!(err, PostDigestError::Fetch { .. }));
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn slow_source_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<div class=\"tgme_widget_message_text\">late</div>")
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(Duration::from_millis(200), SELECTOR).unwrap();
        let err = fetcher.fetch(&locator(&server, "/s/slow")).await.unwrap_err();
        assert!(matches!(err, PostDigestError::Fetch { .. }));
    }

    #[tokio::test]
    async fn unreachable_source_is_fetch_error() {
        let fetcher = HttpFetcher::new(Duration::from_secs(2), SELECTOR).unwrap();
        // Port 9 (discard) on loopback is reliably closed in test environments
        let loc = SourceLocator::parse("http://127.0.0.1:9/s/none").unwrap();
        let err = fetcher.fetch(&loc).await.unwrap_err();
        assert!(matches!(err, PostDigestError::Fetch { .. }));
    }

    #[test]
    fn invalid_selector_fails_construction() {
        assert!(HttpFetcher::new(Duration::from_secs(1), "div[").is_err());
    }
}
