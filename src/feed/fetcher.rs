use crate::archive::{encode_items, DeltaLayout};
use crate::feed::parser::{parse_feed, ParseResult};
use crate::feed::subscribers::FeedSource;
use crate::util::{validate_url, write_atomic};
use futures::stream::{self, StreamExt};
use reqwest::redirect::Policy;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Errors that can occur while refreshing one feed.
///
/// These cover the full lifecycle of a fetch: network issues, HTTP errors,
/// parsing failures, and writing the delta file.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Feed could not be parsed as RSS, Atom or JSON Feed
    #[error("Parse error: {0}")]
    Parse(String),
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// Items could not be encoded for the delta file
    #[error("Failed to encode delta: {0}")]
    Encode(#[from] csv::Error),
    /// Delta tree could not be prepared or written
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Knobs of a fetch run.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Feeds fetched simultaneously.
    pub concurrency: usize,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Retries after 429, 5xx or a truncated body.
    pub max_retries: u32,
    /// First backoff delay; doubled on every retry.
    pub backoff_unit: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            timeout: Duration::from_secs(15),
            max_retries: 3,
            backoff_unit: Duration::from_secs(1),
        }
    }
}

impl FetchOptions {
    fn backoff(&self, retry: u32) -> Duration {
        self.backoff_unit.saturating_mul(2u32.saturating_pow(retry))
    }
}

/// HTTP client used for feed downloads.
///
/// Follows at most 3 redirects, refuses loops and refuses redirects to
/// loopback or private addresses.
pub fn build_client(options: &FetchOptions) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(redirect_policy())
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .pool_max_idle_per_host(4)
        .pool_idle_timeout(Duration::from_secs(30))
        .timeout(options.timeout)
        .build()
}

fn redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= 3 {
            return attempt.error("Too many redirects (max 3)");
        }

        let url = attempt.url();
        if attempt.previous().iter().any(|prev| prev.as_str() == url.as_str()) {
            return attempt.error("Redirect loop detected");
        }
        if let Err(e) = validate_url(url.as_str()) {
            return attempt.error(e);
        }

        tracing::debug!(
            from = %attempt.previous().last().map(|u| u.as_str()).unwrap_or("initial"),
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );

        attempt.follow()
    })
}

/// Result of a single feed fetch operation.
///
/// Contains the source id for correlation and either the number of items
/// written to the delta file or the error that occurred.
#[derive(Debug)]
pub struct FetchResult {
    pub source_id: String,
    pub url: String,
    pub result: Result<usize, FetchError>,
}

/// Clears the per-cycle delta root so stale deltas never get merged twice.
pub fn prepare_delta_root(deltas: &DeltaLayout) -> Result<(), FetchError> {
    let root = deltas.sources_root();
    match std::fs::remove_dir_all(&root) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(source) => return Err(FetchError::Io { path: root, source }),
    }
    std::fs::create_dir_all(&root).map_err(|source| FetchError::Io { path: root, source })
}

/// Refreshes all sources concurrently into per-source delta files.
///
/// Clears the delta root first, then fetches every source on a bounded pool.
/// A failing source is logged and reported in its [`FetchResult`]; it never
/// affects the others. Results are returned in completion order.
///
/// # Errors
///
/// Only a failure to prepare the delta root is returned as an error.
pub async fn refresh_all(
    client: &reqwest::Client,
    sources: &[FeedSource],
    deltas: &DeltaLayout,
    options: &FetchOptions,
) -> Result<Vec<FetchResult>, FetchError> {
    prepare_delta_root(deltas)?;
    if sources.is_empty() {
        return Ok(Vec::new());
    }

    let results: Vec<FetchResult> = stream::iter(sources)
        .map(|source| refresh_one(client, source, deltas, options))
        .buffer_unordered(options.concurrency.max(1))
        .collect()
        .await;

    let failed = results.iter().filter(|r| r.result.is_err()).count();
    let items: usize = results
        .iter()
        .filter_map(|r| r.result.as_ref().ok())
        .sum();
    tracing::info!(
        sources = results.len(),
        failed = failed,
        items = items,
        "Fetch complete"
    );

    Ok(results)
}

/// Fetches, parses and writes the delta of a single source.
///
/// A source yielding zero items writes no delta file.
///
/// # Errors
///
/// The returned `FetchResult.result` may contain:
/// - [`FetchError::Network`] - Connection or TLS errors
/// - [`FetchError::Timeout`] - Request exceeded the configured timeout
/// - [`FetchError::HttpStatus`] - Non-2xx HTTP response
/// - [`FetchError::RateLimited`] - 429 response after max retries
/// - [`FetchError::ResponseTooLarge`] - Response exceeded 10MB
/// - [`FetchError::Parse`] - Invalid feed document
/// - [`FetchError::Io`] - Delta file could not be written
pub async fn refresh_one(
    client: &reqwest::Client,
    source: &FeedSource,
    deltas: &DeltaLayout,
    options: &FetchOptions,
) -> FetchResult {
    let result = fetch_one(client, source, deltas, options).await;
    if let Err(e) = &result {
        tracing::warn!(feed = %source.url, error = %e, "Feed refresh failed");
    }
    FetchResult {
        source_id: source.id.clone(),
        url: source.url.clone(),
        result,
    }
}

async fn fetch_one(
    client: &reqwest::Client,
    source: &FeedSource,
    deltas: &DeltaLayout,
    options: &FetchOptions,
) -> Result<usize, FetchError> {
    let bytes = download(client, &source.url, options).await?;

    let ParseResult { items, skipped } =
        parse_feed(&bytes, source).map_err(|e| FetchError::Parse(e.to_string()))?;

    if skipped > 0 {
        tracing::warn!(
            feed = %source.url,
            skipped = skipped,
            "Entries without a date or with invalid fields skipped"
        );
    }

    if items.is_empty() {
        tracing::info!(feed = %source.url, "Feed yielded no items, no delta written");
        return Ok(0);
    }

    let path = deltas.source_delta(&source.id);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| FetchError::Io {
            path: dir.to_path_buf(),
            source: e,
        })?;
    }
    let encoded = encode_items(&items)?;
    write_atomic(&path, &encoded).map_err(|e| FetchError::Io {
        path: path.clone(),
        source: e,
    })?;

    tracing::debug!(feed = %source.url, items = items.len(), delta = %path.display(), "Delta written");
    Ok(items.len())
}

pub(super) async fn download(
    client: &reqwest::Client,
    url: &str,
    options: &FetchOptions,
) -> Result<Vec<u8>, FetchError> {
    let mut retry_count = 0;

    loop {
        let response = tokio::time::timeout(options.timeout, client.get(url).send())
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(FetchError::Network)?;

        // Rate limiting: exponential backoff
        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            if retry_count >= options.max_retries {
                return Err(FetchError::RateLimited(options.max_retries));
            }

            let delay = options.backoff(retry_count);
            tracing::warn!(
                feed = %url,
                retry = retry_count,
                delay_ms = delay.as_millis() as u64,
                "Rate limited, backing off"
            );

            tokio::time::sleep(delay).await;
            retry_count += 1;
            continue;
        }

        // Server errors (5xx): exponential backoff
        if response.status().is_server_error() {
            if retry_count >= options.max_retries {
                return Err(FetchError::HttpStatus(response.status().as_u16()));
            }

            let delay = options.backoff(retry_count);
            tracing::warn!(
                feed = %url,
                status = %response.status(),
                retry = retry_count,
                delay_ms = delay.as_millis() as u64,
                "Server error, retrying after delay"
            );

            tokio::time::sleep(delay).await;
            retry_count += 1;
            continue;
        }

        // 4xx errors fail immediately
        if !response.status().is_success() {
            return Err(FetchError::HttpStatus(response.status().as_u16()));
        }

        match read_limited_bytes(response, MAX_FEED_SIZE).await {
            Ok(bytes) => return Ok(bytes),
            Err(FetchError::IncompleteResponse { expected, received }) => {
                if retry_count >= options.max_retries {
                    return Err(FetchError::IncompleteResponse { expected, received });
                }

                let delay = options.backoff(retry_count);
                tracing::debug!(
                    feed = %url,
                    expected = expected,
                    received = received,
                    attempt = retry_count + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying incomplete download"
                );

                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Capture Content-Length for completeness check
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    // Fewer bytes than Content-Length means the connection dropped mid-body
    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{decode_items, source_id};
    use std::path::Path;
    use wiremock::matchers::{any, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Test Blog</title>
    <link>https://test.example/</link>
    <item>
        <title>First</title>
        <link>https://test.example/first</link>
        <pubDate>Tue, 02 Jan 2024 10:00:00 +0000</pubDate>
    </item>
</channel></rss>"#;

    fn fast_options() -> FetchOptions {
        FetchOptions {
            backoff_unit: Duration::from_millis(1),
            ..FetchOptions::default()
        }
    }

    fn source_for(url: String) -> FeedSource {
        FeedSource {
            id: source_id(&url),
            url,
            author: None,
        }
    }

    #[tokio::test]
    async fn test_refresh_writes_delta() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .insert_header("Content-Type", "application/xml"),
            )
            .mount(&mock_server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let deltas = DeltaLayout::new(dir.path());
        let source = source_for(format!("{}/feed", mock_server.uri()));

        let result = refresh_one(&reqwest::Client::new(), &source, &deltas, &fast_options()).await;
        assert_eq!(result.result.unwrap(), 1);

        let file = std::fs::File::open(deltas.source_delta(&source.id)).unwrap();
        let decoded = decode_items(file, Path::new("new.csv")).unwrap();
        assert_eq!(decoded.items.len(), 1);
        assert_eq!(decoded.items[0].author, "Test Blog");
        assert_eq!(decoded.items[0].source, source.url);
    }

    #[tokio::test]
    async fn test_refresh_404_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let deltas = DeltaLayout::new(dir.path());
        let source = source_for(format!("{}/feed", mock_server.uri()));

        let result = refresh_one(&reqwest::Client::new(), &source, &deltas, &fast_options()).await;
        match result.result.unwrap_err() {
            FetchError::HttpStatus(404) => {}
            e => panic!("Expected HttpStatus(404), got {:?}", e),
        }
        assert!(!deltas.source_delta(&source.id).exists());
    }

    #[tokio::test]
    async fn test_refresh_500_error_retries_then_fails() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(4) // Initial request + 3 retries
            .mount(&mock_server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let deltas = DeltaLayout::new(dir.path());
        let source = source_for(format!("{}/feed", mock_server.uri()));

        let result = refresh_one(&reqwest::Client::new(), &source, &deltas, &fast_options()).await;
        match result.result.unwrap_err() {
            FetchError::HttpStatus(500) => {}
            e => panic!("Expected HttpStatus(500), got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_refresh_503_retry_then_success() {
        let mock_server = MockServer::start().await;

        // First two requests return 503, third succeeds
        Mock::given(any())
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&mock_server)
            .await;

        Mock::given(any())
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .insert_header("Content-Type", "application/xml"),
            )
            .mount(&mock_server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let deltas = DeltaLayout::new(dir.path());
        let source = source_for(format!("{}/feed", mock_server.uri()));

        let result = refresh_one(&reqwest::Client::new(), &source, &deltas, &fast_options()).await;
        assert_eq!(result.result.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_after_retries() {
        let mock_server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(429))
            .expect(4)
            .mount(&mock_server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let deltas = DeltaLayout::new(dir.path());
        let source = source_for(format!("{}/feed", mock_server.uri()));

        let result = refresh_one(&reqwest::Client::new(), &source, &deltas, &fast_options()).await;
        assert!(matches!(result.result, Err(FetchError::RateLimited(3))));
    }

    #[tokio::test]
    async fn test_malformed_feed_parse_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<not valid xml"))
            .mount(&mock_server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let deltas = DeltaLayout::new(dir.path());
        let source = source_for(format!("{}/feed", mock_server.uri()));

        let result = refresh_one(&reqwest::Client::new(), &source, &deltas, &fast_options()).await;
        match result.result.unwrap_err() {
            FetchError::Parse(_) => {}
            e => panic!("Expected Parse error, got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_empty_feed_writes_no_delta() {
        let empty_rss = r#"<?xml version="1.0"?>
<rss version="2.0"><channel></channel></rss>"#;

        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(empty_rss))
            .mount(&mock_server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let deltas = DeltaLayout::new(dir.path());
        let source = source_for(format!("{}/feed", mock_server.uri()));

        let result = refresh_one(&reqwest::Client::new(), &source, &deltas, &fast_options()).await;
        assert_eq!(result.result.unwrap(), 0);
        assert!(!deltas.source_delta(&source.id).exists());
    }

    #[tokio::test]
    async fn test_refresh_all_isolates_failures_and_clears_root() {
        let mock_server = MockServer::start().await;
        Mock::given(path("/good"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .mount(&mock_server)
            .await;
        Mock::given(path("/bad"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let deltas = DeltaLayout::new(dir.path());
        let stale = deltas.source_delta(&source_id("https://stale.example/feed"));
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, "title\n").unwrap();

        let good = source_for(format!("{}/good", mock_server.uri()));
        let bad = source_for(format!("{}/bad", mock_server.uri()));
        let results = refresh_all(
            &reqwest::Client::new(),
            &[good.clone(), bad.clone()],
            &deltas,
            &fast_options(),
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 2);
        for r in &results {
            if r.source_id == good.id {
                assert_eq!(r.result.as_ref().unwrap(), &1);
            } else {
                assert!(r.result.is_err());
            }
        }
        assert!(!stale.exists());
        assert_eq!(deltas.list_sources(), vec![good.id]);
    }
}
