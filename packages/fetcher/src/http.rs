//! HTTP fetcher.
//!
//! Streams the response body to `<data_dir>/fetched/<feed_id>/<uuid>` so
//! arbitrarily large sources never sit in memory. Sends `If-None-Match` /
//! `If-Modified-Since` from the validators cached for the previous
//! download of the same URL; a `304 Not Modified` answer becomes
//! [`FetchError::EmptyFeed`]. Failures are returned as-is and never
//! retried here. Downloads are removed once the run is over; the cached
//! validators outlive them.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use feeds_database::CachedHeaders;
use feeds_database::paths::{ensure_dir, feed_fetched_dir};
use feeds_feed_models::Feed;
use feeds_feed_models::fetched::FetcherResult;
use feeds_feed_models::state::State;
use futures::StreamExt as _;
use reqwest::StatusCode;
use reqwest::header::{
    ETAG, HeaderMap, HeaderName, HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
};
use serde::Deserialize;
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncWriteExt as _;

use crate::{FetchError, Fetcher, FetcherServices, complete_single};

/// Longest upstream error body carried into [`FetchError::Status`].
const MAX_ERROR_BODY: usize = 512;

/// Settings of the `http` fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Ignore cached validators and always download the full body.
    pub always_download: bool,
    /// Request timeout in seconds.
    pub request_timeout: u64,
    /// Extra request headers.
    pub headers: BTreeMap<String, String>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            always_download: false,
            request_timeout: 30,
            headers: BTreeMap::new(),
        }
    }
}

/// Downloads a feed's source URL.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    settings: HttpSettings,
    services: FetcherServices,
}

impl HttpFetcher {
    /// Creates an HTTP fetcher.
    #[must_use]
    pub const fn new(settings: HttpSettings, services: FetcherServices) -> Self {
        Self { settings, services }
    }

    /// Builds the request headers: configured headers, then per-feed
    /// overrides from `feed.config.headers`, then cached validators.
    fn request_headers(
        &self,
        feed: &Feed,
        cached: Option<&CachedHeaders>,
    ) -> Result<HeaderMap, FetchError> {
        let mut header_map = HeaderMap::new();
        let overrides = feed
            .config
            .get("headers")
            .and_then(serde_json::Value::as_object)
            .into_iter()
            .flatten()
            .filter_map(|(k, v)| v.as_str().map(|v| (k.as_str(), v)));

        for (key, value) in self
            .settings
            .headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .chain(overrides)
        {
            let name =
                HeaderName::from_bytes(key.as_bytes()).map_err(|e| FetchError::InvalidSource {
                    locator: feed.source.clone(),
                    message: format!("invalid header name '{key}': {e}"),
                })?;
            let val = HeaderValue::from_str(value).map_err(|e| FetchError::InvalidSource {
                locator: feed.source.clone(),
                message: format!("invalid header value '{value}': {e}"),
            })?;
            header_map.insert(name, val);
        }

        if let Some(cached) = cached {
            if let Some(etag) = cached.etag.as_deref().and_then(|v| HeaderValue::from_str(v).ok())
            {
                header_map.insert(IF_NONE_MATCH, etag);
            }
            if let Some(modified) = cached
                .last_modified
                .as_deref()
                .and_then(|v| HeaderValue::from_str(v).ok())
            {
                header_map.insert(IF_MODIFIED_SINCE, modified);
            }
        }

        Ok(header_map)
    }
}

/// Returns the header cache key for a feed and URL.
#[must_use]
pub fn cache_key(feed: &Feed, url: &str) -> String {
    format!("{}:{}", feed.id, hex::encode(Sha256::digest(url.as_bytes())))
}

fn header_string(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

async fn stream_to_file(response: reqwest::Response, dest: &Path) -> Result<u64, FetchError> {
    let mut file = tokio::fs::File::create(dest).await?;
    let mut stream = response.bytes_stream();
    let mut downloaded: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
    }

    file.flush().await?;
    Ok(downloaded)
}

#[async_trait]
impl Fetcher for HttpFetcher {
    fn id(&self) -> &'static str {
        "http"
    }

    async fn fetch(&self, feed: &Feed, state: &mut State) -> Result<FetcherResult, FetchError> {
        let url = feed.source.as_str();
        let key = cache_key(feed, url);
        let cached = if self.settings.always_download {
            None
        } else {
            self.services.headers.load_headers(&key)?
        };

        let response = self
            .services
            .client
            .get(url)
            .headers(self.request_headers(feed, cached.as_ref())?)
            .timeout(Duration::from_secs(self.settings.request_timeout))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            log::info!("Feed {}: {url} not modified", feed.id);
            complete_single(state, self.services.clock.as_ref());
            return Err(FetchError::EmptyFeed);
        }
        if !status.is_success() {
            let reason = status.canonical_reason().unwrap_or("").to_owned();
            let body = response.text().await.unwrap_or_default();
            let body = body.trim();
            let message = if body.is_empty() {
                reason
            } else {
                body.chars().take(MAX_ERROR_BODY).collect()
            };
            return Err(FetchError::Status {
                url: url.to_owned(),
                status: status.as_u16(),
                message,
            });
        }

        let validators = CachedHeaders {
            etag: header_string(response.headers(), &ETAG),
            last_modified: header_string(response.headers(), &LAST_MODIFIED),
        };

        let dir = feed_fetched_dir(&self.services.data_dir, feed.id);
        ensure_dir(&dir)?;
        let dest = dir.join(uuid::Uuid::new_v4().to_string());
        let downloaded = stream_to_file(response, &dest).await?;

        if downloaded == 0 {
            log::info!("Feed {}: {url} returned an empty body", feed.id);
            tokio::fs::remove_file(&dest).await?;
            complete_single(state, self.services.clock.as_ref());
            return Err(FetchError::EmptyFeed);
        }

        if !validators.is_empty() {
            self.services
                .headers
                .save_headers(&key, feed.id, &validators)?;
        }

        log::info!(
            "Feed {}: downloaded {downloaded} bytes from {url} to {}",
            feed.id,
            dest.display()
        );
        complete_single(state, self.services.clock.as_ref());
        Ok(FetcherResult::file(dest))
    }

    async fn cleanup(&self, feed: &Feed) -> Result<(), FetchError> {
        // Validators stay cached so the next run can ask for changes only.
        let dir = feed_fetched_dir(&self.services.data_dir, feed.id);
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir).await?;
            log::debug!("Feed {}: removed downloads in {}", feed.id, dir.display());
        }
        Ok(())
    }

    async fn clear(&self, feed: &Feed) -> Result<(), FetchError> {
        self.services.headers.delete_headers_for_feed(feed.id)?;
        let dir = feed_fetched_dir(&self.services.data_dir, feed.id);
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir).await?;
            log::debug!("Feed {}: removed {}", feed.id, dir.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use chrono::DateTime;
    use feeds_database::memory::MemoryStore;
    use feeds_database::HeaderCache as _;
    use feeds_feed_models::{FeedId, NewFeed};
    use feeds_time::ManualClock;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    use super::*;

    /// Serves the canned `responses` one connection each and records the
    /// raw request heads.
    async fn serve(responses: Vec<String>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        tokio::spawn(async move {
            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                    if request.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                seen.lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(&request).to_ascii_lowercase());
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
        });
        (format!("http://{addr}/feed.csv"), requests)
    }

    fn ok(body: &str, extra: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n{extra}\r\n{body}",
            body.len()
        )
    }

    fn fetcher(settings: HttpSettings, data_dir: &Path) -> (HttpFetcher, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let services = FetcherServices {
            client: reqwest::Client::builder().no_proxy().build().unwrap(),
            headers: store.clone(),
            clock: Arc::new(ManualClock::new(
                DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            )),
            data_dir: data_dir.to_path_buf(),
        };
        (HttpFetcher::new(settings, services), store)
    }

    fn feed(url: &str) -> Feed {
        NewFeed::new("articles", "Articles", url)
            .into_feed(FeedId(3), DateTime::from_timestamp(0, 0).unwrap())
    }

    #[tokio::test]
    async fn downloads_body_to_feed_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let (url, _) = serve(vec![ok("id,title\n1,Alpha\n", "ETag: \"v1\"\r\n")]).await;
        let (fetcher, store) = fetcher(HttpSettings::default(), tmp.path());
        let feed = feed(&url);

        let mut state = State::default();
        let result = fetcher.fetch(&feed, &mut state).await.unwrap();

        let path = result.path().unwrap();
        assert!(path.starts_with(tmp.path().join("fetched").join("3")));
        assert_eq!(&*result.bytes().unwrap(), b"id,title\n1,Alpha\n");
        assert!(state.completed);
        assert_eq!(
            store.load_headers(&cache_key(&feed, &url)).unwrap(),
            Some(CachedHeaders {
                etag: Some("\"v1\"".to_string()),
                last_modified: None,
            })
        );
    }

    #[tokio::test]
    async fn not_modified_is_an_empty_feed() {
        let tmp = tempfile::tempdir().unwrap();
        let (url, requests) = serve(vec![
            ok("a\n", "ETag: \"v1\"\r\nLast-Modified: Tue, 01 Oct 2024 00:00:00 GMT\r\n"),
            "HTTP/1.1 304 Not Modified\r\nConnection: close\r\n\r\n".to_string(),
        ])
        .await;
        let (fetcher, _) = fetcher(HttpSettings::default(), tmp.path());
        let feed = feed(&url);

        fetcher.fetch(&feed, &mut State::default()).await.unwrap();
        let mut state = State::default();
        let err = fetcher.fetch(&feed, &mut state).await.unwrap_err();

        assert!(matches!(err, FetchError::EmptyFeed));
        assert!(state.completed);
        let requests = requests.lock().unwrap();
        assert!(!requests[0].contains("if-none-match"));
        assert!(requests[1].contains("if-none-match: \"v1\""));
        assert!(requests[1].contains("if-modified-since: tue, 01 oct 2024"));
    }

    #[tokio::test]
    async fn always_download_skips_validators() {
        let tmp = tempfile::tempdir().unwrap();
        let (url, requests) = serve(vec![
            ok("a\n", "ETag: \"v1\"\r\n"),
            ok("a\n", "ETag: \"v1\"\r\n"),
        ])
        .await;
        let settings = HttpSettings {
            always_download: true,
            ..HttpSettings::default()
        };
        let (fetcher, _) = fetcher(settings, tmp.path());
        let feed = feed(&url);

        fetcher.fetch(&feed, &mut State::default()).await.unwrap();
        fetcher.fetch(&feed, &mut State::default()).await.unwrap();
        assert!(!requests.lock().unwrap()[1].contains("if-none-match"));
    }

    #[tokio::test]
    async fn error_status_carries_upstream_message() {
        let tmp = tempfile::tempdir().unwrap();
        let body = "upstream exploded";
        let (url, _) = serve(vec![format!(
            "HTTP/1.1 500 Internal Server Error\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )])
        .await;
        let (fetcher, _) = fetcher(HttpSettings::default(), tmp.path());

        let err = fetcher
            .fetch(&feed(&url), &mut State::default())
            .await
            .unwrap_err();
        match err {
            FetchError::Status {
                status, message, ..
            } => {
                assert_eq!(status, 500);
                assert_eq!(message, "upstream exploded");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn sends_configured_and_per_feed_headers() {
        let tmp = tempfile::tempdir().unwrap();
        let (url, requests) = serve(vec![ok("a\n", "")]).await;
        let mut settings = HttpSettings::default();
        settings
            .headers
            .insert("X-Api-Key".to_string(), "secret".to_string());
        let (fetcher, _) = fetcher(settings, tmp.path());
        let mut feed = feed(&url);
        feed.config.insert(
            "headers".to_string(),
            serde_json::json!({"X-Tenant": "unl"}),
        );

        fetcher.fetch(&feed, &mut State::default()).await.unwrap();
        let request = requests.lock().unwrap()[0].clone();
        assert!(request.contains("x-api-key: secret"));
        assert!(request.contains("x-tenant: unl"));
    }

    #[tokio::test]
    async fn clear_removes_downloads_and_validators() {
        let tmp = tempfile::tempdir().unwrap();
        let (url, _) = serve(vec![ok("a\n", "ETag: \"v1\"\r\n")]).await;
        let (fetcher, store) = fetcher(HttpSettings::default(), tmp.path());
        let feed = feed(&url);

        let result = fetcher.fetch(&feed, &mut State::default()).await.unwrap();
        fetcher.clear(&feed).await.unwrap();

        assert!(!result.path().unwrap().exists());
        assert_eq!(store.load_headers(&cache_key(&feed, &url)).unwrap(), None);
    }

    #[tokio::test]
    async fn cleanup_removes_downloads_but_keeps_validators() {
        let tmp = tempfile::tempdir().unwrap();
        let (url, _) = serve(vec![ok("a\n", "ETag: \"v1\"\r\n")]).await;
        let (fetcher, store) = fetcher(HttpSettings::default(), tmp.path());
        let feed = feed(&url);

        let result = fetcher.fetch(&feed, &mut State::default()).await.unwrap();
        fetcher.cleanup(&feed).await.unwrap();
        // A second cleanup finds nothing left to remove.
        fetcher.cleanup(&feed).await.unwrap();

        assert!(!result.path().unwrap().exists());
        assert!(!feed_fetched_dir(tmp.path(), feed.id).exists());
        assert!(store.load_headers(&cache_key(&feed, &url)).unwrap().is_some());
    }
}
