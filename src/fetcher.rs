use std::{
    borrow::Cow,
    collections::HashMap,
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::{header::CONTENT_TYPE, Client};

use crate::error::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Text(String),
    Binary(Bytes),
}

impl Body {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes.as_ref(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Page {
    pub url: String,
    pub content_type: Option<String>,
    pub body: Body,
}

impl Page {
    /// The body as markup, decoding undeclared content as lossy UTF-8.
    pub fn html(&self) -> Cow<'_, str> {
        match &self.body {
            Body::Text(text) => Cow::Borrowed(text),
            Body::Binary(bytes) => String::from_utf8_lossy(bytes),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetcherOptions {
    pub user_agent: Option<String>,
    pub timeout: Duration,
    pub max_attempts: u32,
}

impl Default for FetcherOptions {
    fn default() -> Self {
        Self {
            user_agent: None,
            timeout: Duration::from_secs(15),
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Default)]
struct FetchLog {
    downloads: usize,
    errors: HashMap<String, String>,
}

/// Shared HTTP getter.
///
/// Counts successful downloads and keeps the URLs that failed all attempts
/// until they are drained with [`Fetcher::take_errors`].
pub struct Fetcher {
    http_client: Client,
    timeout: Duration,
    max_attempts: u32,
    log: Mutex<FetchLog>,
}

impl Fetcher {
    pub fn new(options: FetcherOptions) -> Result<Self, Error> {
        let FetcherOptions {
            user_agent,
            timeout,
            max_attempts,
        } = options;
        let user_agent = user_agent.as_deref().unwrap_or(crate::APP_USER_AGENT);
        tracing::debug!(user_agent, ?timeout, max_attempts, "configuring fetcher");
        let http_client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .brotli(true)
            .gzip(true)
            .build()?;
        Ok(Self {
            http_client,
            timeout,
            max_attempts: max_attempts.max(1),
            log: Mutex::new(FetchLog::default()),
        })
    }

    /// Downloads `url`, retrying transport failures.
    ///
    /// HTTP error statuses are not failures: the body is returned as any other page.
    pub async fn fetch(&self, url: &str) -> Result<Page, Error> {
        let mut last_error = String::from("no attempt made");
        for attempt in 1..=self.max_attempts {
            match self.try_fetch(url).await {
                Ok(page) => {
                    self.log.lock().downloads += 1;
                    return Ok(page);
                }
                Err(err) => {
                    let retryable = is_retryable(&err);
                    last_error = describe(&err);
                    tracing::error!(url, attempt, "{}", last_error);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        self.log
            .lock()
            .errors
            .insert(url.to_string(), last_error.clone());
        Err(Error::Fetch {
            url: url.to_string(),
            reason: last_error,
        })
    }

    async fn try_fetch(&self, url: &str) -> Result<Page, reqwest::Error> {
        let response = self
            .http_client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await?;
        tracing::trace!(url, "response status: {}", response.status());
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = match &content_type {
            Some(content_type) if content_type.contains("text/html") => {
                Body::Text(response.text().await?)
            }
            _ => Body::Binary(response.bytes().await?),
        };
        Ok(Page {
            url: url.to_string(),
            content_type,
            body,
        })
    }

    /// Number of successful downloads, repeated URLs included.
    pub fn downloaded_count(&self) -> usize {
        self.log.lock().downloads
    }

    /// Drains the URLs that failed since the last call.
    pub fn take_errors(&self) -> HashMap<String, String> {
        std::mem::take(&mut self.log.lock().errors)
    }
}

fn is_retryable(err: &reqwest::Error) -> bool {
    !err.is_builder() && (err.is_connect() || err.is_timeout() || err.is_request() || err.is_body())
}

fn describe(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = std::error::Error::source(cause);
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
    use tokio::net::TcpListener;

    async fn start_test_server() -> String {
        let app = Router::new()
            .route(
                "/page",
                get(|| async {
                    (
                        [("content-type", "text/html; charset=utf-8")],
                        "<html><body>hello</body></html>",
                    )
                }),
            )
            .route(
                "/logo.png",
                get(|| async { ([("content-type", "image/png")], vec![0x89u8, 0x50, 0x4e, 0x47]) }),
            )
            .route(
                "/missing",
                get(|| async { (StatusCode::NOT_FOUND, [("content-type", "text/html")], "gone") }),
            )
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late".into_response()
                }),
            );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        format!("http://{}", addr)
    }

    fn fetcher(timeout: Duration, max_attempts: u32) -> Fetcher {
        Fetcher::new(FetcherOptions {
            user_agent: None,
            timeout,
            max_attempts,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn html_is_decoded_as_text() {
        let server_url = start_test_server().await;
        let fetcher = fetcher(Duration::from_secs(5), 3);
        let url = format!("{}/page", server_url);

        let page = fetcher.fetch(&url).await.unwrap();
        assert_eq!(page.body, Body::Text("<html><body>hello</body></html>".into()));
        assert_eq!(fetcher.downloaded_count(), 1);
    }

    #[tokio::test]
    async fn other_content_is_kept_as_bytes() {
        let server_url = start_test_server().await;
        let fetcher = fetcher(Duration::from_secs(5), 3);

        let page = fetcher
            .fetch(&format!("{}/logo.png", server_url))
            .await
            .unwrap();
        assert_eq!(page.content_type.as_deref(), Some("image/png"));
        assert_eq!(page.body, Body::Binary(Bytes::from_static(&[0x89, 0x50, 0x4e, 0x47])));
    }

    #[tokio::test]
    async fn error_status_is_still_a_page() {
        let server_url = start_test_server().await;
        let fetcher = fetcher(Duration::from_secs(5), 3);

        let page = fetcher
            .fetch(&format!("{}/missing", server_url))
            .await
            .unwrap();
        assert_eq!(page.html(), "gone");
        assert!(fetcher.take_errors().is_empty());
    }

    #[tokio::test]
    async fn repeated_downloads_are_counted() {
        let server_url = start_test_server().await;
        let fetcher = fetcher(Duration::from_secs(5), 3);
        let url = format!("{}/page", server_url);

        fetcher.fetch(&url).await.unwrap();
        fetcher.fetch(&url).await.unwrap();
        assert_eq!(fetcher.downloaded_count(), 2);
    }

    #[tokio::test]
    async fn timeouts_are_retried_then_recorded() {
        let server_url = start_test_server().await;
        let fetcher = fetcher(Duration::from_millis(100), 2);
        let url = format!("{}/slow", server_url);

        let err = fetcher.fetch(&url).await.unwrap_err();
        assert!(matches!(err, Error::Fetch { .. }));
        assert_eq!(fetcher.downloaded_count(), 0);

        let errors = fetcher.take_errors();
        assert_eq!(errors.len(), 1);
        assert!(errors.contains_key(&url));
        assert!(fetcher.take_errors().is_empty());
    }

    #[tokio::test]
    async fn unreachable_host_is_recorded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let fetcher = fetcher(Duration::from_secs(1), 2);
        let url = format!("http://{}/", addr);
        assert!(fetcher.fetch(&url).await.is_err());
        assert_eq!(fetcher.downloaded_count(), 0);
        assert!(fetcher.take_errors().contains_key(&url));
    }

    #[tokio::test]
    async fn malformed_url_is_not_retried() {
        let fetcher = fetcher(Duration::from_secs(1), 5);
        let err = fetcher.fetch("not a url").await.unwrap_err();
        assert!(matches!(err, Error::Fetch { .. }));
        assert!(fetcher.take_errors().contains_key("not a url"));
    }
}
