use std::time::Duration;

use reqwest::header::{CONTENT_RANGE, LOCATION, RANGE, REFERER};
use reqwest::{redirect, Client, Proxy, Response, StatusCode};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::DownloadConfig;
use crate::error::DownloadError;
use crate::state::{DownloadState, ProxyConfig};

/// Byte range for a `Range` request. `end` is inclusive, as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn from(start: u64) -> Self {
        Self { start, end: None }
    }

    pub fn bounded(start: u64, end_inclusive: u64) -> Self {
        Self {
            start,
            end: Some(end_inclusive),
        }
    }

    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// Parsed `Content-Range: bytes S-E/T` (or `bytes */T` on a 416).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: Option<u64>,
    pub total: Option<u64>,
}

impl ContentRange {
    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.trim().strip_prefix("bytes")?.trim_start();
        let (span, total) = rest.rsplit_once('/')?;
        let total = total.trim().parse().ok();
        let start = match span.trim() {
            "*" => None,
            span => Some(span.split_once('-')?.0.trim().parse().ok()?),
        };
        Some(Self { start, total })
    }

    pub fn of(response: &Response) -> Option<Self> {
        response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(Self::parse)
    }
}

/// Opens connections for the transfer strategies.
///
/// Redirects are never followed by reqwest; they surface as
/// [`DownloadError::Moved`] so the retry loop can rebuild the state.
pub struct Connector {
    connect_timeout: Duration,
    read_timeout: Duration,
    user_agent: String,
    // Client for the proxy value of the last attempt.
    cached: Mutex<Option<(Option<ProxyConfig>, Client)>>,
}

impl Connector {
    pub fn new(config: &DownloadConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
            user_agent: config.user_agent.clone(),
            cached: Mutex::new(None),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Client for `proxy`, rebuilt only when the proxy changed since the
    /// previous call.
    pub async fn client_for(&self, proxy: Option<&ProxyConfig>) -> Result<Client, DownloadError> {
        let mut cached = self.cached.lock().await;
        if let Some((cached_proxy, client)) = cached.as_ref() {
            if cached_proxy.as_ref() == proxy {
                return Ok(client.clone());
            }
        }

        let client = self.build_client(proxy)?;
        *cached = Some((proxy.cloned(), client.clone()));
        Ok(client)
    }

    fn build_client(&self, proxy: Option<&ProxyConfig>) -> Result<Client, DownloadError> {
        let mut builder = Client::builder()
            .user_agent(&self.user_agent)
            .connect_timeout(self.connect_timeout)
            .redirect(redirect::Policy::none());

        match proxy {
            Some(config) => {
                debug!(proxy = %config.url, "using proxy");
                let mut proxy = Proxy::all(config.url.as_str()).map_err(DownloadError::Client)?;
                if let Some(username) = &config.username {
                    proxy = proxy.basic_auth(username, config.password.as_deref().unwrap_or(""));
                }
                builder = builder.proxy(proxy);
            }
            None => builder = builder.no_proxy(),
        }

        builder.build().map_err(DownloadError::Client)
    }

    /// Sends a GET for `state.source()` and classifies the status line.
    ///
    /// 2xx is returned as is; 3xx with a `Location` becomes
    /// [`DownloadError::Moved`]; everything else is fatal.
    pub async fn open(
        &self,
        client: &Client,
        state: &DownloadState,
        range: Option<ByteRange>,
    ) -> Result<Response, DownloadError> {
        let url = state.source();
        let mut request = client.get(url.clone());
        if let Some(range) = range {
            request = request.header(RANGE, range.header_value());
        }
        if let Some(referer) = state.referer() {
            request = request.header(REFERER, referer.as_str());
        }

        let response = tokio::time::timeout(self.read_timeout, request.send())
            .await
            .map_err(|_| DownloadError::Timeout { url: url.clone() })?
            .map_err(|e| DownloadError::request(url, e))?;

        let status = response.status();
        debug!(url = %url, status = status.as_u16(), ?range, "response received");

        if status.is_success() {
            return Ok(response);
        }

        if status.is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| url.join(value).ok());
            return match location {
                Some(location) => Err(DownloadError::Moved {
                    url: url.clone(),
                    location,
                }),
                None => Err(DownloadError::BadRedirect { url: url.clone() }),
            };
        }

        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Err(DownloadError::RangeNotSatisfiable {
                url: url.clone(),
                total: ContentRange::of(&response).and_then(|range| range.total),
            });
        }

        Err(DownloadError::HttpStatus {
            url: url.clone(),
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use url::Url;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::error::FailureKind;

    fn connector() -> Connector {
        Connector::new(&DownloadConfig::default())
    }

    #[test]
    fn range_header_values() {
        assert_eq!(ByteRange::from(400).header_value(), "bytes=400-");
        assert_eq!(ByteRange::bounded(0, 99).header_value(), "bytes=0-99");
    }

    #[test]
    fn content_range_values() {
        assert_eq!(
            ContentRange::parse("bytes 0-99/1000"),
            Some(ContentRange { start: Some(0), total: Some(1000) })
        );
        assert_eq!(
            ContentRange::parse("bytes 400-999/*"),
            Some(ContentRange { start: Some(400), total: None })
        );
        assert_eq!(
            ContentRange::parse("bytes */1000"),
            Some(ContentRange { start: None, total: Some(1000) })
        );
        assert_eq!(ContentRange::parse("garbage"), None);
    }

    #[tokio::test]
    async fn unsatisfiable_range_reports_remote_length() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(416).insert_header("Content-Range", "bytes */500"))
            .mount(&server)
            .await;

        let connector = connector();
        let client = connector.client_for(None).await.unwrap();
        let state = DownloadState::new(Url::parse(&server.uri()).unwrap());

        let err = connector
            .open(&client, &state, Some(ByteRange::from(500)))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::RangeNotSatisfiable { total: Some(500), .. }));
        assert_eq!(err.kind(), FailureKind::Fatal);
    }

    #[tokio::test]
    async fn client_is_reused_while_proxy_is_unchanged() {
        let connector = connector();
        connector.client_for(None).await.unwrap();
        connector.client_for(None).await.unwrap();

        let proxy = ProxyConfig {
            url: Url::parse("http://127.0.0.1:3128").unwrap(),
            username: Some("user".into()),
            password: Some("secret".into()),
        };
        connector.client_for(Some(&proxy)).await.unwrap();
        let cached = connector.cached.lock().await;
        assert_eq!(cached.as_ref().and_then(|(p, _)| p.clone()), Some(proxy));
    }

    #[tokio::test]
    async fn relative_location_becomes_moved() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/new"))
            .mount(&server)
            .await;

        let connector = connector();
        let client = connector.client_for(None).await.unwrap();
        let state = DownloadState::new(Url::parse(&format!("{}/old", server.uri())).unwrap());

        let err = connector.open(&client, &state, None).await.unwrap_err();
        match err {
            DownloadError::Moved { location, .. } => {
                assert_eq!(location.path(), "/new");
            }
            other => panic!("expected Moved, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_status_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let connector = connector();
        let client = connector.client_for(None).await.unwrap();
        let state = DownloadState::new(Url::parse(&server.uri()).unwrap());

        let err = connector.open(&client, &state, None).await.unwrap_err();
        assert!(matches!(err, DownloadError::HttpStatus { .. }));
    }

    #[tokio::test]
    async fn sends_range_and_referer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("Range", "bytes=10-"))
            .and(header("Referer", "http://example.com/page"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"rest".to_vec()))
            .mount(&server)
            .await;

        let connector = connector();
        let client = connector.client_for(None).await.unwrap();
        let state = DownloadState::new(Url::parse(&server.uri()).unwrap())
            .with_referer(Some(Url::parse("http://example.com/page").unwrap()));

        let response = connector
            .open(&client, &state, Some(ByteRange::from(10)))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::PARTIAL_CONTENT);
    }
}
