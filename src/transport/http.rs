use futures::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tracing::trace;
use url::Url;

use crate::config::TransportConfig;
use crate::query::QueryError;

use super::{Headers, Request, Response, Transport};

/// A [`Transport`] backed by a [`reqwest::Client`].
///
/// Relative URLs are resolved against the configured base URL. Bodies are
/// decoded as JSON when possible; a non-JSON body is kept as a string and an
/// empty body becomes `null`.
///
/// # Example
///
/// ```rust,no_run
/// use tears_query::config::TransportConfig;
/// use tears_query::transport::HttpTransport;
///
/// let config = TransportConfig::new("https://jsonplaceholder.typicode.com/".parse().unwrap());
/// let transport = HttpTransport::new(&config).expect("client should build");
/// ```
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Option<Url>,
}

impl HttpTransport {
    /// Builds a transport from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if a default header is invalid or the TLS backend
    /// cannot be initialized.
    pub fn new(config: &TransportConfig) -> Result<Self, QueryError> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout())
            .default_headers(header_map(&config.headers)?);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent);
        }

        let client = builder
            .build()
            .map_err(|e| QueryError::InvalidRequest(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
        })
    }

    /// Wraps an existing client.
    #[must_use]
    pub const fn with_client(client: reqwest::Client, base_url: Option<Url>) -> Self {
        Self { client, base_url }
    }

    fn resolve(&self, url: &str) -> Result<Url, QueryError> {
        let resolved = match &self.base_url {
            Some(base) => base.join(url),
            None => Url::parse(url),
        };
        resolved.map_err(|e| QueryError::InvalidRequest(format!("{url}: {e}")))
    }
}

impl Transport for HttpTransport {
    fn request(&self, request: Request) -> BoxFuture<'static, Result<Response<Value>, QueryError>> {
        let client = self.client.clone();
        let url = self.resolve(&request.url);

        Box::pin(async move {
            let url = url?;
            let headers = header_map(&request.headers)?;
            trace!(method = %request.method, %url, "sending request");

            let mut builder = client.request(request.method, url).headers(headers);
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let send = async move {
                let response = builder.send().await?;
                let status = response.status();
                let bytes = response.bytes().await;

                if status.is_success() {
                    Ok(Response::new(status.as_u16(), decode_body(&bytes?)))
                } else {
                    // A body that fails to arrive still leaves us with a status.
                    let data = bytes.map(|b| decode_body(&b)).unwrap_or(Value::Null);
                    Err(QueryError::Status {
                        status: status.as_u16(),
                        data,
                    })
                }
            };

            match request.cancel {
                Some(token) => tokio::select! {
                    () = token.cancelled() => Err(QueryError::Cancelled),
                    result = send => result,
                },
                None => send.await,
            }
        })
    }
}

impl From<reqwest::Error> for QueryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            Self::InvalidRequest(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

fn header_map(headers: &Headers) -> Result<HeaderMap, QueryError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| QueryError::InvalidRequest(format!("header {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| QueryError::InvalidRequest(format!("header {name:?}: {e}")))?;
        map.insert(header, value);
    }
    Ok(map)
}

fn decode_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    /// Serves `reply` verbatim to a single connection, returning the base URL.
    async fn serve_once(reply: &'static str) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");

        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0_u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        Url::parse(&format!("http://{addr}/")).expect("valid url")
    }

    fn transport(base: Url) -> HttpTransport {
        let config = TransportConfig::new(base).with_timeout(Duration::from_secs(5));
        HttpTransport::new(&config).expect("client should build")
    }

    #[test]
    fn test_decode_body() {
        assert_eq!(decode_body(b""), Value::Null);
        assert_eq!(decode_body(br#"{"id":1}"#), json!({"id": 1}));
        assert_eq!(decode_body(b"not json"), json!("not json"));
    }

    #[test]
    fn test_header_map_rejects_invalid_name() {
        let headers = Headers::from([("bad header".to_string(), "v".to_string())]);
        assert!(matches!(
            header_map(&headers),
            Err(QueryError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_resolve_relative_url() {
        let transport = transport(Url::parse("http://localhost:8080/api/").expect("valid url"));
        let url = transport.resolve("users/1").expect("resolves");
        assert_eq!(url.as_str(), "http://localhost:8080/api/users/1");
    }

    #[test]
    fn test_with_client_uses_given_base() {
        let base = Url::parse("http://localhost:8080/v1/").expect("valid url");
        let transport = HttpTransport::with_client(reqwest::Client::new(), Some(base));
        let url = transport.resolve("posts?page=2").expect("resolves");
        assert_eq!(url.as_str(), "http://localhost:8080/v1/posts?page=2");

        let transport = HttpTransport::with_client(reqwest::Client::new(), None);
        let url = transport
            .resolve("https://jsonplaceholder.typicode.com/users/1")
            .expect("absolute url needs no base");
        assert_eq!(url.host_str(), Some("jsonplaceholder.typicode.com"));
    }

    #[test]
    fn test_resolve_without_base_requires_absolute_url() {
        let transport = HttpTransport::new(&TransportConfig::default()).expect("client builds");
        assert!(matches!(
            transport.resolve("/users/1"),
            Err(QueryError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_success_response() {
        let base = serve_once(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 19\r\nconnection: close\r\n\r\n{\"id\":1,\"name\":\"A\"}",
        )
        .await;

        let result = timeout(
            Duration::from_secs(5),
            transport(base).request(Request::get("/users/1")),
        )
        .await
        .expect("request should finish");

        let response = result.expect("request should succeed");
        assert_eq!(response.status, 200);
        assert_eq!(response.data, json!({"id": 1, "name": "A"}));
    }

    #[tokio::test]
    async fn test_error_status_is_not_network_error() {
        let base = serve_once(
            "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;

        let result = timeout(
            Duration::from_secs(5),
            transport(base).request(Request::get("/users/9")),
        )
        .await
        .expect("request should finish");

        let err = result.expect_err("404 should fail");
        assert_eq!(err.status(), Some(404));
        assert!(!err.is_network_error());
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_error() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        let base = Url::parse(&format!("http://{addr}/")).expect("valid url");
        let result = timeout(
            Duration::from_secs(5),
            transport(base).request(Request::get("/users/1")),
        )
        .await
        .expect("request should finish");

        let err = result.expect_err("refused connection should fail");
        assert!(err.is_network_error());
        assert!(matches!(err, QueryError::Network(_)));
    }

    #[tokio::test]
    async fn test_cancelled_request() {
        // Accepts but never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let server = tokio::spawn(async move {
            let accepted = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(accepted);
        });

        let token = CancellationToken::new();
        let base = Url::parse(&format!("http://{addr}/")).expect("valid url");
        let pending = transport(base).request(Request::get("/slow").with_cancel(token.clone()));
        token.cancel();

        let result = timeout(Duration::from_secs(5), pending)
            .await
            .expect("cancellation should resolve promptly");
        assert_eq!(result, Err(QueryError::Cancelled));
        server.abort();
    }
}
