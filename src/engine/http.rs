use super::cancel::CancelToken;
use super::error::{HarnessError, TransportError};
use crate::domain::{HarnessConfig, Value};
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Proxy};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<http::Response<Bytes>, TransportError>> + Send + 'a>>;

/// Sends one fully built request and returns the buffered response.
pub trait Transport: Send + Sync {
    fn send(&self, request: http::Request<Bytes>, cancel: CancelToken) -> TransportFuture<'_>;
}

/// Transport of a context that was never attached to a suite.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTransport;

impl Transport for NoTransport {
    fn send(&self, request: http::Request<Bytes>, _: CancelToken) -> TransportFuture<'_> {
        let target = request.uri().to_string();
        Box::pin(async move {
            Err(TransportError::Connect(format!(
                "no transport configured for {target}"
            )))
        })
    }
}

/// reqwest-backed transport.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Client honouring the timeout, proxy, redirect and TLS settings.
    pub fn from_config(config: &HarnessConfig) -> Result<Self, TransportError> {
        let redirect = if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        };
        let mut builder = Client::builder().redirect(redirect);

        if let Some(ms) = config.timeout_ms {
            if ms > 0 {
                builder = builder.timeout(Duration::from_millis(ms));
            }
        }

        if let Some(ref proxy_url) = config.proxy_url {
            if !proxy_url.is_empty() {
                let proxy = Proxy::all(proxy_url)
                    .map_err(|err| TransportError::Build(format!("Invalid proxy URL: {err}")))?;
                builder = builder.proxy(proxy);
            }
        }

        if !config.verify_ssl {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|err| TransportError::Build(format!("Failed to build HTTP client: {err}")))?;
        Ok(Self { client })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else if err.is_builder() {
        TransportError::Build(err.to_string())
    } else {
        TransportError::Send(err.to_string())
    }
}

impl Transport for ReqwestTransport {
    fn send(&self, request: http::Request<Bytes>, cancel: CancelToken) -> TransportFuture<'_> {
        Box::pin(async move {
            let request = reqwest::Request::try_from(request)
                .map_err(|err| TransportError::Build(err.to_string()))?;

            let response = tokio::select! {
                result = self.client.execute(request) => result.map_err(classify_reqwest_error)?,
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            };

            let status = response.status();
            let version = response.version();
            let headers = response.headers().clone();
            let body = tokio::select! {
                body = response.bytes() => body
                    .map_err(|err| TransportError::Read(format!("Failed to read response: {err}")))?,
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            };

            let mut builder = http::Response::builder().status(status).version(version);
            if let Some(map) = builder.headers_mut() {
                *map = headers;
            }
            builder
                .body(body)
                .map_err(|err| TransportError::Read(err.to_string()))
        })
    }
}

pub fn build_headers(input: &[(String, String)]) -> Result<HeaderMap, HarnessError> {
    let mut headers = HeaderMap::new();

    for (key, value) in input {
        if key.is_empty() {
            continue;
        }

        let header_name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|err| HarnessError::Request(format!("Invalid header name `{key}`: {err}")))?;
        let header_value = HeaderValue::from_str(value).map_err(|err| {
            HarnessError::Request(format!("Invalid header value for `{key}`: {err}"))
        })?;
        headers.append(header_name, header_value);
    }

    Ok(headers)
}

/// Default response decoding: empty bodies are `Null`, JSON documents are
/// decoded with integers kept integral, anything else is text.
pub fn decode_body(body: &[u8]) -> Value {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Value::Null;
    }
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(json) => Value::from_json(json),
        Err(_) => Value::String(String::from_utf8_lossy(body).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[test]
    fn decode_body_keeps_integers_integral() {
        assert_eq!(decode_body(b""), Value::Null);
        assert_eq!(decode_body(b"  \n"), Value::Null);
        let decoded = decode_body(br#"{"id": 7, "price": 7.5, "tags": [1, 2.0]}"#);
        assert_eq!(
            decoded,
            crate::domain::object([
                ("id", Value::Int(7)),
                ("price", Value::Float(7.5)),
                ("tags", Value::Array(vec![Value::Int(1), Value::Float(2.0)])),
            ])
        );
        assert_eq!(decode_body(b"plain text"), Value::from("plain text"));
    }

    #[test]
    fn build_headers_rejects_invalid_names() {
        let headers = build_headers(&[
            ("accept".into(), "application/json".into()),
            ("".into(), "ignored".into()),
        ])
        .expect("headers");
        assert_eq!(headers.len(), 1);
        assert!(build_headers(&[("bad header".into(), "x".into())]).is_err());
    }

    #[test]
    fn invalid_proxy_is_a_build_error() {
        let config = HarnessConfig {
            proxy_url: Some("::not a url::".into()),
            ..HarnessConfig::default()
        };
        assert!(matches!(
            ReqwestTransport::from_config(&config),
            Err(TransportError::Build(_))
        ));
    }

    #[tokio::test]
    async fn reqwest_transport_round_trips_headers_and_body() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/echo").body(r#"{"a":1}"#);
                then.status(201)
                    .header("x-request-id", "r-1")
                    .body(r#"{"ok":true}"#);
            })
            .await;

        let transport = ReqwestTransport::from_config(&HarnessConfig::default()).expect("transport");
        let request = http::Request::builder()
            .method("POST")
            .uri(server.url("/echo"))
            .header("content-type", "application/json")
            .body(Bytes::from_static(br#"{"a":1}"#))
            .expect("request");

        let response = transport.send(request, CancelToken::new()).await.expect("response");
        assert_eq!(response.status(), 201);
        assert_eq!(response.headers()["x-request-id"], "r-1");
        assert_eq!(decode_body(response.body()), crate::domain::object([("ok", true)]));
    }

    #[tokio::test]
    async fn cancelled_token_aborts_the_request() {
        let transport = ReqwestTransport::from_config(&HarnessConfig::default()).expect("transport");
        let cancel = CancelToken::new();
        cancel.cancel();
        let request = http::Request::builder()
            .uri("http://10.255.255.1:9/never")
            .body(Bytes::new())
            .expect("request");
        assert_eq!(
            transport.send(request, cancel).await.unwrap_err(),
            TransportError::Cancelled
        );
    }

    #[tokio::test]
    async fn no_transport_always_fails() {
        let request = http::Request::builder()
            .uri("http://localhost/x")
            .body(Bytes::new())
            .expect("request");
        assert!(NoTransport.send(request, CancelToken::new()).await.is_err());
    }
}
