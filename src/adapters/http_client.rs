use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use eyre::Result;
use http_body_util::{BodyExt, Full};
use hyper::{Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use serde_json::Value;
use tracing::Instrument;

use crate::{
    config::models::{BackendConfig, Encoding},
    core::{
        context::Context,
        error::ProxyError,
        proxy::{BoxProxy, Data, Metadata, Proxy, ProxyResult, Request, Response},
    },
    ports::backend::BackendFactory,
    tracing_setup::create_backend_span,
};

/// Key under which a top-level JSON array is exposed
pub const COLLECTION_KEY: &str = "collection";

type HttpsClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Backend transport using Hyper with Rustls.
///
/// Responsibilities:
/// * Adds a small set of default headers
/// * Executes the balanced request under the caller's context
/// * Maps non-2xx statuses to [`ProxyError::Backend`]
/// * Decodes the payload according to the backend encoding
///
/// One client (and its connection pool) is shared by every backend.
#[derive(Clone)]
pub struct HttpBackendFactory {
    client: HttpsClient,
}

impl HttpBackendFactory {
    pub fn new() -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();

        if !native_certs.certs.is_empty() {
            for cert in native_certs.certs {
                if root_cert_store.add(cert).is_err() {
                    tracing::warn!("Failed to add native certificate to rustls RootCertStore");
                }
            }
            tracing::info!("Loaded {} native root certificates.", root_cert_store.len());
        }

        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, Full<Bytes>>(https_connector);

        tracing::info!("Created backend HTTP client");
        Ok(Self { client })
    }
}

impl BackendFactory for HttpBackendFactory {
    fn new_backend(&self, backend: &BackendConfig) -> BoxProxy {
        Arc::new(HttpBackend {
            client: self.client.clone(),
            encoding: backend.encoding,
        })
    }
}

struct HttpBackend {
    client: HttpsClient,
    encoding: Encoding,
}

impl HttpBackend {
    /// Inject a consistent set of headers if absent.
    fn add_common_headers(headers: &mut header::HeaderMap) {
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);
        if !headers.contains_key(header::USER_AGENT) {
            headers.insert(
                header::USER_AGENT,
                HeaderValue::from_static("Conflux-Gateway/1.0"),
            );
        }
        if !headers.contains_key(header::ACCEPT) {
            headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        }
    }

    async fn send(&self, ctx: &Context, req: Request, url: url::Url) -> ProxyResult {
        let mut headers = req.headers;
        Self::add_common_headers(&mut headers);

        let mut outgoing = hyper::Request::builder()
            .method(req.method)
            .uri(url.as_str())
            .version(Version::HTTP_11)
            .body(Full::new(req.body))
            .map_err(|e| ProxyError::Connection(format!("invalid request to {url}: {e}")))?;
        outgoing.headers_mut().extend(headers);

        tracing::debug!("Sending request: {} {}", outgoing.method(), outgoing.uri());

        let response = ctx
            .run(async {
                self.client
                    .request(outgoing)
                    .await
                    .map_err(|e| ProxyError::Connection(format!("request to {url} failed: {e}")))
            })
            .await;
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                tracing::Span::current().record("http.status_code", 599u16);
                tracing::warn!("Error calling backend {}: {}", url, e);
                return Err(e);
            }
        };

        let status = response.status();
        tracing::Span::current().record("http.status_code", status.as_u16());
        if !status.is_success() {
            return Err(ProxyError::Backend {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let (parts, body) = response.into_parts();
        let body = ctx
            .run(async {
                body.collect()
                    .await
                    .map(|collected| collected.to_bytes())
                    .map_err(|e| ProxyError::Connection(format!("reading body from {url}: {e}")))
            })
            .await?;

        let mut response = decode(self.encoding, body)?;
        response.metadata = Metadata {
            status_code: Some(parts.status),
            headers: parts.headers,
        };
        Ok(Some(response))
    }
}

#[async_trait]
impl Proxy for HttpBackend {
    async fn call(&self, ctx: Context, req: Request) -> ProxyResult {
        let Some(url) = req.url.clone() else {
            return Err(ProxyError::Connection(
                "backend url was not resolved".to_string(),
            ));
        };

        let span = create_backend_span(
            &url.origin().ascii_serialization(),
            req.method.as_str(),
            url.path(),
        );
        self.send(&ctx, req, url).instrument(span).await
    }
}

/// Turn a successful payload into a response.
pub fn decode(encoding: Encoding, body: Bytes) -> Result<Response, ProxyError> {
    match encoding {
        Encoding::NoOp => Ok(Response {
            io: Some(body),
            ..Response::complete(Data::new())
        }),
        Encoding::Json => {
            if body.iter().all(u8::is_ascii_whitespace) {
                return Ok(Response::complete(Data::new()));
            }
            match serde_json::from_slice::<Value>(&body) {
                Ok(Value::Object(data)) => Ok(Response::complete(data)),
                Ok(Value::Array(items)) => {
                    let mut data = Data::new();
                    data.insert(COLLECTION_KEY.to_string(), Value::Array(items));
                    Ok(Response::complete(data))
                }
                Ok(other) => Err(ProxyError::Decode(format!(
                    "expected a JSON object or array, got {other}"
                ))),
                Err(e) => Err(ProxyError::Decode(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_decode_object() {
        let res = decode(Encoding::Json, Bytes::from_static(br#"{"id": 1}"#)).unwrap();
        assert!(res.is_complete);
        assert_eq!(res.data["id"], json!(1));
    }

    #[test]
    fn test_decode_array_as_collection() {
        let res = decode(Encoding::Json, Bytes::from_static(b"[1, 2]")).unwrap();
        assert_eq!(res.data[COLLECTION_KEY], json!([1, 2]));
    }

    #[test]
    fn test_decode_rejects_scalars_and_garbage() {
        assert!(matches!(
            decode(Encoding::Json, Bytes::from_static(b"42")),
            Err(ProxyError::Decode(_))
        ));
        assert!(matches!(
            decode(Encoding::Json, Bytes::from_static(b"{oops")),
            Err(ProxyError::Decode(_))
        ));
    }

    #[test]
    fn test_decode_empty_body() {
        let res = decode(Encoding::Json, Bytes::from_static(b" \n")).unwrap();
        assert!(res.data.is_empty());
        assert!(res.is_complete);
    }

    #[test]
    fn test_decode_noop_passes_body_through() {
        let res = decode(Encoding::NoOp, Bytes::from_static(b"<html/>")).unwrap();
        assert!(res.data.is_empty());
        assert_eq!(res.io.as_deref(), Some(&b"<html/>"[..]));
    }

    #[test]
    fn test_common_headers() {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("gateway.local"));
        HttpBackend::add_common_headers(&mut headers);
        assert!(!headers.contains_key(header::HOST));
        assert_eq!(headers[header::USER_AGENT], "Conflux-Gateway/1.0");
        assert_eq!(headers[header::ACCEPT], "application/json");
    }

    #[tokio::test]
    async fn test_unresolved_url_is_an_error() {
        let factory = HttpBackendFactory::new().unwrap();
        let backend = factory.new_backend(&BackendConfig::new("/"));
        let res = backend
            .call(Context::background(), Request::default())
            .await;
        assert!(matches!(res, Err(ProxyError::Connection(_))));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let factory = HttpBackendFactory::new().unwrap();
        let backend = factory.new_backend(&BackendConfig::new("/"));
        let req = Request {
            url: Some(url::Url::parse("http://127.0.0.1:1/unreachable").unwrap()),
            ..Request::default()
        };
        let res = backend.call(Context::background(), req).await;
        assert!(matches!(res, Err(ProxyError::Connection(_))));
    }
}
