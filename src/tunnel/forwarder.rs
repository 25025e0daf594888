//! Executes forwarded requests against a local service.
//!
//! Local failures never escape this module: they become a 502 response
//! sent back through the tunnel.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use reqwest::header::HeaderMap;
use tracing::{debug, warn};

use crate::error::ForwardError;

use super::protocol::{ForwardedRequest, ForwardedResponse};

/// Headers that describe a single hop and are never forwarded.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Local HTTP caller shared by all in-flight requests.
pub struct Forwarder {
    client: reqwest::Client,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client, timeout })
    }

    /// Forward `request` to `127.0.0.1:port`. Always yields a response.
    pub async fn forward(&self, port: u16, request: &ForwardedRequest) -> ForwardedResponse {
        let start = Instant::now();
        match self.call(port, request).await {
            Ok(response) => {
                debug!(
                    port,
                    method = %request.method,
                    path = %request.path,
                    status = response.status_code,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "local request completed"
                );
                response
            }
            Err(e) => {
                warn!(port, method = %request.method, path = %request.path, error = %e, "local request failed");
                ForwardedResponse::text(502, format!("Local service error: {e}"))
            }
        }
    }

    async fn call(
        &self,
        port: u16,
        request: &ForwardedRequest,
    ) -> Result<ForwardedResponse, ForwardError> {
        let method = match request.method.as_str() {
            "" => reqwest::Method::GET,
            m => reqwest::Method::from_bytes(m.as_bytes())
                .map_err(|_| ForwardError::InvalidRequest(format!("bad method '{m}'")))?,
        };
        let url = local_url(port, &request.path, &request.query_string);

        let mut req = self.client.request(method, &url).timeout(self.timeout);
        for (name, value) in &request.headers {
            if !is_hop_by_hop(name) {
                req = req.header(name.as_str(), value.as_str());
            }
        }
        if !request.body.is_empty() {
            req = req.body(request.body.clone());
        }

        let response = req.send().await.map_err(|e| self.classify(e))?;
        let status_code = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let body = response.text().await.map_err(|e| self.classify(e))?;

        Ok(ForwardedResponse {
            status_code,
            headers,
            body,
        })
    }

    fn classify(&self, e: reqwest::Error) -> ForwardError {
        if e.is_timeout() {
            ForwardError::Timeout(self.timeout)
        } else if e.is_connect() {
            ForwardError::Connect(e.to_string())
        } else {
            ForwardError::Request(e)
        }
    }
}

/// `http://127.0.0.1:<port><path>[?<query>]`
pub fn local_url(port: u16, path: &str, query: &str) -> String {
    let mut url = format!("http://127.0.0.1:{port}");
    if !path.starts_with('/') {
        url.push('/');
    }
    url.push_str(path);
    if !query.is_empty() {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// Flatten response headers, joining repeated names and dropping hop-by-hop ones.
fn collect_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out: HashMap<String, String> = HashMap::new();
    for (name, value) in headers {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        let Ok(value) = value.to_str() else {
            continue;
        };
        out.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap as AxumHeaders;
    use axum::routing::{get, post};
    use axum::Router;

    async fn spawn_local_service() -> u16 {
        async fn hello(headers: AxumHeaders) -> impl axum::response::IntoResponse {
            let x_test = headers
                .get("x-test")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-")
                .to_string();
            let proxy_auth = headers.contains_key("proxy-authorization");
            (
                [("x-custom", "yes"), ("connection", "close")],
                format!("hello x-test={x_test} proxy-auth={proxy_auth}"),
            )
        }
        async fn echo(body: String) -> String {
            format!("echo:{body}")
        }

        let app = Router::new()
            .route("/hello", get(hello))
            .route("/echo", post(echo));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    async fn unused_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_local_url() {
        assert_eq!(local_url(9998, "/a/b", ""), "http://127.0.0.1:9998/a/b");
        assert_eq!(local_url(80, "/a", "x=1&y=2"), "http://127.0.0.1:80/a?x=1&y=2");
        assert_eq!(local_url(80, "rel", ""), "http://127.0.0.1:80/rel");
    }

    #[test]
    fn test_hop_by_hop_case_insensitive() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(is_hop_by_hop("host"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("x-forwarded-for"));
    }

    #[tokio::test]
    async fn test_forward_get_strips_hop_by_hop() {
        let port = spawn_local_service().await;
        let forwarder = Forwarder::new(Duration::from_secs(5)).unwrap();
        let request = ForwardedRequest {
            method: "GET".into(),
            path: "/hello".into(),
            query_string: "a=1".into(),
            headers: HashMap::from([
                ("X-Test".to_string(), "42".to_string()),
                ("Proxy-Authorization".to_string(), "secret".to_string()),
                ("Host".to_string(), "public.example".to_string()),
            ]),
            body: String::new(),
        };

        let response = forwarder.forward(port, &request).await;
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, "hello x-test=42 proxy-auth=false");
        assert_eq!(response.headers.get("x-custom").map(String::as_str), Some("yes"));
        assert!(!response.headers.contains_key("connection"));
    }

    #[tokio::test]
    async fn test_forward_post_body() {
        let port = spawn_local_service().await;
        let forwarder = Forwarder::new(Duration::from_secs(5)).unwrap();
        let request = ForwardedRequest {
            method: "POST".into(),
            path: "/echo".into(),
            body: "payload".into(),
            ..ForwardedRequest::default()
        };
        let response = forwarder.forward(port, &request).await;
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, "echo:payload");
    }

    #[tokio::test]
    async fn test_unreachable_service_is_502() {
        let port = unused_port().await;
        let forwarder = Forwarder::new(Duration::from_secs(5)).unwrap();
        let response = forwarder.forward(port, &ForwardedRequest::default()).await;
        assert_eq!(response.status_code, 502);
        assert!(response.body.starts_with("Local service error:"));
        assert_eq!(
            response.headers.get("Content-Type").map(String::as_str),
            Some("text/plain")
        );
    }

    #[tokio::test]
    async fn test_invalid_method_is_502() {
        let forwarder = Forwarder::new(Duration::from_secs(5)).unwrap();
        let request = ForwardedRequest {
            method: "NOT A METHOD".into(),
            ..ForwardedRequest::default()
        };
        let response = forwarder.forward(1, &request).await;
        assert_eq!(response.status_code, 502);
        assert!(response.body.contains("bad method"));
    }

    #[tokio::test]
    async fn test_empty_method_defaults_to_get() {
        let port = spawn_local_service().await;
        let forwarder = Forwarder::new(Duration::from_secs(5)).unwrap();
        let request = ForwardedRequest {
            method: String::new(),
            path: "hello".into(),
            ..ForwardedRequest::default()
        };
        let response = forwarder.forward(port, &request).await;
        assert_eq!(response.status_code, 200);
        assert!(response.body.starts_with("hello"));
    }
}
