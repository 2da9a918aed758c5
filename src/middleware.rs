use axum::extract::{ConnectInfo, MatchedPath, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::error::Error;
use crate::governance::RequestGovernor;
use crate::metrics::endpoint_key;

/// Identity the governance core keys a request's client by
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Whether forwarding headers are trusted when identifying clients
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientIdentity {
    pub trust_proxy_headers: bool,
}

/// Per-route admission state: the shared governor plus the policy name
#[derive(Clone)]
pub struct Admission {
    governor: Arc<RequestGovernor>,
    policy: &'static str,
}

impl Admission {
    pub fn new(governor: Arc<RequestGovernor>, policy: &'static str) -> Self {
        Self { governor, policy }
    }
}

/// Resolve the client identity once and attach it to the request
pub async fn client_identity_middleware(
    State(identity): State<ClientIdentity>,
    mut request: Request,
    next: Next,
) -> Response {
    let client = get_client_ip(&request, identity.trust_proxy_headers);
    request.extensions_mut().insert(ClientId(client));
    next.run(request).await
}

/// Logging middleware for request/response tracking
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let client_ip = client_id(&request);

    info!(
        target: "warden::middleware",
        method = %method,
        uri = %uri,
        client_ip = %client_ip,
        "Incoming request"
    );

    let response = next.run(request).await;

    let status = response.status();
    info!(
        target: "warden::middleware",
        method = %method,
        uri = %uri,
        status = %status,
        "Request completed"
    );

    response
}

/// Lockout then rate limit, before the handler runs
pub async fn admission_middleware(
    State(admission): State<Admission>,
    request: Request,
    next: Next,
) -> Result<Response, Error> {
    let client = client_id(&request);
    admission
        .governor
        .admit(&client, admission.policy)
        .into_result()?;

    Ok(next.run(request).await)
}

/// Metrics path for requests that matched no route. Keying them by their
/// literal path would let clients grow the table without bound.
pub const UNMATCHED_PATH: &str = "<unmatched>";

/// Record status and latency for every completed request
pub async fn metrics_middleware(
    State(governor): State<Arc<RequestGovernor>>,
    request: Request,
    next: Next,
) -> Response {
    let path = match request.extensions().get::<MatchedPath>() {
        Some(matched) => matched.as_str().to_string(),
        None => UNMATCHED_PATH.to_string(),
    };
    let endpoint = endpoint_key(request.method().as_str(), &path);

    let started = Instant::now();
    let response = next.run(request).await;
    governor.record_outcome(
        &endpoint,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );

    response
}

fn client_id(request: &Request) -> String {
    match request.extensions().get::<ClientId>() {
        Some(id) => id.0.clone(),
        None => get_client_ip(request, false),
    }
}

fn get_client_ip(request: &Request, trust_proxy_headers: bool) -> String {
    if trust_proxy_headers {
        if let Some(forwarded) = request.headers().get("x-forwarded-for") {
            if let Ok(forwarded_str) = forwarded.to_str() {
                if let Some(first_ip) = forwarded_str.split(',').next() {
                    let first_ip = first_ip.trim();
                    if !first_ip.is_empty() {
                        return first_ip.to_string();
                    }
                }
            }
        }

        if let Some(real_ip) = request.headers().get("x-real-ip") {
            if let Ok(ip_str) = real_ip.to_str() {
                return ip_str.trim().to_string();
            }
        }
    }

    // Fallback to connection info
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        addr.ip().to_string()
    } else if let Some(addr) = request.extensions().get::<SocketAddr>() {
        addr.ip().to_string()
    } else {
        "unknown".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_get_client_ip_with_forwarded_header() {
        let mut request = Request::new(axum::body::Body::empty());
        request.headers_mut().insert(
            "x-forwarded-for",
            HeaderValue::from_static("192.168.1.1, 10.0.0.1"),
        );

        let ip = get_client_ip(&request, true);
        assert_eq!(ip, "192.168.1.1");
    }

    #[test]
    fn test_get_client_ip_with_real_ip_header() {
        let mut request = Request::new(axum::body::Body::empty());
        request
            .headers_mut()
            .insert("x-real-ip", HeaderValue::from_static("203.0.113.1"));

        let ip = get_client_ip(&request, true);
        assert_eq!(ip, "203.0.113.1");
    }

    #[test]
    fn test_forwarding_headers_ignored_unless_trusted() {
        let mut request = Request::new(axum::body::Body::empty());
        request
            .headers_mut()
            .insert("x-forwarded-for", HeaderValue::from_static("198.51.100.7"));
        request
            .extensions_mut()
            .insert(ConnectInfo("10.1.2.3:4567".parse::<SocketAddr>().unwrap()));

        assert_eq!(get_client_ip(&request, false), "10.1.2.3");
    }

    #[test]
    fn test_get_client_ip_fallback() {
        let request = Request::new(axum::body::Body::empty());
        let ip = get_client_ip(&request, false);
        assert_eq!(ip, "unknown");
    }

    #[test]
    fn test_client_id_prefers_resolved_extension() {
        let mut request = Request::new(axum::body::Body::empty());
        request
            .extensions_mut()
            .insert(ClientId("172.16.0.9".to_string()));
        assert_eq!(client_id(&request), "172.16.0.9");
    }
}
