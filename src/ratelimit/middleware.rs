use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::json;

use crate::config::ProxyCidr;
use crate::extractor::{bearer_token, verify_token};

use super::limiter::{Decision, DecisionStatus, DistributedRateLimiter};

const DEFAULT_ORG: &str = "public";
const ANONYMOUS: &str = "anonymous";

const LIMIT_HEADER: &str = "x-ratelimit-limit";
const REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RESET_HEADER: &str = "x-ratelimit-reset";

/// Who a request is counted against.
#[derive(Debug, PartialEq, Eq)]
pub struct RequestIdentity {
    pub org_id: String,
    pub identifier: String,
}

impl RequestIdentity {
    /// Authenticated subject and org when the bearer token verifies, otherwise the client
    /// address. Nothing the client can set without a valid token changes the result.
    pub fn resolve(headers: &HeaderMap, peer: Option<IpAddr>, trusted: &[ProxyCidr]) -> Self {
        let token = bearer_token(headers).and_then(verify_token);
        let org_id = token
            .as_ref()
            .and_then(|token| token.org.clone())
            .unwrap_or_else(|| DEFAULT_ORG.to_string());
        let identifier = match (token, client_addr(headers, peer, trusted)) {
            (Some(token), _) => format!("sub:{}", token.subject),
            (None, Some(addr)) => format!("ip:{addr}"),
            (None, None) => ANONYMOUS.to_string(),
        };
        Self { org_id, identifier }
    }
}

/// The TCP peer, unless it is a trusted proxy: then the nearest untrusted hop named by
/// `X-Forwarded-For`, falling back to `X-Real-IP`.
pub fn client_addr(
    headers: &HeaderMap,
    peer: Option<IpAddr>,
    trusted: &[ProxyCidr],
) -> Option<IpAddr> {
    let peer = peer?;
    let is_trusted = |addr: IpAddr| trusted.iter().any(|cidr| cidr.contains(addr));
    if !is_trusted(peer) {
        return Some(peer);
    }

    let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());
    let forwarded: Vec<IpAddr> = header("x-forwarded-for")
        .map(|value| {
            value
                .split(',')
                .filter_map(|hop| hop.trim().parse().ok())
                .collect()
        })
        .unwrap_or_default();
    if let Some(client) = forwarded.iter().rev().find(|hop| !is_trusted(**hop)) {
        return Some(*client);
    }
    if let Some(first) = forwarded.first() {
        return Some(*first);
    }
    header("x-real-ip")
        .and_then(|value| value.trim().parse().ok())
        .or(Some(peer))
}

/// key: rate-limit-middleware
/// Enforces the limiter in front of the wrapped routes. Denials answer 429 with
/// `Retry-After`; a store outage under fail-closed answers 503.
pub async fn enforce<B>(
    State(limiter): State<Arc<DistributedRateLimiter>>,
    request: Request<B>,
    next: Next<B>,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let identity = RequestIdentity::resolve(
        request.headers(),
        peer,
        &limiter.config().trusted_proxies,
    );
    let decision = limiter.check(&identity.identifier, &identity.org_id).await;

    match decision.status {
        DecisionStatus::Allowed | DecisionStatus::FailedOpen => {
            let mut response = next.run(request).await;
            apply_headers(response.headers_mut(), &decision);
            response
        }
        DecisionStatus::Limited => {
            let body = Json(json!({
                "error": "rate_limit_exceeded",
                "limiting_window": decision.limiting_window,
                "retry_after_seconds": decision.retry_after.map(ceil_secs),
            }));
            let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
            apply_headers(response.headers_mut(), &decision);
            response
        }
        DecisionStatus::FailedClosed => {
            let body = Json(json!({
                "error": "rate_limit_unavailable",
                "retry_after_seconds": decision.retry_after.map(ceil_secs),
            }));
            let mut response = (StatusCode::SERVICE_UNAVAILABLE, body).into_response();
            apply_headers(response.headers_mut(), &decision);
            response
        }
    }
}

fn apply_headers(headers: &mut HeaderMap, decision: &Decision) {
    if matches!(
        decision.status,
        DecisionStatus::Allowed | DecisionStatus::Limited
    ) {
        let reset_at = Utc::now().timestamp() as u64 + ceil_secs(decision.reset_after);
        headers.insert(LIMIT_HEADER, HeaderValue::from(decision.limit));
        headers.insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
        headers.insert(RESET_HEADER, HeaderValue::from(reset_at));
    }
    if let Some(retry_after) = decision.retry_after {
        headers.insert(
            axum::http::header::RETRY_AFTER,
            HeaderValue::from(ceil_secs(retry_after)),
        );
    }
}

/// Whole seconds, rounded up so clients never retry early.
fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(value: &str) -> Option<IpAddr> {
        Some(value.parse().unwrap())
    }

    fn proxies() -> Vec<ProxyCidr> {
        vec!["10.0.0.0/8".parse().unwrap()]
    }

    #[test]
    fn untrusted_peer_cannot_name_another_client() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));
        headers.insert("x-real-ip", HeaderValue::from_static("5.6.7.8"));
        headers.insert("x-org-id", HeaderValue::from_static("acme"));
        let identity = RequestIdentity::resolve(&headers, addr("198.51.100.9"), &proxies());
        assert_eq!(identity.org_id, "public");
        assert_eq!(identity.identifier, "ip:198.51.100.9");
    }

    #[test]
    fn trusted_proxy_chain_is_walked_from_the_right() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("6.6.6.6, 203.0.113.7, 10.1.1.1"),
        );
        let client = client_addr(&headers, addr("10.0.0.2"), &proxies());
        assert_eq!(client, addr("203.0.113.7"));

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("203.0.113.8"));
        assert_eq!(client_addr(&headers, addr("10.0.0.2"), &proxies()), addr("203.0.113.8"));
        assert_eq!(client_addr(&HeaderMap::new(), addr("10.0.0.2"), &proxies()), addr("10.0.0.2"));
    }

    #[test]
    fn missing_peer_falls_back_to_public_anonymous() {
        let identity = RequestIdentity::resolve(&HeaderMap::new(), None, &[]);
        assert_eq!(identity.org_id, "public");
        assert_eq!(identity.identifier, "anonymous");
    }

    #[test]
    fn retry_seconds_round_up() {
        assert_eq!(ceil_secs(Duration::from_millis(1)), 1);
        assert_eq!(ceil_secs(Duration::from_secs(2)), 2);
        assert_eq!(ceil_secs(Duration::from_millis(2500)), 3);
    }
}
