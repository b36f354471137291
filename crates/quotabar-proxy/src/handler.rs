//! HTTP handler that turns intercepted exchanges into capture events.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hudsucker::{
    hyper::{header, HeaderMap, Method, Request, Response, StatusCode},
    hyper_util::client::legacy::Error as ClientError,
    Body, HttpContext, HttpHandler, RequestOrResponse,
};
use hyper::body::Bytes;
use tokio::sync::mpsc;

use quotabar_core::capture::{CaptureProfile, RequestId, TrafficEvent};

fn bytes_to_body(bytes: Bytes) -> Body {
    Body::from(Full::new(bytes))
}

/// Forwards every exchange to a capture session.
///
/// hudsucker clones the handler for each request, so `current` carries the
/// request id and URL from `handle_request` to `handle_response`.
#[derive(Clone)]
pub struct CaptureHandler {
    events: mpsc::Sender<TrafficEvent>,
    ids: Arc<AtomicU64>,
    profile: Arc<CaptureProfile>,
    current: Option<(RequestId, String)>,
}

impl std::fmt::Debug for CaptureHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureHandler")
            .field("provider", &self.profile.provider)
            .field("current", &self.current)
            .finish()
    }
}

impl CaptureHandler {
    /// Creates a handler sending events for `profile` to `events`.
    pub fn new(profile: CaptureProfile, events: mpsc::Sender<TrafficEvent>) -> Self {
        Self {
            events,
            ids: Arc::new(AtomicU64::new(1)),
            profile: Arc::new(profile),
            current: None,
        }
    }

    async fn emit(&self, event: TrafficEvent) {
        // The session is gone once it completed or aborted.
        let _ = self.events.send(event).await;
    }

    /// Absolute URL of a request, from the URI or else the Host header.
    fn request_url(req: &Request<Body>) -> Option<String> {
        let uri = req.uri();
        if uri.scheme().is_some() && uri.authority().is_some() {
            return Some(uri.to_string());
        }

        let host = req.headers().get(header::HOST)?.to_str().ok()?;
        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        Some(format!("https://{}{}", host, path))
    }

    /// Header map with lower-cased names. Non-text values are decoded lossily
    /// and repeated headers are joined with `, `.
    fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
        let mut map: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in headers {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            map.entry(name.as_str().to_lowercase())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert(value);
        }
        map
    }

    /// Reports the in-flight request as failed.
    async fn fail_current(&mut self) {
        if let Some((id, _)) = self.current.take() {
            self.emit(TrafficEvent::LoadingFailed { id }).await;
        }
    }

    fn is_encoded(headers: &HeaderMap) -> bool {
        headers
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| !v.trim().eq_ignore_ascii_case("identity"))
    }
}

impl HttpHandler for CaptureHandler {
    async fn handle_request(
        &mut self,
        _ctx: &HttpContext,
        mut req: Request<Body>,
    ) -> RequestOrResponse {
        if req.method() == Method::CONNECT {
            return RequestOrResponse::Request(req);
        }

        let Some(url) = Self::request_url(&req) else {
            return RequestOrResponse::Request(req);
        };

        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        self.current = Some((id, url.clone()));

        // Bodies must arrive uncompressed to be scored.
        req.headers_mut().remove(header::ACCEPT_ENCODING);

        self.emit(TrafficEvent::RequestWillBeSent {
            id,
            url,
            headers: Self::header_map(req.headers()),
        })
        .await;

        RequestOrResponse::Request(req)
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        let Some((id, url)) = self.current.take() else {
            return res;
        };

        self.emit(TrafficEvent::ResponseReceived {
            id,
            url: url.clone(),
        })
        .await;

        if !self.profile.is_candidate(&url) {
            self.emit(TrafficEvent::LoadingFinished { id, body: None })
                .await;
            return res;
        }

        let (parts, body) = res.into_parts();
        let encoded = Self::is_encoded(&parts.headers);

        match body.collect().await {
            Ok(collected) => {
                let bytes = collected.to_bytes();
                let text = if encoded {
                    tracing::debug!("Skipping encoded body from {}", url);
                    None
                } else {
                    Some(String::from_utf8_lossy(&bytes).into_owned())
                };
                self.emit(TrafficEvent::LoadingFinished { id, body: text })
                    .await;
                Response::from_parts(parts, bytes_to_body(bytes))
            }
            Err(e) => {
                tracing::warn!("Failed to read response body from {}: {}", url, e);
                self.emit(TrafficEvent::LoadingFailed { id }).await;
                Response::from_parts(parts, Body::empty())
            }
        }
    }

    async fn handle_error(&mut self, _ctx: &HttpContext, err: ClientError) -> Response<Body> {
        tracing::warn!("Failed to forward request: {}", err);
        self.fail_current().await;

        let mut res = Response::new(Body::empty());
        *res.status_mut() = StatusCode::BAD_GATEWAY;
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quotabar_core::Provider;

    fn handler() -> (CaptureHandler, mpsc::Receiver<TrafficEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let profile = CaptureProfile::for_provider(Provider::Codex).unwrap();
        (CaptureHandler::new(profile, tx), rx)
    }

    #[test]
    fn request_url_from_absolute_uri() {
        let req = Request::builder()
            .uri("https://chatgpt.com/backend-api/wham/usage?x=1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            CaptureHandler::request_url(&req).as_deref(),
            Some("https://chatgpt.com/backend-api/wham/usage?x=1")
        );
    }

    #[test]
    fn request_url_from_host_header() {
        let req = Request::builder()
            .uri("/api/organizations/o/usage")
            .header("host", "claude.ai")
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            CaptureHandler::request_url(&req).as_deref(),
            Some("https://claude.ai/api/organizations/o/usage")
        );
    }

    #[test]
    fn request_url_missing_host() {
        let req = Request::builder().uri("/x").body(Body::empty()).unwrap();
        assert!(CaptureHandler::request_url(&req).is_none());
    }

    #[test]
    fn header_map_lowercases_and_joins() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", "Bearer t".parse().unwrap());
        headers.append("x-multi", "a".parse().unwrap());
        headers.append("x-multi", "b".parse().unwrap());

        let map = CaptureHandler::header_map(&headers);
        assert_eq!(map.get("authorization").map(String::as_str), Some("Bearer t"));
        assert_eq!(map.get("x-multi").map(String::as_str), Some("a, b"));
    }

    #[test]
    fn encoded_bodies_detected() {
        let mut headers = HeaderMap::new();
        assert!(!CaptureHandler::is_encoded(&headers));
        headers.insert("content-encoding", "identity".parse().unwrap());
        assert!(!CaptureHandler::is_encoded(&headers));
        headers.insert("content-encoding", "gzip".parse().unwrap());
        assert!(CaptureHandler::is_encoded(&headers));
    }

    #[tokio::test]
    async fn ids_are_shared_across_clones() {
        let (handler, _rx) = handler();
        let other = handler.clone();

        let a = handler.ids.fetch_add(1, Ordering::Relaxed);
        let b = other.ids.fetch_add(1, Ordering::Relaxed);
        assert_eq!(b, a + 1);
    }

    #[tokio::test]
    async fn failed_forward_reports_loading_failed() {
        let (mut handler, mut rx) = handler();
        handler.current = Some((7, "https://chatgpt.com/backend-api/wham/usage".to_string()));

        handler.fail_current().await;
        assert!(matches!(rx.recv().await, Some(TrafficEvent::LoadingFailed { id: 7 })));
        assert!(handler.current.is_none());

        // Nothing in flight, nothing sent.
        handler.fail_current().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn emit_survives_closed_session() {
        let (handler, rx) = handler();
        drop(rx);
        handler.emit(TrafficEvent::WindowClosed).await;
    }
}
