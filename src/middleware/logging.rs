//! Access log for the HTTP surface.
//!
//! One `tracing` event per request, emitted when the response is ready. For
//! `/ws` that is the moment of the 101 upgrade; the session itself is logged
//! by the relay actor under its own id.

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header,
    Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};
use tracing::{error, info};

/// Logs each request with method, path, peer, status and duration.
///
/// The query string is left out: on `/ws` it carries the client's upstream
/// options, which belong to the session log, not the access log.
pub struct RequestLogging;

impl<S, B> Transform<S, ServiceRequest> for RequestLogging
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = AccessLogService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AccessLogService { inner: service }))
    }
}

/// The wrapped service produced by [`RequestLogging`].
pub struct AccessLogService<S> {
    inner: S,
}

/// What the access log records about a request, captured before the request
/// is handed to the inner service (which consumes it).
#[derive(Debug, Clone, PartialEq)]
struct AccessEntry {
    method: String,
    path: String,
    /// `realip_remote_addr`, so `Forwarded`/`X-Forwarded-For` win over the socket peer.
    peer: String,
    /// True for WebSocket upgrade requests.
    upgrade: bool,
}

impl AccessEntry {
    fn capture(req: &ServiceRequest) -> Self {
        let peer = req
            .connection_info()
            .realip_remote_addr()
            .unwrap_or("unknown")
            .to_string();

        Self {
            method: req.method().to_string(),
            path: req.path().to_string(),
            peer,
            upgrade: is_websocket_upgrade(req),
        }
    }

    fn completed(&self, status: u16, started: Instant) {
        info!(
            method = %self.method,
            path = %self.path,
            remote_addr = %self.peer,
            upgrade = self.upgrade,
            status,
            duration_ms = started.elapsed().as_millis() as u64,
            "Request completed"
        );
    }

    fn failed(&self, err: &Error, started: Instant) {
        error!(
            method = %self.method,
            path = %self.path,
            remote_addr = %self.peer,
            upgrade = self.upgrade,
            duration_ms = started.elapsed().as_millis() as u64,
            error = %err,
            "Request failed"
        );
    }
}

fn is_websocket_upgrade(req: &ServiceRequest) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

impl<S, B> Service<ServiceRequest> for AccessLogService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(inner);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let started = Instant::now();
        let entry = AccessEntry::capture(&req);
        let response = self.inner.call(req);

        Box::pin(async move {
            let result = response.await;
            match &result {
                Ok(res) => entry.completed(res.status().as_u16(), started),
                Err(err) => entry.failed(err, started),
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, web, App, HttpResponse};

    #[actix_web::test]
    async fn test_entry_captures_path_without_query() {
        let req = test::TestRequest::get()
            .uri("/ws?model=flux-general-en&encoding=linear16")
            .insert_header((header::UPGRADE, "WebSocket"))
            .insert_header(("x-forwarded-for", "203.0.113.7"))
            .to_srv_request();

        let entry = AccessEntry::capture(&req);
        assert_eq!(
            entry,
            AccessEntry {
                method: "GET".to_string(),
                path: "/ws".to_string(),
                peer: "203.0.113.7".to_string(),
                upgrade: true,
            }
        );
    }

    #[actix_web::test]
    async fn test_plain_request_is_not_an_upgrade() {
        let req = test::TestRequest::get()
            .uri("/health")
            .insert_header((header::UPGRADE, "h2c"))
            .to_srv_request();
        assert!(!AccessEntry::capture(&req).upgrade);
    }

    #[actix_web::test]
    async fn test_middleware_passes_response_through() {
        let app = test::init_service(
            App::new()
                .wrap(RequestLogging)
                .route("/teapot", web::get().to(|| async { HttpResponse::ImATeapot().finish() })),
        )
        .await;

        let res = test::call_service(&app, test::TestRequest::get().uri("/teapot").to_request()).await;
        assert_eq!(res.status().as_u16(), 418);
    }
}
