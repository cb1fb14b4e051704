use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let sessions = state.sessions.snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let body = json!({
        "status": if sessions.accepting { "healthy" } else { "draining" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "sessions": {
            "active": sessions.active,
            "total": sessions.total,
            "accepting": sessions.accepting
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            }
        },
        "upstream": {
            "listen_url": config.upstream.listen_url,
            "probe_url": state.prober.url()
        },
        "memory": get_memory_info()
    });

    if sessions.accepting {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let sessions = state.sessions.snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "relay": {
            "active_sessions": sessions.active,
            "total_sessions": sessions.total,
            "sessions_completed": metrics.relay.sessions_completed,
            "probe_failures": metrics.relay.probe_failures,
            "connect_failures": metrics.relay.connect_failures,
            "frames_client_to_upstream": metrics.relay.frames_client_to_upstream,
            "frames_upstream_to_client": metrics.relay.frames_upstream_to_client,
            "frames_dropped": metrics.relay.frames_dropped
        },
        "endpoints": endpoint_stats,
        "memory": get_memory_info()
    }))
}

/// Human-readable landing page for operators.
pub async fn status_page(state: web::Data<AppState>) -> HttpResponse {
    let sessions = state.sessions.snapshot();
    let body = format!(
        r#"<!DOCTYPE html>
<html>
<head><title>{name}</title></head>
<body>
<h1>{name} v{version}</h1>
<p>Status: <strong>{status}</strong></p>
<ul>
<li>Active sessions: {active}</li>
<li>Sessions since start: {total}</li>
<li>Uptime: {uptime}s</li>
</ul>
<p>Connect a WebSocket client to <code>/ws</code>; query parameters are forwarded to the upstream.</p>
</body>
</html>
"#,
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        status = if sessions.accepting { "accepting sessions" } else { "draining" },
        active = sessions.active,
        total = sessions.total,
        uptime = state.get_uptime_seconds(),
    );

    HttpResponse::Ok().content_type("text/html; charset=utf-8").body(body)
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", std::process::id())) {
            let mut vm_rss = 0;
            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_rss = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                }
            }
            return json!({
                "resident_memory_bytes": vm_rss,
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "available": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{body::to_bytes, http::StatusCode, test, App};

    fn state() -> web::Data<AppState> {
        let mut config = AppConfig::default();
        config.upstream.api_key = "test-key".to_string();
        web::Data::new(AppState::new(config).unwrap())
    }

    #[actix_web::test]
    async fn test_health_reports_draining_with_503() {
        let state = state();
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["sessions"]["active"], 0);

        state.sessions.begin_drain();
        let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "draining");
    }

    #[actix_web::test]
    async fn test_status_page_shows_sessions() {
        let state = state();
        let _lease = state.sessions.register().unwrap();

        let resp = status_page(state).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body()).await.unwrap();
        let html = String::from_utf8(body.to_vec()).unwrap();
        assert!(html.contains("Active sessions: 1"));
        assert!(html.contains("accepting sessions"));
    }
}
