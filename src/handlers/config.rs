use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Current configuration, credential masked.
pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config.redacted()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_config_view_hides_credential() {
        let mut config = AppConfig::default();
        config.upstream.api_key = "dg_secret_value".to_string();
        let state = web::Data::new(AppState::new(config).unwrap());

        let app = test::init_service(
            App::new()
                .app_data(state)
                .route("/api/v1/config", web::get().to(get_config)),
        )
        .await;
        let resp = test::call_service(&app, test::TestRequest::get().uri("/api/v1/config").to_request()).await;
        assert!(resp.status().is_success());

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["config"]["upstream"]["api_key"], "dg_s****");
        assert_eq!(body["config"]["upstream"]["auth_scheme"], "Token");
        assert!(!body.to_string().contains("dg_secret_value"));
    }
}
