use actix_web::{web, HttpResponse};
use serde_json::json;

use crate::error::AppResult;
use crate::state::AppState;

pub async fn list_roles(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let roles = state.roles.roles();

    Ok(HttpResponse::Ok().json(json!({
        "count": roles.len(),
        "roles": roles
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::providers::ProviderRegistry;
    use crate::roles::RoleCatalog;
    use actix_web::{test, App};
    use serde_json::Value;

    #[actix_web::test]
    async fn test_list_builtin_roles() {
        let state = AppState::new(AppConfig::default(), ProviderRegistry::new(), RoleCatalog::builtin());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/roles", web::get().to(list_roles)),
        )
        .await;

        let body: Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/roles").to_request()).await;
        assert_eq!(body["count"], 3);
        assert_eq!(body["roles"][2]["id"], "english_tutor");
        assert_eq!(body["roles"][2]["voice"], "qiniu_en_female_ysyyn");
        assert!(body["roles"][0]["systemPrompt"].is_string());
    }
}
