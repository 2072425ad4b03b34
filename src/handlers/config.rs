use crate::{
    config::AppConfig,
    error::{AppError, AppResult},
    state::AppState,
};
use actix_web::{web, HttpResponse};
use serde_json::{json, Value};

/// Public view of the configuration. Vendor credentials are never echoed,
/// only whether they are present.
fn config_view(config: &AppConfig) -> Value {
    let qiniu = &config.providers.qiniu;
    let qwen = &config.providers.qwen;
    let iflytek = &config.providers.iflytek;
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "providers": {
            "request_timeout_secs": config.providers.request_timeout_secs,
            "qiniu": {
                "configured": qiniu.api_key.is_some(),
                "base_url": qiniu.base_url,
                "asr_ws_url": qiniu.asr_ws_url,
                "tts_ws_url": qiniu.tts_ws_url,
                "llm_model": qiniu.llm_model
            },
            "qwen": {
                "configured": qwen.api_key.is_some(),
                "base_url": qwen.base_url,
                "model": qwen.model
            },
            "iflytek": {
                "configured": iflytek.credentials().is_some(),
                "asr_ws_url": iflytek.asr_ws_url,
                "tts_ws_url": iflytek.tts_ws_url,
                "default_voice": iflytek.default_voice
            }
        },
        "session": config.session,
        "performance": config.performance,
        "roles": config.roles
    })
}

pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_view(&config)
    })))
}

/// `PUT /api/v1/config` with a partial document such as
/// `{"session": {"default_voice": "v2"}}`. Open sessions keep the settings
/// they started with.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<Value>,
) -> AppResult<HttpResponse> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_view(&current_config)
    })))
}
