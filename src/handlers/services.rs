//! Provider discovery: what is registered, by kind, and by name.

use actix_web::{web, HttpResponse};
use serde_json::json;

use crate::error::{AppError, AppResult};
use crate::providers::ProviderKind;
use crate::state::AppState;

fn parse_kind(kind: &str) -> AppResult<ProviderKind> {
    kind.parse().map_err(AppError::BadRequest)
}

pub async fn list_services(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let services = state.registry.list_providers();

    Ok(HttpResponse::Ok().json(json!({
        "count": services.len(),
        "services": services
    })))
}

pub async fn services_by_kind(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let kind = parse_kind(&path.into_inner())?;
    let services = state.registry.providers_by_kind(kind);

    Ok(HttpResponse::Ok().json(json!({
        "type": kind,
        "count": services.len(),
        "services": services
    })))
}

pub async fn service_info(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> AppResult<HttpResponse> {
    let (kind, name) = path.into_inner();
    let info = state.registry.provider_info(parse_kind(&kind)?, &name)?;
    Ok(HttpResponse::Ok().json(info))
}
