use axum::{
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::context::TenantContext;

/// Header carrying the authenticated tenant identity, set by the gateway
/// that fronts this service.
pub const TENANT_HEADER: &str = "x-tenant-id";

pub async fn tenant_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let tenant_id = extract_tenant(req.headers())?;

    req.extensions_mut().insert(TenantContext::new(tenant_id));

    Ok(next.run(req).await)
}

fn extract_tenant(headers: &HeaderMap) -> Result<postrelay_core::TenantId, StatusCode> {
    let header = headers.get(TENANT_HEADER).ok_or(StatusCode::UNAUTHORIZED)?;

    let header = header.to_str().map_err(|_| StatusCode::UNAUTHORIZED)?;

    header.trim().parse().map_err(|_| StatusCode::UNAUTHORIZED)
}
