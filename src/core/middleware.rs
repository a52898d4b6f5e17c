//! HTTP middleware.
//!
//! Assigns every inbound request a UUID that is attached to the request
//! extensions and echoed back in the `x-request-id` response header, so a
//! single request can be correlated across gateway and upstream logs.

use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::Next,
    response::Response,
};

/// Extension type carrying the request id.
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

/// Attach a fresh request id and echo it in the response.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = uuid::Uuid::new_v4().to_string();
    req.extensions_mut().insert(RequestId(id.clone()));

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}
