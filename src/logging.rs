//! Middleware for logging requests and responses.

use axum::{extract::Request, http::header::CONTENT_TYPE, middleware::Next, response::Response};

/// Log the request and response for each request.
///
/// Both the request and response are logged at the `info` level.
/// If the body is longer than [LOG_BODY_LENGTH_LIMIT] bytes, it is truncated
/// and logged in full at the `debug` level. Access tokens and API secrets in
/// JSON bodies are redacted before logging.
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let (headers, body_text) = extract_header_and_body_text_from_request(request).await;

    if headers
        .headers
        .get(CONTENT_TYPE)
        .is_some_and(|content_type| content_type == "application/json")
    {
        let display_text = redact_json_string_field(&body_text, "access_token");
        let display_text = redact_json_string_field(&display_text, "secret");
        log_request(&headers, &display_text);
    } else {
        log_request(&headers, &body_text);
    }

    let request = Request::from_parts(headers, body_text.into());
    let response = next.run(request).await;

    let (headers, body_text) = extract_header_and_body_text_from_response(response).await;
    log_response(&headers, &body_text);

    Response::from_parts(headers, body_text.into())
}

/// Replace the string value of `field_name` in a JSON text with asterisks.
///
/// Works on the raw text rather than a parsed document so that unparseable
/// bodies still get logged (and still get redacted on a best-effort basis).
fn redact_json_string_field(json_text: &str, field_name: &str) -> String {
    let field_pattern = format!("\"{field_name}\"");

    let Some(field_start) = json_text.find(&field_pattern) else {
        return json_text.to_owned();
    };

    let value_search_start = field_start + field_pattern.len();
    let Some(quote_offset) = json_text[value_search_start..].find('"') else {
        return json_text.to_owned();
    };

    let value_start = value_search_start + quote_offset + 1;
    let Some(value_length) = json_text[value_start..].find('"') else {
        return json_text.to_owned();
    };

    let mut redacted = json_text.to_owned();
    redacted.replace_range(value_start..value_start + value_length, "********");
    redacted
}

async fn extract_header_and_body_text_from_request(
    request: Request,
) -> (axum::http::request::Parts, String) {
    let (headers, body) = request.into_parts();
    let body_bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap_or_default();

    (headers, String::from_utf8_lossy(&body_bytes).to_string())
}

async fn extract_header_and_body_text_from_response(
    response: Response,
) -> (axum::http::response::Parts, String) {
    let (headers, body) = response.into_parts();
    let body_bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap_or_default();

    (headers, String::from_utf8_lossy(&body_bytes).to_string())
}

/// The maximum body length to log at the `info` level.
pub const LOG_BODY_LENGTH_LIMIT: usize = 256;

fn log_request(headers: &axum::http::request::Parts, body: &str) {
    if body.len() > LOG_BODY_LENGTH_LIMIT {
        tracing::info!(
            "Received request: {} {}\nbody: {:}...",
            headers.method,
            headers.uri,
            &body[..LOG_BODY_LENGTH_LIMIT]
        );
        tracing::debug!("Full request body: {body:?}");
    } else {
        tracing::info!(
            "Received request: {} {}\nbody: {body:?}",
            headers.method,
            headers.uri
        );
    }
}

fn log_response(headers: &axum::http::response::Parts, body: &str) {
    if body.len() > LOG_BODY_LENGTH_LIMIT {
        tracing::info!(
            "Sending response: {}\nbody: {:}...",
            headers.status,
            &body[..LOG_BODY_LENGTH_LIMIT]
        );
        tracing::debug!("Full response body: {body:?}");
    } else {
        tracing::info!("Sending response: {}\nbody: {body:?}", headers.status);
    }
}
