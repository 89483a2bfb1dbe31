//! Request helpers shared by the handlers

use axum::http::{HeaderMap, header};

use crate::api::error::ApiError;

/// Require an `application/json` body, with or without a charset parameter
///
/// Lookalikes such as `application/jsonp`, `application/json-patch+json` and
/// `text/json` are rejected.
pub fn require_json(headers: &HeaderMap) -> Result<mime::Mime, ApiError> {
    let raw = headers
        .get(header::CONTENT_TYPE)
        .ok_or_else(|| ApiError::InvalidPayload("missing Content-Type header".into()))?
        .to_str()
        .map_err(|_| ApiError::InvalidPayload("Content-Type is not valid ASCII".into()))?;

    let media_type: mime::Mime = raw
        .parse()
        .map_err(|_| ApiError::InvalidPayload(format!("invalid Content-Type: {raw}")))?;

    if media_type.type_() != mime::APPLICATION || media_type.subtype() != mime::JSON {
        return Err(ApiError::InvalidPayload(format!(
            "Content-Type must be application/json, got: {}",
            media_type.essence_str()
        )));
    }

    Ok(media_type)
}

/// Reject bodies larger than `max_size` bytes
pub fn validate_body_size(data: &[u8], max_size: usize) -> Result<(), ApiError> {
    match data.len() {
        len if len > max_size => Err(ApiError::PayloadTooLarge(len)),
        _ => Ok(()),
    }
}
