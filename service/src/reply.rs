//! Canonical JSON replies and error mapping.
//!
//! Every error kind maps to `{"error": <code>}` with its canonical status;
//! nothing beyond the code and the quorum counters ever leaves the process.
//! Full causes go to the log.

use {
    kernel_sdk::error::KernelError,
    serde_json::{json, Value},
    warp::{
        http::StatusCode,
        reply::{Reply, Response},
    },
};

pub fn json_reply(status: StatusCode, body: &Value) -> Response {
    warp::reply::with_status(warp::reply::json(body), status).into_response()
}

pub fn error_reply(err: &KernelError) -> Response {
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    if status.is_server_error() {
        log::error!("request failed: {err:?}");
    } else {
        log::debug!("request rejected: {err}");
    }

    let body = match err {
        KernelError::InsufficientQuorum {
            approvals,
            required,
        } => json!({
            "error": err.code(),
            "approvals": approvals,
            "required": required,
        }),
        _ => json!({"error": err.code()}),
    };
    json_reply(status, &body)
}

/// Fallback for warp-level rejections (unmatched routes, oversized bodies).
pub async fn handle_rejection(
    rejection: warp::Rejection,
) -> Result<Response, std::convert::Infallible> {
    if rejection.is_not_found() {
        return Ok(json_reply(StatusCode::NOT_FOUND, &json!({"error": "not_found"})));
    }
    if rejection
        .find::<warp::reject::PayloadTooLarge>()
        .is_some()
    {
        return Ok(json_reply(
            StatusCode::PAYLOAD_TOO_LARGE,
            &json!({"error": "payload_too_large"}),
        ));
    }
    if rejection
        .find::<warp::reject::LengthRequired>()
        .is_some()
    {
        return Ok(json_reply(
            StatusCode::LENGTH_REQUIRED,
            &json!({"error": "length_required"}),
        ));
    }
    if rejection
        .find::<warp::reject::MethodNotAllowed>()
        .is_some()
    {
        return Ok(json_reply(
            StatusCode::METHOD_NOT_ALLOWED,
            &json!({"error": "method_not_allowed"}),
        ));
    }

    log::error!("unhandled rejection: {rejection:?}");
    Ok(json_reply(
        StatusCode::INTERNAL_SERVER_ERROR,
        &json!({"error": "internal_error"}),
    ))
}
