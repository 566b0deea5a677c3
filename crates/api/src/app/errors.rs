use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use taskflow_infra::ServiceError;

pub fn service_error_to_response(err: ServiceError) -> axum::response::Response {
    match err {
        ServiceError::Validation(e) => json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
        ServiceError::NotFound(_) => not_found(),
        ServiceError::Store(e) => {
            tracing::error!(error = %e, "task store error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
        ServiceError::Queue { task_id, source } => {
            tracing::error!(%task_id, error = %source, "failed to enqueue task");
            json_error(
                StatusCode::BAD_GATEWAY,
                "queue_error",
                format!("task {task_id} was created but could not be queued: {source}"),
            )
        }
    }
}

pub fn not_found() -> axum::response::Response {
    json_error(StatusCode::NOT_FOUND, "not_found", "Task not found")
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
