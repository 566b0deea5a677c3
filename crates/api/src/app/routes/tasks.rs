use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use taskflow_core::{TaskDto, TaskId};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_task).get(list_tasks))
        .route("/:id", get(get_task))
}

pub async fn create_task(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<dto::CreateTaskRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_json", rejection.body_text());
        }
    };

    let Some((name, description)) = body.required_fields() else {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "Missing required fields: name, description",
        );
    };

    match services.tasks.submit(name, description).await {
        Ok(task) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "success": true,
                "message": "Task created and queued for processing",
                "data": task.to_dto(),
            })),
        )
            .into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn list_tasks(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.tasks.list().await {
        Ok(tasks) => {
            let data: Vec<TaskDto> = tasks.iter().map(TaskDto::from).collect();
            Json(serde_json::json!({
                "success": true,
                "count": data.len(),
                "data": data,
            }))
            .into_response()
        }
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn get_task(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    // An id that cannot be parsed cannot exist either.
    let id: TaskId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::not_found(),
    };

    match services.tasks.get(id).await {
        Ok(task) => Json(serde_json::json!({
            "success": true,
            "data": task.to_dto(),
        }))
        .into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}
