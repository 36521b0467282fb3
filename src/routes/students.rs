use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};

use crate::{
    error::to_response,
    middleware::auth::require,
    models::{auth::AuthenticatedUser, student::StudentQuery, user::Permission},
    services::students::StudentService,
    AppState,
};

pub async fn list_students(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(params): Query<StudentQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    require(&user, Permission::ViewStudents)?;

    StudentService::list(&state.db, &params)
        .await
        .map(|s| Json(serde_json::to_value(s).unwrap()))
        .map_err(to_response)
}

pub async fn get_student(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<i64>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    require(&user, Permission::ViewStudents)?;

    StudentService::get(&state.db, id)
        .await
        .map(|(student, inscriptions)| {
            Json(json!({ "eleve": student, "inscriptions": inscriptions }))
        })
        .map_err(to_response)
}
