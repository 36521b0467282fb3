use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Value};

use crate::{
    error::to_response,
    middleware::auth::require,
    models::{
        auth::AuthenticatedUser,
        transfer::{
            BulkAction, BulkTransitionRequest, CommentRequest, CreateTransferRequest, TransferQuery,
            TransitionRequest, TransitionAction, UpdateDocumentsRequest, UpdateFeesRequest,
        },
        user::Permission,
    },
    services::{
        export::{transfers_to_csv, ExportFormat},
        filters::{page_window, TransferFilter},
        transfers::TransferService,
    },
    AppState,
};

type ApiResult<T> = Result<T, (StatusCode, Json<Value>)>;

/// Completion and reopening are office work; approval decisions are not.
fn transition_permission(action: TransitionAction) -> Permission {
    match action {
        TransitionAction::Approve | TransitionAction::Reject => Permission::ApproveTransfers,
        TransitionAction::Complete | TransitionAction::Reopen => Permission::ManageTransfers,
    }
}

pub async fn list_transfers(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(params): Query<TransferQuery>,
) -> ApiResult<Json<Value>> {
    require(&user, Permission::ViewTransfers)?;

    let filter = TransferFilter::from_query(&params).map_err(|e| to_response(e.into()))?;
    let (limit, offset) = page_window(params.page, params.per_page);

    let (transfers, total) = TransferService::list(&state.db, &filter, limit, offset)
        .await
        .map_err(to_response)?;

    Ok(Json(json!({
        "transfers": transfers,
        "total":     total,
        "page":      offset / limit + 1,
        "per_page":  limit,
    })))
}

pub async fn export_transfers(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(params): Query<TransferQuery>,
) -> ApiResult<impl IntoResponse> {
    require(&user, Permission::ViewTransfers)?;

    let format = ExportFormat::parse(params.format.as_deref()).map_err(|e| to_response(e.into()))?;
    let filter = TransferFilter::from_query(&params).map_err(|e| to_response(e.into()))?;

    let rows = TransferService::list_for_export(&state.db, &filter)
        .await
        .map_err(to_response)?;
    let body = match format {
        ExportFormat::Csv => transfers_to_csv(&rows).map_err(to_response)?,
    };

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (header::CONTENT_DISPOSITION, "attachment; filename=\"transferts.csv\""),
        ],
        body,
    ))
}

pub async fn create_transfer(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<CreateTransferRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    require(&user, Permission::ManageTransfers)?;

    let transfer = TransferService::create(&state.db, user.user_id, state.config.frais_certificat, &body)
        .await
        .map_err(to_response)?;
    let detail = TransferService::get(&state.db, transfer.id)
        .await
        .map_err(to_response)?;

    Ok((StatusCode::CREATED, Json(serde_json::to_value(detail).unwrap())))
}

pub async fn get_transfer(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    require(&user, Permission::ViewTransfers)?;

    TransferService::get(&state.db, id)
        .await
        .map(|detail| Json(serde_json::to_value(detail).unwrap()))
        .map_err(to_response)
}

pub async fn transition_transfer(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<i64>,
    Json(body): Json<TransitionRequest>,
) -> ApiResult<Json<Value>> {
    require(&user, transition_permission(body.action))?;

    TransferService::transition(
        &state.db,
        id,
        body.action,
        body.commentaire.as_deref(),
        body.date_effective,
        user.user_id,
    )
    .await
    .map(|t| Json(serde_json::to_value(t).unwrap()))
    .map_err(to_response)
}

pub async fn bulk_transition(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<BulkTransitionRequest>,
) -> ApiResult<Json<Value>> {
    let permission = match body.action {
        BulkAction::Approve => transition_permission(TransitionAction::Approve),
        BulkAction::Reject => transition_permission(TransitionAction::Reject),
        BulkAction::Complete => transition_permission(TransitionAction::Complete),
        BulkAction::GenerateCertificates => Permission::ManageTransfers,
    };
    require(&user, permission)?;

    TransferService::bulk(
        &state.db,
        body.action,
        &body.selected_transfers,
        body.commentaire.as_deref(),
        user.user_id,
    )
    .await
    .map(|outcome| {
        Json(json!({
            "message": format!("{} transfert(s) traité(s)", outcome.processed.len()),
            "processed": outcome.processed,
            "skipped": outcome.skipped,
        }))
    })
    .map_err(to_response)
}

pub async fn update_documents(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<i64>,
    Json(body): Json<UpdateDocumentsRequest>,
) -> ApiResult<Json<Value>> {
    require(&user, Permission::ManageTransfers)?;

    TransferService::update_documents(
        &state.db,
        id,
        &body.documents,
        body.commentaire.as_deref(),
        user.user_id,
    )
    .await
    .map(|docs| Json(serde_json::to_value(docs).unwrap()))
    .map_err(to_response)
}

pub async fn upload_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((id, document_id)): Path<(i64, i64)>,
    multipart: Multipart,
) -> ApiResult<Json<Value>> {
    require(&user, Permission::ManageTransfers)?;

    TransferService::upload_document(
        &state.db,
        &state.config.upload_dir,
        id,
        document_id,
        user.user_id,
        multipart,
    )
    .await
    .map(|doc| Json(serde_json::to_value(doc).unwrap()))
    .map_err(to_response)
}

pub async fn update_fees(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<i64>,
    Json(body): Json<UpdateFeesRequest>,
) -> ApiResult<Json<Value>> {
    require(&user, Permission::ManageTransferFees)?;

    TransferService::update_fees(
        &state.db,
        id,
        &body.fees,
        body.commentaire.as_deref(),
        user.user_id,
    )
    .await
    .map(|fees| Json(serde_json::to_value(fees).unwrap()))
    .map_err(to_response)
}

pub async fn add_comment(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<i64>,
    Json(body): Json<CommentRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    require(&user, Permission::ViewTransfers)?;

    TransferService::add_comment(&state.db, id, &body.commentaire, user.user_id)
        .await
        .map(|entry| (StatusCode::CREATED, Json(serde_json::to_value(entry).unwrap())))
        .map_err(to_response)
}
