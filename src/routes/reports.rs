use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{Datelike, Utc};
use serde_json::{json, Value};

use crate::{
    error::{to_response, ServiceError},
    middleware::auth::require,
    models::{
        auth::AuthenticatedUser,
        report::{EvaluationReportQuery, PayrollQuery, TransferStatsQuery},
        user::Permission,
    },
    services::{payroll::PayrollRules, reports::ReportService},
    AppState,
};

pub async fn evaluation_report(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(params): Query<EvaluationReportQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    require(&user, Permission::ViewEvaluationReports)?;

    let periode = params.periode.as_deref().filter(|p| !p.trim().is_empty());
    ReportService::evaluation_stats(&state.db, params.classe_id, periode)
        .await
        .map(|stats| Json(json!({ "statistiques": stats })))
        .map_err(to_response)
}

pub async fn payroll_report(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(params): Query<PayrollQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    require(&user, Permission::ViewPayroll)?;

    let today = Utc::now().date_naive();
    let mois = params.mois.unwrap_or(today.month());
    let annee = params.annee.unwrap_or(today.year());
    if !(1..=12).contains(&mois) {
        return Err(to_response(
            ServiceError::Validation(vec![format!("Mois invalide : {mois}")]).into(),
        ));
    }

    ReportService::payroll(&state.db, &PayrollRules::default(), mois, annee)
        .await
        .map(|report| Json(serde_json::to_value(report).unwrap()))
        .map_err(to_response)
}

pub async fn transfer_report(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(params): Query<TransferStatsQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    require(&user, Permission::ViewTransfers)?;

    let annee = params.annee.unwrap_or_else(|| Utc::now().year());
    ReportService::transfer_stats(&state.db, annee)
        .await
        .map(|rows| Json(json!({ "annee": annee, "statistiques": rows })))
        .map_err(to_response)
}
