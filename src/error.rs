use axum::{http::StatusCode, Json};
use serde_json::{json, Value};

/// Domain failures raised by the services. Carried inside `anyhow::Error`
/// and recovered by the route layer to pick a status code.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Données invalides")]
    Validation(Vec<String>),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Transition impossible : la demande est au statut « {current} », action « {action} » refusée")]
    InvalidTransition { current: String, action: String },
}

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::Conflict(_) | ServiceError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

/// Convert a service error into the JSON error body used by every handler.
pub fn to_response(err: anyhow::Error) -> (StatusCode, Json<Value>) {
    match err.downcast_ref::<ServiceError>() {
        Some(ServiceError::Validation(errors)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": "Données invalides", "errors": errors })),
        ),
        Some(domain) => (domain.status_code(), Json(json!({ "error": domain.to_string() }))),
        None => {
            tracing::error!("request failed: {err:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string() })),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_keep_every_message() {
        let err = anyhow::Error::new(ServiceError::Validation(vec![
            "Le motif est obligatoire".into(),
            "La date de demande est obligatoire".into(),
        ]));
        let (status, Json(body)) = to_response(err);
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["errors"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn invalid_transition_is_a_conflict() {
        let err = anyhow::Error::new(ServiceError::InvalidTransition {
            current: "complete".into(),
            action: "approve".into(),
        });
        let (status, Json(body)) = to_response(err);
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("complete"));
    }

    #[test]
    fn unknown_errors_are_internal() {
        let (status, _) = to_response(anyhow::anyhow!("connexion perdue"));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
