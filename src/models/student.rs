use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Student {
    pub id: i64,
    pub matricule: String,
    pub nom: String,
    pub prenom: String,
    pub date_naissance: Option<NaiveDate>,
    pub sexe: Option<String>,
    pub statut: String, // "actif", "transfere", "diplome", "inactif"
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Inscription {
    pub id: i64,
    pub eleve_id: i64,
    pub classe_id: i64,
    pub classe_nom: String,
    pub annee_scolaire: String,
    pub statut: String,
    pub date_inscription: NaiveDate,
}

/// Student row joined with the class of its active inscription, if any.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StudentSummary {
    pub id: i64,
    pub matricule: String,
    pub nom: String,
    pub prenom: String,
    pub statut: String,
    pub classe_id: Option<i64>,
    pub classe_nom: Option<String>,
}

/// New-student fields supplied with an incoming transfer.
#[derive(Debug, Clone, Deserialize)]
pub struct NewStudent {
    pub matricule: Option<String>,
    pub nom: Option<String>,
    pub prenom: Option<String>,
    pub date_naissance: Option<NaiveDate>,
    pub sexe: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StudentQuery {
    pub q: Option<String>,
    pub classe_id: Option<i64>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}
