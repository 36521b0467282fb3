use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Aggregated marks for one (class, subject, evaluation type) group.
/// Averages are on the /20 scale whatever the evaluation's own scale.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct EvaluationStatsRow {
    pub classe_id: i64,
    pub classe: String,
    pub matiere: String,
    pub type_evaluation: String,
    pub nb_evaluations: i64,
    pub nb_notes: i64,
    pub moyenne: Option<f64>,
    pub note_min: Option<f64>,
    pub note_max: Option<f64>,
    pub nb_reussites: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationStats {
    #[serde(flatten)]
    pub row: EvaluationStatsRow,
    pub taux_reussite: f64,
}

#[derive(Debug, Deserialize)]
pub struct EvaluationReportQuery {
    pub classe_id: Option<i64>,
    pub periode: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct StaffMember {
    pub id: i64,
    pub matricule: String,
    pub nom: String,
    pub prenom: String,
    pub fonction: String,
    pub salaire_base: i64,
    pub date_embauche: NaiveDate,
}

/// Computed pay for one staff member and month. All amounts in francs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Payslip {
    pub salaire_base: i64,
    pub annees_anciennete: i64,
    pub prime_anciennete: i64,
    pub prime_fonction: i64,
    pub indemnite_transport: i64,
    pub salaire_brut: i64,
    pub cnss_salarie: i64,
    pub cnss_patronal: i64,
    pub base_imposable: i64,
    pub impot: i64,
    pub salaire_net: i64,
    pub cout_employeur: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PayrollLine {
    pub personnel_id: i64,
    pub matricule: String,
    pub nom: String,
    pub prenom: String,
    pub fonction: String,
    #[serde(flatten)]
    pub payslip: Payslip,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PayrollTotals {
    pub salaire_brut: i64,
    pub cnss_salarie: i64,
    pub cnss_patronal: i64,
    pub impot: i64,
    pub salaire_net: i64,
    pub cout_employeur: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PayrollReport {
    pub mois: u32,
    pub annee: i32,
    pub lignes: Vec<PayrollLine>,
    pub totaux: PayrollTotals,
}

#[derive(Debug, Deserialize)]
pub struct PayrollQuery {
    pub mois: Option<u32>,
    pub annee: Option<i32>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TransferStatsRow {
    pub type_mouvement: String,
    pub statut: String,
    pub total: i64,
}

#[derive(Debug, Deserialize)]
pub struct TransferStatsQuery {
    pub annee: Option<i32>,
}
