use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::student::NewStudent;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MovementType {
    TransfertEntrant,
    TransfertSortant,
    SortieDefinitive,
}

impl MovementType {
    pub fn as_str(self) -> &'static str {
        match self {
            MovementType::TransfertEntrant => "transfert_entrant",
            MovementType::TransfertSortant => "transfert_sortant",
            MovementType::SortieDefinitive => "sortie_definitive",
        }
    }

    /// Outgoing movements close the student's enrolment on completion.
    pub fn is_departure(self) -> bool {
        !matches!(self, MovementType::TransfertEntrant)
    }
}

impl std::fmt::Display for MovementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MovementType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transfert_entrant" => Ok(MovementType::TransfertEntrant),
            "transfert_sortant" => Ok(MovementType::TransfertSortant),
            "sortie_definitive" => Ok(MovementType::SortieDefinitive),
            _ => Err(anyhow::anyhow!("Unknown type_mouvement: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    EnAttente,
    Approuve,
    Rejete,
    Complete,
}

impl TransferStatus {
    pub const ALL: [TransferStatus; 4] = [
        TransferStatus::EnAttente,
        TransferStatus::Approuve,
        TransferStatus::Rejete,
        TransferStatus::Complete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::EnAttente => "en_attente",
            TransferStatus::Approuve => "approuve",
            TransferStatus::Rejete => "rejete",
            TransferStatus::Complete => "complete",
        }
    }

    /// Statuses that block a new request for the same student.
    pub fn is_active(self) -> bool {
        matches!(self, TransferStatus::EnAttente | TransferStatus::Approuve)
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransferStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "en_attente" => Ok(TransferStatus::EnAttente),
            "approuve" => Ok(TransferStatus::Approuve),
            "rejete" => Ok(TransferStatus::Rejete),
            "complete" => Ok(TransferStatus::Complete),
            _ => Err(anyhow::anyhow!("Unknown statut: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Creation,
    Modification,
    Approbation,
    Rejet,
    Completion,
}

impl HistoryAction {
    pub fn as_str(self) -> &'static str {
        match self {
            HistoryAction::Creation => "creation",
            HistoryAction::Modification => "modification",
            HistoryAction::Approbation => "approbation",
            HistoryAction::Rejet => "rejet",
            HistoryAction::Completion => "completion",
        }
    }
}

/// Staff action driving the status field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransitionAction {
    Approve,
    Reject,
    Complete,
    Reopen,
}

impl TransitionAction {
    pub fn as_str(self) -> &'static str {
        match self {
            TransitionAction::Approve => "approve",
            TransitionAction::Reject => "reject",
            TransitionAction::Complete => "complete",
            TransitionAction::Reopen => "reopen",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BulkAction {
    Approve,
    Reject,
    Complete,
    GenerateCertificates,
}

/// One movement request. Enum-like columns are kept as TEXT and parsed on use.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Transfer {
    pub id: i64,
    pub eleve_id: i64,
    pub type_mouvement: String,
    pub ecole_origine: Option<String>,
    pub ecole_destination: Option<String>,
    pub classe_origine_id: Option<i64>,
    pub classe_destination_id: Option<i64>,
    pub motif: String,
    pub date_demande: NaiveDate,
    pub date_effective: Option<NaiveDate>,
    pub statut: String,
    pub frais_transfert: i64,
    pub frais_payes: i64,
    pub observations: Option<String>,
    pub traite_par: Option<i64>,
    pub date_traitement: Option<DateTime<Utc>>,
    pub approuve_par: Option<i64>,
    pub date_approbation: Option<DateTime<Utc>>,
    pub certificat_genere: bool,
    pub numero_certificat: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Transfer {
    pub fn status(&self) -> anyhow::Result<TransferStatus> {
        self.statut.parse()
    }

    pub fn movement(&self) -> anyhow::Result<MovementType> {
        self.type_mouvement.parse()
    }
}

/// Listing row: transfer joined with the student's name.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TransferListItem {
    pub id: i64,
    pub eleve_id: i64,
    pub matricule: String,
    pub eleve_nom: String,
    pub eleve_prenom: String,
    pub type_mouvement: String,
    pub ecole_origine: Option<String>,
    pub ecole_destination: Option<String>,
    pub motif: String,
    pub date_demande: NaiveDate,
    pub date_effective: Option<NaiveDate>,
    pub statut: String,
    pub frais_transfert: i64,
    pub frais_payes: i64,
    pub numero_certificat: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TransferDocument {
    pub id: i64,
    pub transfer_id: i64,
    pub nom_document: String,
    pub type_document: String,
    pub obligatoire: bool,
    pub fourni: bool,
    pub date_upload: Option<DateTime<Utc>>,
    pub chemin_fichier: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TransferFee {
    pub id: i64,
    pub transfer_id: i64,
    pub type_frais: String,
    pub libelle: String,
    pub montant: i64,
    pub paye: bool,
    pub date_paiement: Option<NaiveDate>,
    pub mode_paiement: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TransferHistory {
    pub id: i64,
    pub transfer_id: i64,
    pub action: String,
    pub ancien_statut: Option<String>,
    pub nouveau_statut: String,
    pub commentaire: Option<String>,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct TransferDetail {
    pub transfer: Transfer,
    pub eleve_nom: String,
    pub eleve_prenom: String,
    pub matricule: String,
    pub documents: Vec<TransferDocument>,
    pub fees: Vec<TransferFee>,
    pub history: Vec<TransferHistory>,
    pub documents_manquants: usize,
    pub reste_a_payer: i64,
}

// Request DTOs

/// Body for POST /transfers. Required fields are optional here so that every
/// missing one can be reported at once.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateTransferRequest {
    pub type_mouvement: Option<String>,
    pub eleve_id: Option<i64>,
    pub nouvel_eleve: Option<NewStudent>,
    pub motif: Option<String>,
    pub date_demande: Option<NaiveDate>,
    pub date_effective: Option<NaiveDate>,
    pub ecole_origine: Option<String>,
    pub ecole_destination: Option<String>,
    pub classe_origine_id: Option<i64>,
    pub classe_destination_id: Option<i64>,
    pub frais_transfert: Option<i64>,
    pub observations: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    pub action: TransitionAction,
    pub commentaire: Option<String>,
    pub date_effective: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct BulkTransitionRequest {
    pub action: BulkAction,
    pub selected_transfers: Vec<i64>,
    pub commentaire: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct BulkOutcome {
    pub processed: Vec<i64>,
    pub skipped: Vec<SkippedTransfer>,
}

#[derive(Debug, Serialize)]
pub struct SkippedTransfer {
    pub id: i64,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateDocumentsRequest {
    /// Ids of the checklist rows now supplied; every other row is unchecked.
    pub documents: Vec<i64>,
    pub commentaire: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FeePaymentInput {
    pub paid: bool,
    pub date_paiement: Option<NaiveDate>,
    pub mode_paiement: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateFeesRequest {
    pub fees: HashMap<i64, FeePaymentInput>,
    pub commentaire: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CommentRequest {
    pub commentaire: String,
}

/// Query params for GET /transfers and GET /transfers/export.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransferQuery {
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub type_mouvement: Option<String>,
    pub eleve_id: Option<i64>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub q: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
    pub format: Option<String>,
}
