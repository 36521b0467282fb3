//! Transfer workflow rules: legal transitions, document checklists, fee
//! schedules and certificate numbering. No I/O here; `TransferService`
//! applies these decisions inside its transactions.

use crate::{
    error::ServiceError,
    models::transfer::{HistoryAction, MovementType, TransferStatus, TransitionAction},
};

/// One row of the document checklist created with a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecklistItem {
    pub type_document: &'static str,
    pub nom_document: &'static str,
    pub obligatoire: bool,
}

const fn doc(type_document: &'static str, nom_document: &'static str, obligatoire: bool) -> ChecklistItem {
    ChecklistItem { type_document, nom_document, obligatoire }
}

const CHECKLIST_ENTRANT: &[ChecklistItem] = &[
    doc("bulletin", "Bulletin de notes", true),
    doc("certificat_scolarite", "Certificat de scolarité", true),
    doc("acte_naissance", "Acte de naissance", true),
    doc("photo", "Photo d'identité", false),
];

const CHECKLIST_SORTANT: &[ChecklistItem] = &[
    doc("bulletin", "Bulletin de notes", true),
    doc("quitus", "Quitus financier", true),
];

const CHECKLIST_SORTIE: &[ChecklistItem] = &[
    doc("bulletin_final", "Bulletin final", true),
    doc("quitus", "Quitus financier", true),
];

pub fn document_checklist(movement: MovementType) -> &'static [ChecklistItem] {
    match movement {
        MovementType::TransfertEntrant => CHECKLIST_ENTRANT,
        MovementType::TransfertSortant => CHECKLIST_SORTANT,
        MovementType::SortieDefinitive => CHECKLIST_SORTIE,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeLine {
    pub type_frais: &'static str,
    pub libelle: &'static str,
    pub montant: i64,
}

/// Fee rows created with a transfer. Nothing is charged unless `amount > 0`.
pub fn fee_schedule(movement: MovementType, amount: i64, certificate_fee: i64) -> Vec<FeeLine> {
    if amount <= 0 {
        return Vec::new();
    }
    match movement {
        MovementType::TransfertEntrant | MovementType::TransfertSortant => vec![
            FeeLine {
                type_frais: "frais_transfert",
                libelle: "Frais de transfert",
                montant: amount,
            },
            FeeLine {
                type_frais: "frais_certificat",
                libelle: "Frais de certificat de transfert",
                montant: certificate_fee.max(0),
            },
        ],
        MovementType::SortieDefinitive => vec![FeeLine {
            type_frais: "frais_certificat_fin",
            libelle: "Frais de certificat de fin de scolarité",
            montant: amount,
        }],
    }
}

/// `CERT` + four-digit year + id padded to six digits.
pub fn certificate_number(year: i32, transfer_id: i64) -> String {
    format!("CERT{year:04}{transfer_id:06}")
}

/// Student status set when an outgoing movement completes.
pub fn student_status_after_completion(movement: MovementType) -> Option<&'static str> {
    match movement {
        MovementType::TransfertEntrant => None,
        MovementType::TransfertSortant => Some("transfere"),
        MovementType::SortieDefinitive => Some("diplome"),
    }
}

/// Statuses an action may start from.
pub fn allowed_from(action: TransitionAction) -> &'static [TransferStatus] {
    match action {
        TransitionAction::Approve | TransitionAction::Reject => &[TransferStatus::EnAttente],
        TransitionAction::Complete => &[TransferStatus::Approuve],
        TransitionAction::Reopen => &[TransferStatus::Approuve, TransferStatus::Rejete],
    }
}

pub fn target_status(action: TransitionAction) -> TransferStatus {
    match action {
        TransitionAction::Approve => TransferStatus::Approuve,
        TransitionAction::Reject => TransferStatus::Rejete,
        TransitionAction::Complete => TransferStatus::Complete,
        TransitionAction::Reopen => TransferStatus::EnAttente,
    }
}

pub fn history_action(action: TransitionAction) -> HistoryAction {
    match action {
        TransitionAction::Approve => HistoryAction::Approbation,
        TransitionAction::Reject => HistoryAction::Rejet,
        TransitionAction::Complete => HistoryAction::Completion,
        TransitionAction::Reopen => HistoryAction::Modification,
    }
}

pub fn requires_comment(action: TransitionAction) -> bool {
    matches!(action, TransitionAction::Reject | TransitionAction::Reopen)
}

/// Returns `Some(trimmed)` for a non-blank comment.
pub fn normalize_comment(comment: Option<&str>) -> Option<String> {
    comment
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}

/// Check the comment rule alone; shared by the single and bulk paths.
pub fn check_comment(action: TransitionAction, comment: Option<&str>) -> Result<(), ServiceError> {
    if requires_comment(action) && normalize_comment(comment).is_none() {
        let msg = match action {
            TransitionAction::Reject => "Un commentaire est obligatoire pour rejeter une demande",
            _ => "Un commentaire est obligatoire pour rouvrir une demande",
        };
        return Err(ServiceError::Validation(vec![msg.to_string()]));
    }
    Ok(())
}

/// Decide the next status for `action`, or explain why it is refused.
pub fn plan_transition(
    current: TransferStatus,
    action: TransitionAction,
    comment: Option<&str>,
) -> Result<TransferStatus, ServiceError> {
    check_comment(action, comment)?;
    if !allowed_from(action).contains(&current) {
        return Err(ServiceError::InvalidTransition {
            current: current.to_string(),
            action: action.as_str().to_string(),
        });
    }
    Ok(target_status(action))
}
