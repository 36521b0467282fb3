use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use axum::extract::Multipart;
use chrono::{Datelike, NaiveDate, Utc};
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    db,
    error::ServiceError,
    models::{
        student::NewStudent,
        transfer::{
            BulkAction, BulkOutcome, CreateTransferRequest, FeePaymentInput, HistoryAction,
            MovementType, SkippedTransfer, Transfer, TransferDetail, TransferDocument,
            TransferFee, TransferHistory, TransferListItem, TransferStatus, TransitionAction,
        },
    },
    services::{filters::TransferFilter, metrics, workflow},
};

const ACTIVE_TRANSFER_EXISTS: &str = "Une demande de transfert est déjà en cours pour cet élève";
const ACTIVE_TRANSFER_INDEX: &str = "transfers_one_active_per_student";
const MATRICULE_TAKEN: &str = "Ce matricule est déjà attribué à un autre élève";

pub const PAYMENT_MODES: &[&str] = &["especes", "cheque", "virement", "mobile_money"];
pub const UPLOAD_EXTENSIONS: &[&str] = &["pdf", "jpg", "jpeg", "png"];
pub const UPLOAD_MAX_BYTES: usize = 10 * 1024 * 1024;

/// Listing columns shared by the paginated list and the export.
const LIST_SELECT: &str = "SELECT t.id, t.eleve_id, e.matricule, e.nom AS eleve_nom, e.prenom AS eleve_prenom,
        t.type_mouvement, t.ecole_origine, t.ecole_destination, t.motif, t.date_demande,
        t.date_effective, t.statut, t.frais_transfert, t.frais_payes, t.numero_certificat
 FROM transfers t
 JOIN eleves e ON e.id = t.eleve_id";

/// Maximum number of rows written by an export.
const EXPORT_LIMIT: i64 = 10_000;

#[derive(Debug, Clone, PartialEq)]
pub enum StudentRef {
    Existing(i64),
    New(ValidNewStudent),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidNewStudent {
    pub matricule: String,
    pub nom: String,
    pub prenom: String,
    pub date_naissance: Option<NaiveDate>,
    pub sexe: Option<String>,
}

/// A creation request that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransfer {
    pub student: StudentRef,
    pub movement: MovementType,
    pub motif: String,
    pub date_demande: NaiveDate,
    pub date_effective: Option<NaiveDate>,
    pub ecole_origine: Option<String>,
    pub ecole_destination: Option<String>,
    pub classe_origine_id: Option<i64>,
    pub classe_destination_id: Option<i64>,
    pub frais_transfert: i64,
    pub observations: Option<String>,
}

fn trimmed(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Check every required field of a creation request and report all the
/// problems at once.
pub fn validate_create(req: &CreateTransferRequest) -> Result<NewTransfer, ServiceError> {
    let mut errors = Vec::new();

    let movement = match trimmed(&req.type_mouvement) {
        None => {
            errors.push("Le type de mouvement est obligatoire".to_string());
            None
        }
        Some(s) => match s.parse::<MovementType>() {
            Ok(m) => Some(m),
            Err(_) => {
                errors.push(format!("Type de mouvement inconnu : {s}"));
                None
            }
        },
    };

    let student = match (req.eleve_id, &req.nouvel_eleve) {
        (Some(id), _) => Some(StudentRef::Existing(id)),
        (None, Some(new)) => {
            if movement.is_some_and(MovementType::is_departure) {
                errors.push(
                    "Un nouvel élève ne peut être enregistré que pour un transfert entrant"
                        .to_string(),
                );
                None
            } else {
                validate_new_student(new, &mut errors).map(StudentRef::New)
            }
        }
        (None, None) => {
            errors.push("L'élève est obligatoire".to_string());
            None
        }
    };

    let motif = trimmed(&req.motif);
    if motif.is_none() {
        errors.push("Le motif est obligatoire".to_string());
    }
    if req.date_demande.is_none() {
        errors.push("La date de demande est obligatoire".to_string());
    }

    let ecole_destination = trimmed(&req.ecole_destination);
    if movement == Some(MovementType::TransfertSortant) && ecole_destination.is_none() {
        errors.push("L'école de destination est obligatoire pour un transfert sortant".to_string());
    }

    if let (Some(demande), Some(effective)) = (req.date_demande, req.date_effective) {
        if effective < demande {
            errors.push("La date effective ne peut précéder la date de demande".to_string());
        }
    }

    let frais = req.frais_transfert.unwrap_or(0);
    if frais < 0 {
        errors.push("Le montant des frais ne peut être négatif".to_string());
    }

    match (movement, student, motif, req.date_demande) {
        (Some(movement), Some(student), Some(motif), Some(date_demande)) if errors.is_empty() => {
            Ok(NewTransfer {
                student,
                movement,
                motif,
                date_demande,
                date_effective: req.date_effective,
                ecole_origine: trimmed(&req.ecole_origine),
                ecole_destination,
                classe_origine_id: req.classe_origine_id,
                classe_destination_id: req.classe_destination_id,
                frais_transfert: frais,
                observations: trimmed(&req.observations),
            })
        }
        _ => Err(ServiceError::Validation(errors)),
    }
}

fn validate_new_student(new: &NewStudent, errors: &mut Vec<String>) -> Option<ValidNewStudent> {
    let matricule = trimmed(&new.matricule);
    let nom = trimmed(&new.nom);
    let prenom = trimmed(&new.prenom);
    let before = errors.len();

    if matricule.is_none() {
        errors.push("Le matricule du nouvel élève est obligatoire".to_string());
    }
    if nom.is_none() {
        errors.push("Le nom du nouvel élève est obligatoire".to_string());
    }
    if prenom.is_none() {
        errors.push("Le prénom du nouvel élève est obligatoire".to_string());
    }
    let sexe = trimmed(&new.sexe).map(|s| s.to_uppercase());
    if let Some(s) = &sexe {
        if s != "M" && s != "F" {
            errors.push("Le sexe doit être M ou F".to_string());
        }
    }

    if errors.len() > before {
        return None;
    }
    Some(ValidNewStudent {
        matricule: matricule?,
        nom: nom?,
        prenom: prenom?,
        date_naissance: new.date_naissance,
        sexe,
    })
}

/// School year label ("2024-2025") containing `date`; years start in September.
pub fn school_year(date: NaiveDate) -> String {
    let start = if date.month() >= 9 { date.year() } else { date.year() - 1 };
    format!("{}-{}", start, start + 1)
}

/// Reject unknown payment modes before touching the database.
pub fn validate_fee_inputs(fees: &HashMap<i64, FeePaymentInput>) -> Result<(), ServiceError> {
    let mut errors: Vec<String> = fees
        .iter()
        .filter_map(|(id, input)| {
            let mode = input.mode_paiement.as_deref()?;
            (!PAYMENT_MODES.contains(&mode))
                .then(|| format!("Mode de paiement invalide pour le frais {id} : {mode}"))
        })
        .collect();
    errors.sort();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ServiceError::Validation(errors))
    }
}

pub struct TransferService;

impl TransferService {
    /// Create a transfer with its checklist, fee rows and first history entry,
    /// all in one transaction.
    pub async fn create(
        pool: &PgPool,
        user_id: i64,
        certificate_fee: i64,
        req: &CreateTransferRequest,
    ) -> anyhow::Result<Transfer> {
        let input = validate_create(req)?;

        let mut tx = pool.begin().await?;

        for class_id in [input.classe_origine_id, input.classe_destination_id].into_iter().flatten() {
            ensure_class_exists(&mut tx, class_id).await?;
        }

        let eleve_id = match &input.student {
            StudentRef::Existing(id) => {
                let statut: Option<String> =
                    sqlx::query_scalar("SELECT statut FROM eleves WHERE id = $1")
                        .bind(id)
                        .fetch_optional(&mut *tx)
                        .await?;
                match statut {
                    None => return Err(ServiceError::NotFound("Élève introuvable".into()).into()),
                    Some(s) if input.movement.is_departure() && s != "actif" => {
                        return Err(ServiceError::Conflict(format!(
                            "L'élève n'est plus actif (statut « {s} »)"
                        ))
                        .into())
                    }
                    Some(_) => *id,
                }
            }
            StudentRef::New(student) => {
                insert_student(&mut tx, student, input.classe_destination_id, input.date_demande)
                    .await?
            }
        };

        if has_active_transfer(&mut tx, eleve_id, None).await? {
            return Err(ServiceError::Conflict(ACTIVE_TRANSFER_EXISTS.into()).into());
        }

        let classe_origine_id = match input.classe_origine_id {
            Some(id) => Some(id),
            None if input.movement.is_departure() => {
                sqlx::query_scalar(
                    "SELECT classe_id FROM inscriptions
                     WHERE eleve_id = $1 AND statut = 'active'
                     ORDER BY date_inscription DESC LIMIT 1",
                )
                .bind(eleve_id)
                .fetch_optional(&mut *tx)
                .await?
            }
            None => None,
        };

        let fees = workflow::fee_schedule(input.movement, input.frais_transfert, certificate_fee);
        let total: i64 = fees.iter().map(|f| f.montant).sum();

        let inserted = sqlx::query_as::<_, Transfer>(
            "INSERT INTO transfers
                (eleve_id, type_mouvement, ecole_origine, ecole_destination, classe_origine_id,
                 classe_destination_id, motif, date_demande, date_effective, statut,
                 frais_transfert, observations, traite_par, date_traitement)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'en_attente', $10, $11, $12, NOW())
             RETURNING *",
        )
        .bind(eleve_id)
        .bind(input.movement.as_str())
        .bind(&input.ecole_origine)
        .bind(&input.ecole_destination)
        .bind(classe_origine_id)
        .bind(input.classe_destination_id)
        .bind(&input.motif)
        .bind(input.date_demande)
        .bind(input.date_effective)
        .bind(total)
        .bind(&input.observations)
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await;

        let transfer = match inserted {
            Ok(t) => t,
            Err(e) if db::is_unique_violation(&e, ACTIVE_TRANSFER_INDEX) => {
                return Err(ServiceError::Conflict(ACTIVE_TRANSFER_EXISTS.into()).into())
            }
            Err(e) => return Err(e.into()),
        };

        for item in workflow::document_checklist(input.movement) {
            sqlx::query(
                "INSERT INTO transfer_documents (transfer_id, nom_document, type_document, obligatoire)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(transfer.id)
            .bind(item.nom_document)
            .bind(item.type_document)
            .bind(item.obligatoire)
            .execute(&mut *tx)
            .await?;
        }

        for fee in &fees {
            sqlx::query(
                "INSERT INTO transfer_fees (transfer_id, type_frais, libelle, montant)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(transfer.id)
            .bind(fee.type_frais)
            .bind(fee.libelle)
            .bind(fee.montant)
            .execute(&mut *tx)
            .await?;
        }

        append_history(
            &mut tx,
            transfer.id,
            HistoryAction::Creation,
            None,
            TransferStatus::EnAttente,
            Some("Demande créée"),
            user_id,
        )
        .await?;

        tx.commit().await?;

        metrics::TRANSFERS_CREATED
            .with_label_values(&[input.movement.as_str()])
            .inc();
        info!(
            "Transfer {} created for student {} ({})",
            transfer.id, eleve_id, input.movement
        );
        Ok(transfer)
    }

    pub async fn get(pool: &PgPool, id: i64) -> anyhow::Result<TransferDetail> {
        let transfer = sqlx::query_as::<_, Transfer>("SELECT * FROM transfers WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Transfert introuvable".into()))?;

        let (matricule, eleve_nom, eleve_prenom): (String, String, String) =
            sqlx::query_as("SELECT matricule, nom, prenom FROM eleves WHERE id = $1")
                .bind(transfer.eleve_id)
                .fetch_one(pool)
                .await?;

        let documents = sqlx::query_as::<_, TransferDocument>(
            "SELECT * FROM transfer_documents WHERE transfer_id = $1 ORDER BY id",
        )
        .bind(id)
        .fetch_all(pool)
        .await?;

        let fees = sqlx::query_as::<_, TransferFee>(
            "SELECT * FROM transfer_fees WHERE transfer_id = $1 ORDER BY id",
        )
        .bind(id)
        .fetch_all(pool)
        .await?;

        let history = sqlx::query_as::<_, TransferHistory>(
            "SELECT * FROM transfer_history WHERE transfer_id = $1 ORDER BY created_at, id",
        )
        .bind(id)
        .fetch_all(pool)
        .await?;

        let documents_manquants = documents.iter().filter(|d| d.obligatoire && !d.fourni).count();
        let reste_a_payer = fees.iter().filter(|f| !f.paye).map(|f| f.montant).sum();

        Ok(TransferDetail {
            transfer,
            eleve_nom,
            eleve_prenom,
            matricule,
            documents,
            fees,
            history,
            documents_manquants,
            reste_a_payer,
        })
    }

    /// One page of the filtered listing plus the total row count.
    pub async fn list(
        pool: &PgPool,
        filter: &TransferFilter,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<(Vec<TransferListItem>, i64)> {
        let mut count_qb = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM transfers t JOIN eleves e ON e.id = t.eleve_id",
        );
        filter.push_where(&mut count_qb);
        let total: i64 = count_qb.build_query_scalar::<i64>().fetch_one(pool).await?;

        let mut qb = QueryBuilder::<Postgres>::new(LIST_SELECT);
        filter.push_where(&mut qb);
        qb.push(" ORDER BY t.date_demande DESC, t.id DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);
        let rows = qb.build_query_as::<TransferListItem>().fetch_all(pool).await?;

        Ok((rows, total))
    }

    /// Every row matching `filter`, for exports.
    pub async fn list_for_export(
        pool: &PgPool,
        filter: &TransferFilter,
    ) -> anyhow::Result<Vec<TransferListItem>> {
        let mut qb = QueryBuilder::<Postgres>::new(LIST_SELECT);
        filter.push_where(&mut qb);
        qb.push(" ORDER BY t.date_demande DESC, t.id DESC LIMIT ")
            .push_bind(EXPORT_LIMIT);
        let rows = qb.build_query_as::<TransferListItem>().fetch_all(pool).await?;
        Ok(rows)
    }

    /// Apply one status transition. An illegal transition is an error, never
    /// a silent no-op.
    pub async fn transition(
        pool: &PgPool,
        id: i64,
        action: TransitionAction,
        comment: Option<&str>,
        date_effective: Option<NaiveDate>,
        user_id: i64,
    ) -> anyhow::Result<Transfer> {
        workflow::check_comment(action, comment)?;

        let mut tx = pool.begin().await?;
        let transfer = lock_transfer(&mut tx, id)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Transfert introuvable".into()))?;

        let next = match workflow::plan_transition(transfer.status()?, action, comment) {
            Ok(next) => next,
            Err(e) => {
                metrics::record_transition(action.as_str(), "refused");
                return Err(e.into());
            }
        };
        let updated =
            apply_transition(&mut tx, &transfer, action, next, comment, date_effective, user_id)
                .await?;
        tx.commit().await?;

        metrics::record_transition(action.as_str(), "applied");
        info!(
            "Transfer {} moved {} -> {} by user {}",
            id, transfer.statut, updated.statut, user_id
        );
        Ok(updated)
    }

    /// Apply `action` to each selected transfer independently inside one
    /// transaction. Transfers in the wrong status are reported as skipped.
    pub async fn bulk(
        pool: &PgPool,
        action: BulkAction,
        ids: &[i64],
        comment: Option<&str>,
        user_id: i64,
    ) -> anyhow::Result<BulkOutcome> {
        let ids: BTreeSet<i64> = ids.iter().copied().collect();
        if ids.is_empty() {
            return Err(ServiceError::Validation(vec![
                "Aucun transfert sélectionné".to_string(),
            ])
            .into());
        }
        let transition = match action {
            BulkAction::Approve => Some(TransitionAction::Approve),
            BulkAction::Reject => Some(TransitionAction::Reject),
            BulkAction::Complete => Some(TransitionAction::Complete),
            BulkAction::GenerateCertificates => None,
        };
        if let Some(t) = transition {
            workflow::check_comment(t, comment)?;
        }

        let today = Utc::now().date_naive();
        let mut outcome = BulkOutcome::default();
        let mut tx = pool.begin().await?;

        for id in ids {
            let Some(transfer) = lock_transfer(&mut tx, id).await? else {
                outcome.skipped.push(SkippedTransfer {
                    id,
                    reason: "Transfert introuvable".to_string(),
                });
                continue;
            };
            let current = transfer.status()?;

            match transition {
                Some(t) => match workflow::plan_transition(current, t, comment) {
                    Ok(next) => {
                        apply_transition(&mut tx, &transfer, t, next, comment, None, user_id)
                            .await?;
                        metrics::record_transition(t.as_str(), "applied");
                        outcome.processed.push(id);
                    }
                    Err(e) => {
                        metrics::record_transition(t.as_str(), "refused");
                        outcome.skipped.push(SkippedTransfer { id, reason: e.to_string() });
                    }
                },
                None => {
                    if current != TransferStatus::Complete {
                        outcome.skipped.push(SkippedTransfer {
                            id,
                            reason: "Le transfert n'est pas encore complété".to_string(),
                        });
                    } else if transfer.certificat_genere {
                        outcome.skipped.push(SkippedTransfer {
                            id,
                            reason: "Certificat déjà généré".to_string(),
                        });
                    } else {
                        let numero = generate_certificate(&mut tx, &transfer, today).await?;
                        append_history(
                            &mut tx,
                            id,
                            HistoryAction::Modification,
                            Some(current),
                            current,
                            Some(&format!("Certificat {numero} généré")),
                            user_id,
                        )
                        .await?;
                        outcome.processed.push(id);
                    }
                }
            }
        }

        tx.commit().await?;
        info!(
            "Bulk {:?}: {} processed, {} skipped",
            action,
            outcome.processed.len(),
            outcome.skipped.len()
        );
        Ok(outcome)
    }

    /// Mark the listed checklist rows as supplied and every other row as missing.
    pub async fn update_documents(
        pool: &PgPool,
        id: i64,
        supplied: &[i64],
        comment: Option<&str>,
        user_id: i64,
    ) -> anyhow::Result<Vec<TransferDocument>> {
        let mut tx = pool.begin().await?;
        let transfer = lock_transfer(&mut tx, id)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Transfert introuvable".into()))?;

        let known: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM transfer_documents WHERE transfer_id = $1")
                .bind(id)
                .fetch_all(&mut *tx)
                .await?;
        let unknown: Vec<String> = supplied
            .iter()
            .filter(|doc_id| !known.contains(doc_id))
            .map(|doc_id| format!("Document inconnu pour ce transfert : {doc_id}"))
            .collect();
        if !unknown.is_empty() {
            return Err(ServiceError::Validation(unknown).into());
        }

        sqlx::query(
            "UPDATE transfer_documents
             SET fourni = (id = ANY($2)),
                 date_upload = CASE WHEN id = ANY($2) THEN COALESCE(date_upload, NOW()) ELSE NULL END
             WHERE transfer_id = $1",
        )
        .bind(id)
        .bind(supplied)
        .execute(&mut *tx)
        .await?;

        let current = transfer.status()?;
        let note = workflow::normalize_comment(comment)
            .unwrap_or_else(|| "Documents mis à jour".to_string());
        append_history(&mut tx, id, HistoryAction::Modification, Some(current), current, Some(&note), user_id)
            .await?;

        let documents = sqlx::query_as::<_, TransferDocument>(
            "SELECT * FROM transfer_documents WHERE transfer_id = $1 ORDER BY id",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(documents)
    }

    /// Record payments on fee rows and refresh the paid total on the transfer.
    pub async fn update_fees(
        pool: &PgPool,
        id: i64,
        updates: &HashMap<i64, FeePaymentInput>,
        comment: Option<&str>,
        user_id: i64,
    ) -> anyhow::Result<Vec<TransferFee>> {
        validate_fee_inputs(updates)?;
        let today = Utc::now().date_naive();

        let mut tx = pool.begin().await?;
        let transfer = lock_transfer(&mut tx, id)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Transfert introuvable".into()))?;

        let known: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM transfer_fees WHERE transfer_id = $1")
                .bind(id)
                .fetch_all(&mut *tx)
                .await?;
        let mut unknown: Vec<String> = updates
            .keys()
            .filter(|fee_id| !known.contains(fee_id))
            .map(|fee_id| format!("Frais inconnu pour ce transfert : {fee_id}"))
            .collect();
        if !unknown.is_empty() {
            unknown.sort();
            return Err(ServiceError::Validation(unknown).into());
        }

        for (fee_id, input) in updates {
            let (date, mode) = if input.paid {
                (Some(input.date_paiement.unwrap_or(today)), input.mode_paiement.clone())
            } else {
                (None, None)
            };
            sqlx::query(
                "UPDATE transfer_fees SET paye = $2, date_paiement = $3, mode_paiement = $4
                 WHERE id = $1",
            )
            .bind(fee_id)
            .bind(input.paid)
            .bind(date)
            .bind(mode)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "UPDATE transfers
             SET frais_payes = (SELECT COALESCE(SUM(montant), 0)::BIGINT
                                FROM transfer_fees WHERE transfer_id = $1 AND paye)
             WHERE id = $1",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let current = transfer.status()?;
        let note =
            workflow::normalize_comment(comment).unwrap_or_else(|| "Frais mis à jour".to_string());
        append_history(&mut tx, id, HistoryAction::Modification, Some(current), current, Some(&note), user_id)
            .await?;

        let fees = sqlx::query_as::<_, TransferFee>(
            "SELECT * FROM transfer_fees WHERE transfer_id = $1 ORDER BY id",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(fees)
    }

    /// Append a free comment to the history without changing the status.
    pub async fn add_comment(
        pool: &PgPool,
        id: i64,
        comment: &str,
        user_id: i64,
    ) -> anyhow::Result<TransferHistory> {
        let note = workflow::normalize_comment(Some(comment)).ok_or_else(|| {
            ServiceError::Validation(vec!["Le commentaire est vide".to_string()])
        })?;

        let mut tx = pool.begin().await?;
        let transfer = lock_transfer(&mut tx, id)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Transfert introuvable".into()))?;
        let current = transfer.status()?;
        let entry = append_history(
            &mut tx,
            id,
            HistoryAction::Modification,
            Some(current),
            current,
            Some(&note),
            user_id,
        )
        .await?;
        tx.commit().await?;
        Ok(entry)
    }

    /// Store an uploaded file for one checklist row and mark it supplied.
    /// The file is written only once the transfer row is locked; it is removed
    /// again if the update does not commit, and a replaced file is deleted.
    pub async fn upload_document(
        pool: &PgPool,
        upload_dir: &str,
        transfer_id: i64,
        document_id: i64,
        user_id: i64,
        mut multipart: Multipart,
    ) -> anyhow::Result<TransferDocument> {
        let mut file_data: Option<(Vec<u8>, String)> = None;
        while let Some(field) = multipart.next_field().await? {
            if field.name() == Some("file") {
                let filename = field.file_name().unwrap_or("document").to_string();
                let bytes = field.bytes().await?.to_vec();
                file_data = Some((bytes, filename));
            }
        }
        let (bytes, original_filename) = file_data.ok_or_else(|| {
            ServiceError::Validation(vec!["Aucun fichier reçu".to_string()])
        })?;

        if bytes.len() > UPLOAD_MAX_BYTES {
            return Err(ServiceError::Validation(vec![
                "Le fichier dépasse la taille maximale de 10 Mo".to_string(),
            ])
            .into());
        }

        let ext = Path::new(&original_filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        if !UPLOAD_EXTENSIONS.contains(&ext.as_str()) {
            return Err(ServiceError::Validation(vec![format!(
                "Format de fichier non accepté : {original_filename}"
            )])
            .into());
        }

        let mut tx = pool.begin().await?;
        let transfer = lock_transfer(&mut tx, transfer_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Transfert introuvable".into()))?;
        let previous = sqlx::query_as::<_, TransferDocument>(
            "SELECT * FROM transfer_documents WHERE id = $1 AND transfer_id = $2 FOR UPDATE",
        )
        .bind(document_id)
        .bind(transfer_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ServiceError::NotFound("Document introuvable".into()))?;

        let dir = PathBuf::from(upload_dir)
            .join("transfers")
            .join(transfer_id.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        let storage_filename = format!("{}.{}", Uuid::new_v4(), ext);
        let stored = dir.join(&storage_filename);
        tokio::fs::write(&stored, &bytes).await?;
        let relative_path = format!("transfers/{transfer_id}/{storage_filename}");

        let saved = async {
            let document = sqlx::query_as::<_, TransferDocument>(
                "UPDATE transfer_documents
                 SET fourni = TRUE, date_upload = NOW(), chemin_fichier = $2
                 WHERE id = $1
                 RETURNING *",
            )
            .bind(document_id)
            .bind(&relative_path)
            .fetch_one(&mut *tx)
            .await?;

            let current = transfer.status()?;
            append_history(
                &mut tx,
                transfer_id,
                HistoryAction::Modification,
                Some(current),
                current,
                Some(&format!("Document fourni : {}", previous.nom_document)),
                user_id,
            )
            .await?;
            tx.commit().await?;
            anyhow::Ok(document)
        }
        .await;

        let document = match saved {
            Ok(document) => document,
            Err(e) => {
                remove_upload(&stored).await;
                return Err(e);
            }
        };

        if let Some(old) = previous.chemin_fichier.as_deref() {
            remove_upload(&PathBuf::from(upload_dir).join(old)).await;
        }

        info!(
            "Transfer {}: document {} uploaded ({} bytes)",
            transfer_id,
            document_id,
            bytes.len()
        );
        Ok(document)
    }
}

async fn remove_upload(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Could not remove upload {}: {}", path.display(), e);
        }
    }
}

async fn ensure_class_exists(conn: &mut PgConnection, class_id: i64) -> anyhow::Result<()> {
    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM classes WHERE id = $1)")
        .bind(class_id)
        .fetch_one(&mut *conn)
        .await?;
    if !exists {
        return Err(ServiceError::NotFound(format!("Classe introuvable : {class_id}")).into());
    }
    Ok(())
}

/// Insert a student arriving by transfer, with an active inscription in the
/// destination class when one is given.
async fn insert_student(
    conn: &mut PgConnection,
    student: &ValidNewStudent,
    classe_id: Option<i64>,
    date_demande: NaiveDate,
) -> anyhow::Result<i64> {
    let taken: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM eleves WHERE matricule = $1)")
        .bind(&student.matricule)
        .fetch_one(&mut *conn)
        .await?;
    if taken {
        return Err(ServiceError::Conflict(MATRICULE_TAKEN.into()).into());
    }

    let inserted: Result<i64, sqlx::Error> = sqlx::query_scalar(
        "INSERT INTO eleves (matricule, nom, prenom, date_naissance, sexe, statut)
         VALUES ($1, $2, $3, $4, $5, 'actif')
         RETURNING id",
    )
    .bind(&student.matricule)
    .bind(&student.nom)
    .bind(&student.prenom)
    .bind(student.date_naissance)
    .bind(&student.sexe)
    .fetch_one(&mut *conn)
    .await;
    let eleve_id = match inserted {
        Ok(id) => id,
        Err(e) if db::is_unique_violation(&e, "eleves_matricule_key") => {
            return Err(ServiceError::Conflict(MATRICULE_TAKEN.into()).into())
        }
        Err(e) => return Err(e.into()),
    };

    if let Some(classe_id) = classe_id {
        sqlx::query(
            "INSERT INTO inscriptions (eleve_id, classe_id, annee_scolaire, statut, date_inscription)
             VALUES ($1, $2, $3, 'active', $4)",
        )
        .bind(eleve_id)
        .bind(classe_id)
        .bind(school_year(date_demande))
        .bind(date_demande)
        .execute(&mut *conn)
        .await?;
    }

    Ok(eleve_id)
}

/// Status labels of open requests, as stored.
fn active_statuses() -> Vec<&'static str> {
    TransferStatus::ALL
        .into_iter()
        .filter(|s| s.is_active())
        .map(TransferStatus::as_str)
        .collect()
}

/// Whether the student has an open request other than `excluding`.
async fn has_active_transfer(
    conn: &mut PgConnection,
    eleve_id: i64,
    excluding: Option<i64>,
) -> anyhow::Result<bool> {
    let active: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM transfers
                       WHERE eleve_id = $1 AND statut = ANY($2)
                         AND ($3::bigint IS NULL OR id <> $3))",
    )
    .bind(eleve_id)
    .bind(active_statuses())
    .bind(excluding)
    .fetch_one(&mut *conn)
    .await?;
    Ok(active)
}

async fn lock_transfer(conn: &mut PgConnection, id: i64) -> anyhow::Result<Option<Transfer>> {
    let transfer = sqlx::query_as::<_, Transfer>("SELECT * FROM transfers WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(transfer)
}

async fn append_history(
    conn: &mut PgConnection,
    transfer_id: i64,
    action: HistoryAction,
    old: Option<TransferStatus>,
    new: TransferStatus,
    comment: Option<&str>,
    user_id: i64,
) -> anyhow::Result<TransferHistory> {
    let entry = sqlx::query_as::<_, TransferHistory>(
        "INSERT INTO transfer_history
            (transfer_id, action, ancien_statut, nouveau_statut, commentaire, user_id)
         VALUES ($1, $2, $3, $4, $5, $6)
         RETURNING *",
    )
    .bind(transfer_id)
    .bind(action.as_str())
    .bind(old.map(TransferStatus::as_str))
    .bind(new.as_str())
    .bind(comment)
    .bind(user_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(entry)
}

/// Write an already-planned transition and its side effects.
async fn apply_transition(
    conn: &mut PgConnection,
    transfer: &Transfer,
    action: TransitionAction,
    next: TransferStatus,
    comment: Option<&str>,
    date_effective: Option<NaiveDate>,
    user_id: i64,
) -> anyhow::Result<Transfer> {
    let today = Utc::now().date_naive();

    let mut updated = match action {
        TransitionAction::Approve => {
            sqlx::query_as::<_, Transfer>(
                "UPDATE transfers
                 SET statut = $2, approuve_par = $3, date_approbation = NOW(),
                     traite_par = $3, date_traitement = NOW()
                 WHERE id = $1
                 RETURNING *",
            )
            .bind(transfer.id)
            .bind(next.as_str())
            .bind(user_id)
            .fetch_one(&mut *conn)
            .await?
        }
        TransitionAction::Reject => {
            sqlx::query_as::<_, Transfer>(
                "UPDATE transfers
                 SET statut = $2, traite_par = $3, date_traitement = NOW()
                 WHERE id = $1
                 RETURNING *",
            )
            .bind(transfer.id)
            .bind(next.as_str())
            .bind(user_id)
            .fetch_one(&mut *conn)
            .await?
        }
        TransitionAction::Reopen => {
            // A rejected request cannot come back while a newer one is open.
            if has_active_transfer(conn, transfer.eleve_id, Some(transfer.id)).await? {
                return Err(ServiceError::Conflict(ACTIVE_TRANSFER_EXISTS.into()).into());
            }
            let reopened = sqlx::query_as::<_, Transfer>(
                "UPDATE transfers
                 SET statut = $2, approuve_par = NULL, date_approbation = NULL,
                     traite_par = $3, date_traitement = NOW()
                 WHERE id = $1
                 RETURNING *",
            )
            .bind(transfer.id)
            .bind(next.as_str())
            .bind(user_id)
            .fetch_one(&mut *conn)
            .await;
            match reopened {
                Ok(t) => t,
                Err(e) if db::is_unique_violation(&e, ACTIVE_TRANSFER_INDEX) => {
                    return Err(ServiceError::Conflict(ACTIVE_TRANSFER_EXISTS.into()).into())
                }
                Err(e) => return Err(e.into()),
            }
        }
        TransitionAction::Complete => {
            let completed = sqlx::query_as::<_, Transfer>(
                "UPDATE transfers
                 SET statut = $2, date_effective = COALESCE($3, date_effective, $4),
                     traite_par = $5, date_traitement = NOW()
                 WHERE id = $1
                 RETURNING *",
            )
            .bind(transfer.id)
            .bind(next.as_str())
            .bind(date_effective)
            .bind(today)
            .bind(user_id)
            .fetch_one(&mut *conn)
            .await?;
            complete_side_effects(conn, &completed).await?;
            completed
        }
    };

    if action == TransitionAction::Complete && !updated.certificat_genere {
        let numero = generate_certificate(conn, &updated, today).await?;
        updated.certificat_genere = true;
        updated.numero_certificat = Some(numero);
    }

    append_history(
        conn,
        transfer.id,
        workflow::history_action(action),
        Some(transfer.status()?),
        next,
        workflow::normalize_comment(comment).as_deref(),
        user_id,
    )
    .await?;

    Ok(updated)
}

/// Enrolment changes caused by a completed movement.
async fn complete_side_effects(conn: &mut PgConnection, transfer: &Transfer) -> anyhow::Result<()> {
    let movement = transfer.movement()?;

    if movement.is_departure() {
        sqlx::query(
            "UPDATE inscriptions SET statut = 'inactive'
             WHERE eleve_id = $1 AND statut = 'active'",
        )
        .bind(transfer.eleve_id)
        .execute(&mut *conn)
        .await?;
    } else if let Some(classe_id) = transfer.classe_destination_id {
        // Arrivals of known students get their inscription on completion.
        let enrolled: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM inscriptions WHERE eleve_id = $1 AND statut = 'active')",
        )
        .bind(transfer.eleve_id)
        .fetch_one(&mut *conn)
        .await?;
        if !enrolled {
            let date = transfer.date_effective.unwrap_or(transfer.date_demande);
            sqlx::query(
                "INSERT INTO inscriptions (eleve_id, classe_id, annee_scolaire, statut, date_inscription)
                 VALUES ($1, $2, $3, 'active', $4)",
            )
            .bind(transfer.eleve_id)
            .bind(classe_id)
            .bind(school_year(date))
            .bind(date)
            .execute(&mut *conn)
            .await?;
        }
        sqlx::query("UPDATE eleves SET statut = 'actif' WHERE id = $1")
            .bind(transfer.eleve_id)
            .execute(&mut *conn)
            .await?;
    }

    if let Some(statut) = workflow::student_status_after_completion(movement) {
        sqlx::query("UPDATE eleves SET statut = $2 WHERE id = $1")
            .bind(transfer.eleve_id)
            .bind(statut)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Assign the certificate number once; the flag guards against regeneration.
async fn generate_certificate(
    conn: &mut PgConnection,
    transfer: &Transfer,
    today: NaiveDate,
) -> anyhow::Result<String> {
    let numero = workflow::certificate_number(today.year(), transfer.id);
    let stored = sqlx::query_scalar::<_, Option<String>>(
        "UPDATE transfers SET certificat_genere = TRUE, numero_certificat = $2
         WHERE id = $1 AND certificat_genere = FALSE
         RETURNING numero_certificat",
    )
    .bind(transfer.id)
    .bind(&numero)
    .fetch_optional(&mut *conn)
    .await?
    .flatten();
    Ok(stored.or_else(|| transfer.numero_certificat.clone()).unwrap_or(numero))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn incoming_request() -> CreateTransferRequest {
        CreateTransferRequest {
            type_mouvement: Some("transfert_entrant".into()),
            nouvel_eleve: Some(NewStudent {
                matricule: Some("EL-2024-118".into()),
                nom: Some("Traoré".into()),
                prenom: Some("Awa".into()),
                date_naissance: Some(date(2012, 3, 14)),
                sexe: Some("f".into()),
            }),
            ecole_origine: Some("École X".into()),
            classe_destination_id: Some(4),
            motif: Some("Déménagement familial".into()),
            date_demande: Some(date(2024, 9, 1)),
            ..Default::default()
        }
    }

    fn validation_errors(req: &CreateTransferRequest) -> Vec<String> {
        match validate_create(req) {
            Err(ServiceError::Validation(errors)) => errors,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn open_requests_are_pending_or_approved() {
        assert_eq!(active_statuses(), ["en_attente", "approuve"]);
    }

    #[test]
    fn incoming_transfer_with_new_student_is_valid() {
        let input = validate_create(&incoming_request()).unwrap();
        assert_eq!(input.movement, MovementType::TransfertEntrant);
        assert_eq!(input.motif, "Déménagement familial");
        assert_eq!(input.frais_transfert, 0);
        match input.student {
            StudentRef::New(s) => {
                assert_eq!(s.matricule, "EL-2024-118");
                assert_eq!(s.sexe.as_deref(), Some("F"));
            }
            other => panic!("expected new student, got {other:?}"),
        }
    }

    #[test]
    fn missing_required_fields_are_all_reported() {
        let errors = validation_errors(&CreateTransferRequest::default());
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("type de mouvement")));
        assert!(errors.iter().any(|e| e.contains("élève")));
        assert!(errors.iter().any(|e| e.contains("motif")));
        assert!(errors.iter().any(|e| e.contains("date de demande")));
    }

    #[test]
    fn blank_motif_counts_as_missing() {
        let mut req = incoming_request();
        req.motif = Some("   ".into());
        assert_eq!(validation_errors(&req), ["Le motif est obligatoire"]);
    }

    #[test]
    fn outgoing_transfer_needs_destination_school() {
        let req = CreateTransferRequest {
            type_mouvement: Some("transfert_sortant".into()),
            eleve_id: Some(12),
            motif: Some("Mutation des parents".into()),
            date_demande: Some(date(2024, 11, 4)),
            ..Default::default()
        };
        let errors = validation_errors(&req);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("école de destination"));

        let ok = CreateTransferRequest {
            ecole_destination: Some("Lycée Y".into()),
            ..req
        };
        assert_eq!(validate_create(&ok).unwrap().student, StudentRef::Existing(12));
    }

    #[test]
    fn exit_does_not_need_destination() {
        let req = CreateTransferRequest {
            type_mouvement: Some("sortie_definitive".into()),
            eleve_id: Some(5),
            motif: Some("Fin de cycle".into()),
            date_demande: Some(date(2025, 6, 30)),
            frais_transfert: Some(7_500),
            ..Default::default()
        };
        let input = validate_create(&req).unwrap();
        assert_eq!(input.movement, MovementType::SortieDefinitive);
        assert_eq!(input.frais_transfert, 7_500);
    }

    #[test]
    fn new_student_only_for_arrivals() {
        let mut req = incoming_request();
        req.type_mouvement = Some("transfert_sortant".into());
        req.ecole_destination = Some("Lycée Y".into());
        let errors = validation_errors(&req);
        assert!(errors[0].contains("transfert entrant"));
    }

    #[test]
    fn new_student_fields_are_checked() {
        let mut req = incoming_request();
        req.nouvel_eleve = Some(NewStudent {
            matricule: None,
            nom: Some("Kaboré".into()),
            prenom: None,
            date_naissance: None,
            sexe: Some("X".into()),
        });
        assert_eq!(validation_errors(&req).len(), 3);
    }

    #[test]
    fn effective_date_cannot_precede_request() {
        let mut req = incoming_request();
        req.date_effective = Some(date(2024, 8, 1));
        assert!(validation_errors(&req)[0].contains("date effective"));
    }

    #[test]
    fn negative_fee_is_invalid() {
        let mut req = incoming_request();
        req.frais_transfert = Some(-1);
        assert!(validation_errors(&req)[0].contains("négatif"));
    }

    #[test]
    fn school_year_starts_in_september() {
        assert_eq!(school_year(date(2024, 9, 1)), "2024-2025");
        assert_eq!(school_year(date(2025, 2, 10)), "2024-2025");
        assert_eq!(school_year(date(2025, 8, 31)), "2024-2025");
    }

    #[test]
    fn payment_modes_are_checked() {
        let mut fees = HashMap::new();
        fees.insert(
            1,
            FeePaymentInput {
                paid: true,
                date_paiement: None,
                mode_paiement: Some("especes".into()),
            },
        );
        assert!(validate_fee_inputs(&fees).is_ok());
        fees.insert(
            2,
            FeePaymentInput {
                paid: true,
                date_paiement: None,
                mode_paiement: Some("bitcoin".into()),
            },
        );
        match validate_fee_inputs(&fees) {
            Err(ServiceError::Validation(errors)) => {
                assert_eq!(errors, ["Mode de paiement invalide pour le frais 2 : bitcoin"])
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }
}
