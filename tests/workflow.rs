//! Transfer workflow against a real Postgres. Set DATABASE_URL to run these;
//! without it every test returns early. Each test works on its own class and
//! students, so they can share one database and run in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use chrono::{Datelike, NaiveDate, Utc};
use sqlx::PgPool;
use tower::ServiceExt;
use uuid::Uuid;

use ecole_api::{
    build_router,
    config::Config,
    db,
    error::ServiceError,
    middleware::auth::encode_access_token,
    models::{
        student::NewStudent,
        transfer::{BulkAction, CreateTransferRequest, FeePaymentInput, TransitionAction},
        user::UserRole,
    },
    services::{transfers::TransferService, workflow},
    AppState,
};

const USER: i64 = 1;
const CERT_FEE: i64 = 5000;

async fn test_pool() -> Option<PgPool> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping database test");
        return None;
    };
    let pool = db::create_pool(&url, 5).await.expect("connect");
    db::run_migrations(&pool).await.expect("migrate");
    Some(pool)
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", &Uuid::new_v4().simple().to_string()[..12])
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

async fn new_class(pool: &PgPool) -> i64 {
    sqlx::query_scalar(
        "INSERT INTO classes (nom, niveau, annee_scolaire) VALUES ($1, '6e', '2024-2025') RETURNING id",
    )
    .bind(unique("6A"))
    .fetch_one(pool)
    .await
    .unwrap()
}

async fn new_student(pool: &PgPool, classe_id: Option<i64>) -> i64 {
    let eleve_id: i64 = sqlx::query_scalar(
        "INSERT INTO eleves (matricule, nom, prenom) VALUES ($1, 'Diallo', 'Mariam') RETURNING id",
    )
    .bind(unique("EL"))
    .fetch_one(pool)
    .await
    .unwrap();
    if let Some(classe_id) = classe_id {
        sqlx::query(
            "INSERT INTO inscriptions (eleve_id, classe_id, annee_scolaire, date_inscription)
             VALUES ($1, $2, '2024-2025', '2024-09-02')",
        )
        .bind(eleve_id)
        .bind(classe_id)
        .execute(pool)
        .await
        .unwrap();
    }
    eleve_id
}

async fn active_inscriptions(pool: &PgPool, eleve_id: i64) -> Vec<i64> {
    sqlx::query_scalar(
        "SELECT classe_id FROM inscriptions WHERE eleve_id = $1 AND statut = 'active' ORDER BY id",
    )
    .bind(eleve_id)
    .fetch_all(pool)
    .await
    .unwrap()
}

async fn student_status(pool: &PgPool, eleve_id: i64) -> String {
    sqlx::query_scalar("SELECT statut FROM eleves WHERE id = $1")
        .bind(eleve_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

fn outgoing(eleve_id: i64) -> CreateTransferRequest {
    CreateTransferRequest {
        type_mouvement: Some("transfert_sortant".into()),
        eleve_id: Some(eleve_id),
        motif: Some("Mutation des parents".into()),
        date_demande: Some(date(2024, 11, 4)),
        ecole_destination: Some("Lycée Y".into()),
        ..Default::default()
    }
}

fn domain_error(err: &anyhow::Error) -> &ServiceError {
    err.downcast_ref::<ServiceError>()
        .unwrap_or_else(|| panic!("expected a domain error, got {err:#}"))
}

async fn create(pool: &PgPool, req: &CreateTransferRequest) -> i64 {
    TransferService::create(pool, USER, CERT_FEE, req).await.unwrap().id
}

async fn transition(pool: &PgPool, id: i64, action: TransitionAction, comment: Option<&str>) {
    TransferService::transition(pool, id, action, comment, None, USER)
        .await
        .unwrap();
}

#[tokio::test]
async fn incoming_new_student_goes_through_to_certificate() {
    let Some(pool) = test_pool().await else { return };
    let classe_id = new_class(&pool).await;

    let req = CreateTransferRequest {
        type_mouvement: Some("transfert_entrant".into()),
        nouvel_eleve: Some(NewStudent {
            matricule: Some(unique("EL")),
            nom: Some("Traoré".into()),
            prenom: Some("Awa".into()),
            date_naissance: Some(date(2012, 3, 14)),
            sexe: Some("F".into()),
        }),
        ecole_origine: Some("École X".into()),
        classe_destination_id: Some(classe_id),
        motif: Some("Déménagement familial".into()),
        date_demande: Some(date(2024, 9, 1)),
        ..Default::default()
    };
    let id = create(&pool, &req).await;

    let detail = TransferService::get(&pool, id).await.unwrap();
    assert_eq!(detail.transfer.statut, "en_attente");
    let types: Vec<&str> = detail.documents.iter().map(|d| d.type_document.as_str()).collect();
    assert_eq!(types, ["bulletin", "certificat_scolarite", "acte_naissance", "photo"]);
    assert!(!detail.documents[3].obligatoire);
    assert_eq!(detail.documents_manquants, 3);
    assert!(detail.fees.is_empty());
    assert_eq!(detail.history.len(), 1);
    assert_eq!(detail.history[0].action, "creation");
    assert_eq!(detail.history[0].ancien_statut, None);
    assert_eq!(detail.history[0].nouveau_statut, "en_attente");
    assert_eq!(active_inscriptions(&pool, detail.transfer.eleve_id).await, [classe_id]);

    transition(&pool, id, TransitionAction::Approve, None).await;
    transition(&pool, id, TransitionAction::Complete, None).await;

    let today = Utc::now().date_naive();
    let completed = TransferService::get(&pool, id).await.unwrap();
    assert_eq!(completed.transfer.statut, "complete");
    assert_eq!(completed.transfer.date_effective, Some(today));
    assert!(completed.transfer.certificat_genere);
    let numero = workflow::certificate_number(today.year(), id);
    assert_eq!(completed.transfer.numero_certificat.as_deref(), Some(numero.as_str()));
    let actions: Vec<&str> = completed.history.iter().map(|h| h.action.as_str()).collect();
    assert_eq!(actions, ["creation", "approbation", "completion"]);

    // A completed transfer cannot be completed again, and the number stays put.
    let err = TransferService::transition(&pool, id, TransitionAction::Complete, None, None, USER)
        .await
        .unwrap_err();
    assert!(matches!(domain_error(&err), ServiceError::InvalidTransition { .. }));

    let outcome = TransferService::bulk(&pool, BulkAction::GenerateCertificates, &[id], None, USER)
        .await
        .unwrap();
    assert!(outcome.processed.is_empty());
    assert_eq!(outcome.skipped.len(), 1);
    assert_eq!(outcome.skipped[0].id, id);

    let again = TransferService::get(&pool, id).await.unwrap();
    assert_eq!(again.transfer.numero_certificat.as_deref(), Some(numero.as_str()));
}

#[tokio::test]
async fn second_open_request_is_refused_without_writing() {
    let Some(pool) = test_pool().await else { return };
    let classe_id = new_class(&pool).await;
    let eleve_id = new_student(&pool, Some(classe_id)).await;

    create(&pool, &outgoing(eleve_id)).await;
    let err = TransferService::create(&pool, USER, CERT_FEE, &outgoing(eleve_id))
        .await
        .unwrap_err();
    match domain_error(&err) {
        ServiceError::Conflict(message) => assert!(message.contains("déjà en cours")),
        other => panic!("expected conflict, got {other:?}"),
    }

    let transfers: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM transfers WHERE eleve_id = $1")
        .bind(eleve_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(transfers, 1);
    let documents: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM transfer_documents d JOIN transfers t ON t.id = d.transfer_id
         WHERE t.eleve_id = $1",
    )
    .bind(eleve_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(documents, 2);
}

#[tokio::test]
async fn departure_closes_enrolment_and_arrival_opens_one() {
    let Some(pool) = test_pool().await else { return };
    let origine = new_class(&pool).await;
    let destination = new_class(&pool).await;

    let leaving = new_student(&pool, Some(origine)).await;
    let out_id = create(&pool, &outgoing(leaving)).await;
    let created = TransferService::get(&pool, out_id).await.unwrap();
    assert_eq!(created.transfer.classe_origine_id, Some(origine));

    transition(&pool, out_id, TransitionAction::Approve, None).await;
    let done = TransferService::transition(
        &pool,
        out_id,
        TransitionAction::Complete,
        None,
        Some(date(2025, 1, 15)),
        USER,
    )
    .await
    .unwrap();
    assert_eq!(done.date_effective, Some(date(2025, 1, 15)));
    assert!(active_inscriptions(&pool, leaving).await.is_empty());
    assert_eq!(student_status(&pool, leaving).await, "transfere");

    let arriving = new_student(&pool, None).await;
    let in_id = create(
        &pool,
        &CreateTransferRequest {
            type_mouvement: Some("transfert_entrant".into()),
            eleve_id: Some(arriving),
            classe_destination_id: Some(destination),
            motif: Some("Rapprochement familial".into()),
            date_demande: Some(date(2024, 12, 2)),
            ..Default::default()
        },
    )
    .await;
    transition(&pool, in_id, TransitionAction::Approve, None).await;
    transition(&pool, in_id, TransitionAction::Complete, None).await;
    assert_eq!(active_inscriptions(&pool, arriving).await, [destination]);
    assert_eq!(student_status(&pool, arriving).await, "actif");
}

#[tokio::test]
async fn bulk_reports_transfers_in_the_wrong_status() {
    let Some(pool) = test_pool().await else { return };
    let classe_id = new_class(&pool).await;
    let first = create(&pool, &outgoing(new_student(&pool, Some(classe_id)).await)).await;
    let second = create(&pool, &outgoing(new_student(&pool, Some(classe_id)).await)).await;
    transition(&pool, first, TransitionAction::Approve, None).await;

    let err = TransferService::bulk(&pool, BulkAction::Reject, &[first, second], None, USER)
        .await
        .unwrap_err();
    assert!(matches!(domain_error(&err), ServiceError::Validation(_)));

    let outcome =
        TransferService::bulk(&pool, BulkAction::Approve, &[first, second, i64::MAX], None, USER)
            .await
            .unwrap();
    assert_eq!(outcome.processed, [second]);
    let skipped: Vec<i64> = outcome.skipped.iter().map(|s| s.id).collect();
    assert_eq!(skipped, [first, i64::MAX]);
    assert!(outcome.skipped.iter().all(|s| !s.reason.is_empty()));

    let first_now = TransferService::get(&pool, first).await.unwrap();
    assert_eq!(first_now.transfer.statut, "approuve");
    assert_eq!(first_now.history.len(), 2);
}

#[tokio::test]
async fn fee_payments_recompute_paid_total() {
    let Some(pool) = test_pool().await else { return };
    let classe_id = new_class(&pool).await;
    let eleve_id = new_student(&pool, Some(classe_id)).await;
    let id = create(
        &pool,
        &CreateTransferRequest {
            frais_transfert: Some(20_000),
            ..outgoing(eleve_id)
        },
    )
    .await;

    let detail = TransferService::get(&pool, id).await.unwrap();
    assert_eq!(detail.transfer.frais_transfert, 25_000);
    assert_eq!(detail.reste_a_payer, 25_000);
    let transfer_fee = detail
        .fees
        .iter()
        .find(|f| f.type_frais == "frais_transfert")
        .unwrap()
        .id;

    let paid = HashMap::from([(
        transfer_fee,
        FeePaymentInput {
            paid: true,
            date_paiement: None,
            mode_paiement: Some("especes".into()),
        },
    )]);
    TransferService::update_fees(&pool, id, &paid, None, USER).await.unwrap();

    let detail = TransferService::get(&pool, id).await.unwrap();
    assert_eq!(detail.transfer.frais_payes, 20_000);
    assert_eq!(detail.reste_a_payer, 5_000);
    let fee = detail.fees.iter().find(|f| f.id == transfer_fee).unwrap();
    assert_eq!(fee.date_paiement, Some(Utc::now().date_naive()));
    assert_eq!(detail.history.last().unwrap().commentaire.as_deref(), Some("Frais mis à jour"));

    let unpaid = HashMap::from([(
        transfer_fee,
        FeePaymentInput {
            paid: false,
            date_paiement: None,
            mode_paiement: None,
        },
    )]);
    TransferService::update_fees(&pool, id, &unpaid, None, USER).await.unwrap();
    let detail = TransferService::get(&pool, id).await.unwrap();
    assert_eq!(detail.transfer.frais_payes, 0);
}

#[tokio::test]
async fn reopening_behind_a_newer_request_is_a_conflict() {
    let Some(pool) = test_pool().await else { return };
    let classe_id = new_class(&pool).await;
    let eleve_id = new_student(&pool, Some(classe_id)).await;

    let older = create(&pool, &outgoing(eleve_id)).await;
    transition(&pool, older, TransitionAction::Reject, Some("Dossier incomplet")).await;
    let newer = create(&pool, &outgoing(eleve_id)).await;

    let err = TransferService::transition(
        &pool,
        older,
        TransitionAction::Reopen,
        Some("Pièces reçues"),
        None,
        USER,
    )
    .await
    .unwrap_err();
    match domain_error(&err) {
        ServiceError::Conflict(message) => assert!(message.contains("déjà en cours")),
        other => panic!("expected conflict, got {other:?}"),
    }
    let still = TransferService::get(&pool, older).await.unwrap();
    assert_eq!(still.transfer.statut, "rejete");

    // Once the newer request is closed the older one may come back.
    transition(&pool, newer, TransitionAction::Reject, Some("Doublon")).await;
    transition(&pool, older, TransitionAction::Reopen, Some("Pièces reçues")).await;
    let reopened = TransferService::get(&pool, older).await.unwrap();
    assert_eq!(reopened.transfer.statut, "en_attente");
    assert_eq!(reopened.history.last().unwrap().action, "modification");
}

const SECRET: &str = "test-secret";
const BOUNDARY: &str = "ecole-upload-boundary";

fn app(pool: PgPool, upload_dir: &std::path::Path) -> axum::Router {
    let config = Config {
        database_url: String::new(),
        db_max_connections: 1,
        jwt_secret: SECRET.into(),
        upload_dir: upload_dir.display().to_string(),
        host: "127.0.0.1".into(),
        port: 0,
        app_base_url: "http://localhost".into(),
        frais_certificat: CERT_FEE,
    };
    build_router(AppState { db: pool, config: Arc::new(config) })
}

fn upload_request(transfer_id: i64, document_id: i64, filename: &str) -> Request<Body> {
    let token = encode_access_token(USER, UserRole::Secretaire, SECRET, 300).unwrap();
    let body = format!(
        "--{BOUNDARY}\r\n\
         Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
         Content-Type: application/pdf\r\n\r\n\
         %PDF-1.4 bulletin\r\n\
         --{BOUNDARY}--\r\n"
    );
    Request::builder()
        .method("POST")
        .uri(format!("/transfers/{transfer_id}/documents/{document_id}/upload"))
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(Body::from(body))
        .unwrap()
}

fn stored_files(dir: &std::path::Path) -> Vec<String> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[tokio::test]
async fn reupload_replaces_the_stored_file() {
    let Some(pool) = test_pool().await else { return };
    let upload_dir = std::env::temp_dir().join(unique("ecole-uploads"));
    let classe_id = new_class(&pool).await;
    let id = create(&pool, &outgoing(new_student(&pool, Some(classe_id)).await)).await;
    let document_id = TransferService::get(&pool, id).await.unwrap().documents[0].id;
    let dir = upload_dir.join("transfers").join(id.to_string());

    let res = app(pool.clone(), &upload_dir)
        .oneshot(upload_request(id, document_id, "bulletin.pdf"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let first = stored_files(&dir);
    assert_eq!(first.len(), 1);

    let res = app(pool.clone(), &upload_dir)
        .oneshot(upload_request(id, document_id, "bulletin-corrige.pdf"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let second = stored_files(&dir);
    assert_eq!(second.len(), 1);
    assert_ne!(first, second);

    let document = &TransferService::get(&pool, id).await.unwrap().documents[0];
    assert!(document.fourni);
    assert_eq!(
        document.chemin_fichier.as_deref(),
        Some(format!("transfers/{id}/{}", second[0]).as_str())
    );

    let _ = std::fs::remove_dir_all(&upload_dir);
}

#[tokio::test]
async fn failed_upload_leaves_no_file_behind() {
    let Some(pool) = test_pool().await else { return };
    let upload_dir = std::env::temp_dir().join(unique("ecole-uploads"));
    let classe_id = new_class(&pool).await;
    let id = create(&pool, &outgoing(new_student(&pool, Some(classe_id)).await)).await;
    let other = create(&pool, &outgoing(new_student(&pool, Some(classe_id)).await)).await;
    let foreign_document = TransferService::get(&pool, other).await.unwrap().documents[0].id;

    let res = app(pool.clone(), &upload_dir)
        .oneshot(upload_request(id, foreign_document, "bulletin.pdf"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = app(pool.clone(), &upload_dir)
        .oneshot(upload_request(i64::MAX, foreign_document, "bulletin.pdf"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    assert!(stored_files(&upload_dir.join("transfers").join(id.to_string())).is_empty());
    assert!(stored_files(&upload_dir.join("transfers").join(i64::MAX.to_string())).is_empty());
}
