use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_gauge_vec, CounterVec, GaugeVec};
use sqlx::PgPool;
use tracing::{info, warn};

lazy_static! {
    // ── Event counters ──────────────────────────────────────────────────────
    pub static ref TRANSFERS_CREATED: CounterVec = register_counter_vec!(
        "ecole_transfers_created_total",
        "Demandes de transfert créées par type de mouvement",
        &["type_mouvement"]
    ).unwrap();

    pub static ref TRANSFER_TRANSITIONS: CounterVec = register_counter_vec!(
        "ecole_transfer_transitions_total",
        "Transitions de statut par action et résultat",
        &["action", "outcome"]
    ).unwrap();

    // ── Business metrics ────────────────────────────────────────────────────
    pub static ref TRANSFERS_GAUGE: GaugeVec = register_gauge_vec!(
        "ecole_transfers_by_status",
        "Demandes de transfert par statut",
        &["statut"]
    ).unwrap();

    pub static ref STUDENTS_GAUGE: GaugeVec = register_gauge_vec!(
        "ecole_students_total",
        "Élèves par statut",
        &["statut"]
    ).unwrap();
}

pub fn record_transition(action: &str, outcome: &str) {
    TRANSFER_TRANSITIONS.with_label_values(&[action, outcome]).inc();
}

/// Spawn the background metrics collector (refreshes every 5 minutes).
pub fn start(pool: PgPool) {
    tokio::spawn(async move {
        if let Err(e) = collect(&pool).await {
            warn!("Metrics: initial collection failed: {}", e);
        }
        loop {
            tokio::time::sleep(tokio::time::Duration::from_secs(300)).await;
            if let Err(e) = collect(&pool).await {
                warn!("Metrics: collection failed: {}", e);
            }
        }
    });
}

async fn collect(pool: &PgPool) -> anyhow::Result<()> {
    let transfers: Vec<(String, i64)> = sqlx::query_as(
        "SELECT statut, COUNT(*)::BIGINT FROM transfers GROUP BY statut",
    )
    .fetch_all(pool)
    .await?;
    TRANSFERS_GAUGE.reset();
    for (statut, count) in &transfers {
        TRANSFERS_GAUGE.with_label_values(&[statut.as_str()]).set(*count as f64);
    }

    let students: Vec<(String, i64)> = sqlx::query_as(
        "SELECT statut, COUNT(*)::BIGINT FROM eleves GROUP BY statut",
    )
    .fetch_all(pool)
    .await?;
    STUDENTS_GAUGE.reset();
    for (statut, count) in &students {
        STUDENTS_GAUGE.with_label_values(&[statut.as_str()]).set(*count as f64);
    }

    info!("Metrics: collected {} transfer status group(s)", transfers.len());
    Ok(())
}
