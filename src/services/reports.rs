use sqlx::PgPool;

use crate::{
    error::ServiceError,
    models::report::{
        EvaluationStats, EvaluationStatsRow, PayrollLine, PayrollReport, StaffMember,
        TransferStatsRow,
    },
    services::payroll::{self, PayrollRules},
};

/// Percentage of passing marks, one decimal.
pub fn pass_rate(passed: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    (passed as f64 * 1000.0 / total as f64).round() / 10.0
}

pub struct ReportService;

impl ReportService {
    /// Mark statistics per class, subject and evaluation type. Marks are
    /// rescaled to /20; a mark of 10/20 or more counts as a pass.
    pub async fn evaluation_stats(
        pool: &PgPool,
        classe_id: Option<i64>,
        periode: Option<&str>,
    ) -> anyhow::Result<Vec<EvaluationStats>> {
        let rows = sqlx::query_as::<_, EvaluationStatsRow>(
            "SELECT c.id AS classe_id, c.nom AS classe, m.nom AS matiere, ev.type_evaluation,
                    COUNT(DISTINCT ev.id)::BIGINT AS nb_evaluations,
                    COUNT(n.id)::BIGINT AS nb_notes,
                    AVG(n.note * 20.0 / ev.note_sur)::FLOAT8 AS moyenne,
                    MIN(n.note * 20.0 / ev.note_sur)::FLOAT8 AS note_min,
                    MAX(n.note * 20.0 / ev.note_sur)::FLOAT8 AS note_max,
                    (COUNT(n.id) FILTER (WHERE n.note * 20.0 / ev.note_sur >= 10))::BIGINT AS nb_reussites
             FROM evaluations ev
             JOIN classes c  ON c.id = ev.classe_id
             JOIN matieres m ON m.id = ev.matiere_id
             LEFT JOIN notes n ON n.evaluation_id = ev.id
             WHERE ($1::bigint IS NULL OR ev.classe_id = $1)
               AND ($2::text IS NULL OR ev.periode = $2)
             GROUP BY c.id, c.nom, m.nom, ev.type_evaluation
             ORDER BY c.nom, m.nom, ev.type_evaluation",
        )
        .bind(classe_id)
        .bind(periode)
        .fetch_all(pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| EvaluationStats {
                taux_reussite: pass_rate(row.nb_reussites, row.nb_notes),
                row,
            })
            .collect())
    }

    /// Monthly payroll for active staff.
    pub async fn payroll(
        pool: &PgPool,
        rules: &PayrollRules,
        mois: u32,
        annee: i32,
    ) -> anyhow::Result<PayrollReport> {
        let period_end = payroll::month_end(annee, mois).ok_or_else(|| {
            ServiceError::Validation(vec![format!("Période invalide : {mois}/{annee}")])
        })?;

        let staff = sqlx::query_as::<_, StaffMember>(
            "SELECT id, matricule, nom, prenom, fonction, salaire_base, date_embauche
             FROM personnel
             WHERE statut = 'actif' AND date_embauche <= $1
             ORDER BY nom, prenom",
        )
        .bind(period_end)
        .fetch_all(pool)
        .await?;

        let lignes: Vec<PayrollLine> = staff
            .into_iter()
            .map(|s| {
                let years = payroll::years_of_service(s.date_embauche, period_end);
                PayrollLine {
                    payslip: payroll::compute_payslip(rules, s.salaire_base, &s.fonction, years),
                    personnel_id: s.id,
                    matricule: s.matricule,
                    nom: s.nom,
                    prenom: s.prenom,
                    fonction: s.fonction,
                }
            })
            .collect();
        let totaux = payroll::totals(lignes.iter().map(|l| &l.payslip));

        Ok(PayrollReport { mois, annee, lignes, totaux })
    }

    /// Transfer counts by movement type and status for one calendar year.
    pub async fn transfer_stats(pool: &PgPool, annee: i32) -> anyhow::Result<Vec<TransferStatsRow>> {
        let rows = sqlx::query_as::<_, TransferStatsRow>(
            "SELECT type_mouvement, statut, COUNT(*)::BIGINT AS total
             FROM transfers
             WHERE EXTRACT(YEAR FROM date_demande)::INT = $1
             GROUP BY type_mouvement, statut
             ORDER BY type_mouvement, statut",
        )
        .bind(annee)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}
