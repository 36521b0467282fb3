use sqlx::PgPool;

use crate::{
    error::ServiceError,
    models::student::{Inscription, Student, StudentQuery, StudentSummary},
    services::filters::{like_pattern, page_window},
};

pub struct StudentService;

impl StudentService {
    pub async fn list(pool: &PgPool, query: &StudentQuery) -> anyhow::Result<Vec<StudentSummary>> {
        let (limit, offset) = page_window(query.page, query.per_page);
        let search = query
            .q
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(like_pattern);

        let students = sqlx::query_as::<_, StudentSummary>(
            "SELECT e.id, e.matricule, e.nom, e.prenom, e.statut,
                    i.classe_id, c.nom AS classe_nom
             FROM eleves e
             LEFT JOIN inscriptions i ON i.eleve_id = e.id AND i.statut = 'active'
             LEFT JOIN classes c ON c.id = i.classe_id
             WHERE ($1::text IS NULL OR e.nom ILIKE $1 OR e.prenom ILIKE $1 OR e.matricule ILIKE $1)
               AND ($2::bigint IS NULL OR i.classe_id = $2)
             ORDER BY e.nom, e.prenom
             LIMIT $3 OFFSET $4",
        )
        .bind(search)
        .bind(query.classe_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;
        Ok(students)
    }

    pub async fn get(pool: &PgPool, id: i64) -> anyhow::Result<(Student, Vec<Inscription>)> {
        let student = sqlx::query_as::<_, Student>("SELECT * FROM eleves WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Élève introuvable".into()))?;

        let inscriptions = sqlx::query_as::<_, Inscription>(
            "SELECT i.id, i.eleve_id, i.classe_id, c.nom AS classe_nom, i.annee_scolaire,
                    i.statut, i.date_inscription
             FROM inscriptions i
             JOIN classes c ON c.id = i.classe_id
             WHERE i.eleve_id = $1
             ORDER BY i.date_inscription DESC",
        )
        .bind(id)
        .fetch_all(pool)
        .await?;

        Ok((student, inscriptions))
    }
}
