use chrono::NaiveDate;
use sqlx::{Postgres, QueryBuilder};

use crate::{
    error::ServiceError,
    models::transfer::{MovementType, TransferQuery, TransferStatus},
};

/// Parsed listing filters for transfers. Every value is bound, never
/// interpolated; the alias `t` is the transfers table and `e` the students.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferFilter {
    pub status: Option<TransferStatus>,
    pub movement: Option<MovementType>,
    pub eleve_id: Option<i64>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub search: Option<String>,
}

impl TransferFilter {
    pub fn from_query(query: &TransferQuery) -> Result<Self, ServiceError> {
        let mut errors = Vec::new();

        let status = match non_blank(&query.status) {
            Some(s) => match s.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    errors.push(format!("Statut inconnu : {s}"));
                    None
                }
            },
            None => None,
        };
        let movement = match non_blank(&query.type_mouvement) {
            Some(s) => match s.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    errors.push(format!("Type de mouvement inconnu : {s}"));
                    None
                }
            },
            None => None,
        };
        if let (Some(from), Some(to)) = (query.date_from, query.date_to) {
            if from > to {
                errors.push("La date de début doit précéder la date de fin".to_string());
            }
        }

        if !errors.is_empty() {
            return Err(ServiceError::Validation(errors));
        }

        Ok(Self {
            status,
            movement,
            eleve_id: query.eleve_id,
            date_from: query.date_from,
            date_to: query.date_to,
            search: non_blank(&query.q).map(str::to_string),
        })
    }

    pub fn push_where(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        qb.push(" WHERE 1 = 1");
        if let Some(status) = self.status {
            qb.push(" AND t.statut = ").push_bind(status.as_str());
        }
        if let Some(movement) = self.movement {
            qb.push(" AND t.type_mouvement = ").push_bind(movement.as_str());
        }
        if let Some(eleve_id) = self.eleve_id {
            qb.push(" AND t.eleve_id = ").push_bind(eleve_id);
        }
        if let Some(from) = self.date_from {
            qb.push(" AND t.date_demande >= ").push_bind(from);
        }
        if let Some(to) = self.date_to {
            qb.push(" AND t.date_demande <= ").push_bind(to);
        }
        if let Some(search) = &self.search {
            let pattern = like_pattern(search);
            qb.push(" AND (e.nom ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR e.prenom ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR e.matricule ILIKE ")
                .push_bind(pattern)
                .push(")");
        }
    }
}

/// Page window as (limit, offset), 20 per page by default, 100 at most.
pub fn page_window(page: Option<i64>, per_page: Option<i64>) -> (i64, i64) {
    let limit = per_page.unwrap_or(20).clamp(1, 100);
    let offset = (page.unwrap_or(1).max(1) - 1).saturating_mul(limit);
    (limit, offset)
}

/// `%term%` for ILIKE, with the term's own wildcards and escape character
/// matched literally.
pub fn like_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}
