use crate::{error::ServiceError, models::transfer::TransferListItem};

/// Export formats accepted by `GET /transfers/export`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
}

impl ExportFormat {
    /// `excel` is served as a semicolon CSV that spreadsheet software opens directly.
    pub fn parse(format: Option<&str>) -> Result<Self, ServiceError> {
        match format.unwrap_or("csv") {
            "csv" | "excel" => Ok(ExportFormat::Csv),
            other => Err(ServiceError::Validation(vec![format!(
                "Format d'export non supporté : {other}"
            )])),
        }
    }
}

const HEADER: [&str; 13] = [
    "id",
    "matricule",
    "nom",
    "prenom",
    "type_mouvement",
    "ecole_origine",
    "ecole_destination",
    "motif",
    "date_demande",
    "date_effective",
    "statut",
    "frais_transfert",
    "frais_payes",
];

/// Semicolon-separated CSV with a UTF-8 byte order mark.
pub fn transfers_to_csv(rows: &[TransferListItem]) -> anyhow::Result<Vec<u8>> {
    let mut out = b"\xEF\xBB\xBF".to_vec();
    {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b';')
            .from_writer(&mut out);
        writer.write_record(HEADER)?;
        for row in rows {
            writer.write_record([
                row.id.to_string(),
                row.matricule.clone(),
                row.eleve_nom.clone(),
                row.eleve_prenom.clone(),
                row.type_mouvement.clone(),
                row.ecole_origine.clone().unwrap_or_default(),
                row.ecole_destination.clone().unwrap_or_default(),
                row.motif.clone(),
                row.date_demande.to_string(),
                row.date_effective.map(|d| d.to_string()).unwrap_or_default(),
                row.statut.clone(),
                row.frais_transfert.to_string(),
                row.frais_payes.to_string(),
            ])?;
        }
        writer.flush()?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn row() -> TransferListItem {
        TransferListItem {
            id: 7,
            eleve_id: 3,
            matricule: "EL-2024-118".into(),
            eleve_nom: "Traoré".into(),
            eleve_prenom: "Awa".into(),
            type_mouvement: "transfert_entrant".into(),
            ecole_origine: Some("École X; annexe".into()),
            ecole_destination: None,
            motif: "Déménagement familial".into(),
            date_demande: NaiveDate::from_ymd_opt(2024, 9, 1).unwrap(),
            date_effective: None,
            statut: "en_attente".into(),
            frais_transfert: 30_000,
            frais_payes: 0,
            numero_certificat: None,
        }
    }

    #[test]
    fn excel_and_csv_share_the_writer() {
        assert_eq!(ExportFormat::parse(None).unwrap(), ExportFormat::Csv);
        assert_eq!(ExportFormat::parse(Some("excel")).unwrap(), ExportFormat::Csv);
        assert!(ExportFormat::parse(Some("pdf")).is_err());
    }

    #[test]
    fn csv_has_bom_header_and_quoted_fields() {
        let bytes = transfers_to_csv(&[row()]).unwrap();
        assert!(bytes.starts_with(b"\xEF\xBB\xBF"));
        let text = String::from_utf8(bytes[3..].to_vec()).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("id;matricule;nom"));
        let line = lines.next().unwrap();
        assert!(line.starts_with("7;EL-2024-118;Traoré;Awa;transfert_entrant;\"École X; annexe\";;"));
        assert!(line.ends_with(";en_attente;30000;0"));
    }
}
