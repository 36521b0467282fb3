use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    Directeur,
    Secretaire,
    Comptable,
    Enseignant,
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UserRole::Admin => "admin",
            UserRole::Directeur => "directeur",
            UserRole::Secretaire => "secretaire",
            UserRole::Comptable => "comptable",
            UserRole::Enseignant => "enseignant",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for UserRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(UserRole::Admin),
            "directeur" => Ok(UserRole::Directeur),
            "secretaire" => Ok(UserRole::Secretaire),
            "comptable" => Ok(UserRole::Comptable),
            "enseignant" => Ok(UserRole::Enseignant),
            _ => Err(anyhow::anyhow!("Unknown role: {s}")),
        }
    }
}

/// Back-office capabilities checked by the handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    ViewStudents,
    ViewTransfers,
    ManageTransfers,
    ApproveTransfers,
    ManageTransferFees,
    ViewEvaluationReports,
    ViewPayroll,
}

impl UserRole {
    pub fn can(self, permission: Permission) -> bool {
        use Permission::*;
        match self {
            UserRole::Admin => true,
            UserRole::Directeur => true,
            UserRole::Secretaire => matches!(
                permission,
                ViewStudents | ViewTransfers | ManageTransfers | ManageTransferFees
            ),
            UserRole::Comptable => matches!(
                permission,
                ViewStudents | ViewTransfers | ManageTransferFees | ViewPayroll
            ),
            UserRole::Enseignant => matches!(permission, ViewStudents | ViewEvaluationReports),
        }
    }
}
