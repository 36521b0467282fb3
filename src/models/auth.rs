use serde::{Deserialize, Serialize};

use super::user::{Permission, UserRole};

/// Claims embedded in the JWT access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user id
    pub role: UserRole,
    pub exp: usize,
    pub iat: usize,
}

/// Caller identity decoded from the bearer token.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: i64,
    pub role: UserRole,
}

impl AuthenticatedUser {
    pub fn can(&self, permission: Permission) -> bool {
        self.role.can(permission)
    }
}
