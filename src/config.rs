use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub jwt_secret: String,
    pub upload_dir: String,
    pub host: String,
    pub port: u16,
    pub app_base_url: String,
    /// Flat certificate fee added to transfer fee schedules (francs).
    pub frais_certificat: i64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: required("DATABASE_URL")?,
            db_max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".into())
                .parse()?,
            jwt_secret: required("JWT_SECRET")?,
            upload_dir: env::var("UPLOAD_DIR").unwrap_or_else(|_| "/data/uploads".into()),
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".into())
                .parse()?,
            app_base_url: env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost".into()),
            frais_certificat: env::var("FRAIS_CERTIFICAT")
                .unwrap_or_else(|_| "5000".into())
                .parse()?,
        })
    }
}

fn required(key: &str) -> anyhow::Result<String> {
    env::var(key).map_err(|_| anyhow::anyhow!("Missing required env var: {}", key))
}
