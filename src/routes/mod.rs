pub mod health;
pub mod metrics;
pub mod reports;
pub mod students;
pub mod transfers;
