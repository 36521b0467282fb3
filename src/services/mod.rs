pub mod export;
pub mod filters;
pub mod metrics;
pub mod payroll;
pub mod reports;
pub mod students;
pub mod transfers;
pub mod workflow;
