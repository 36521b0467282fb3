pub mod auth;
pub mod report;
pub mod student;
pub mod transfer;
pub mod user;
