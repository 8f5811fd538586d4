pub mod error;
pub mod models;
pub mod projection;
pub mod schedule;
