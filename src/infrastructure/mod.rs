pub mod config;
pub mod error;
pub mod logging;
pub mod session_store;
pub mod storage;
