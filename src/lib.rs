pub mod agent;
pub mod config;
pub mod dashboard;
pub mod detector;
pub mod error;
pub mod shutdown;
