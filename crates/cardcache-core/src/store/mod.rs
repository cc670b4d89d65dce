//! SQLite-backed catalog, processing cache and activity log.

pub mod activity;
pub mod catalog;
pub mod database;
pub mod processing;
pub mod schema;

pub use activity::ActivityLog;
pub use database::Database;
