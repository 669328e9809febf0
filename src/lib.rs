pub mod auth;
pub mod calendar;
pub mod config;
pub mod engine;
pub mod jobs;
pub mod limits;
pub mod model;
pub mod observability;
pub mod push;
pub mod reminders;
pub mod sql;
pub mod wal;
pub mod wire;
