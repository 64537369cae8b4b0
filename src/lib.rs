//! Image labeling pipeline
//!
//! Upload events are turned into idempotent jobs, queued, and processed by
//! workers that call a label detection service and record the most confident
//! label per object.

pub mod app_state;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
