pub mod api;
pub mod event;
pub mod job;
pub mod label;
