//! Command handlers

pub mod config;
pub mod outbox;
pub mod records;
pub mod status;
pub mod sync;
