//! Core types, config, errors, and durable stores for Gatehouse.

pub mod clock;
pub mod config;
pub mod error;
pub mod file_store;
pub mod protocol;
pub mod secret;
pub mod token_store;
