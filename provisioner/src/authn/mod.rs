//! Credential descriptors and their sources

pub mod credential;
pub mod env;
