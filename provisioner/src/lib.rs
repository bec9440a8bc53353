//! vmprov Library
//!
//! Provisions a source repository onto hosts reachable over SSH: validate
//! credentials, connect, sync the checkout, run the setup steps and report
//! per-host outcomes.

pub mod app;
pub mod authn;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod orchestrator;
pub mod ssh;
pub mod storage;
pub mod utils;
