//! Deployment module

pub mod fsm;
pub mod procedure;
pub mod service;
pub mod steps;
