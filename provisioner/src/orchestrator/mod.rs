//! Target orchestration

pub mod run;
