//! convoy-lib: Core types and logic for Convoy
//!
//! This crate provides the fundamental pieces of the deployment engine:
//! - `registry`: components, recorders, comparers, and typed actions
//! - `manifest`: snapshots of applied component state, persisted per role
//! - `diff`: before/after comparison driving the changed set
//! - `order`: dependency-ordered execution planning
//! - `plan`: the persistent, resumable step ledger
//! - `deploy`: the orchestration driver tying it all together

pub mod deploy;
pub mod diff;
pub mod manifest;
pub mod order;
pub mod plan;
pub mod registry;
pub mod settings;
pub mod statedir;
