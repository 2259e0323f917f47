//! # Module: self_modify
//!
//! Proposal side of the loop: drafts changes, gates them and lands them.
//!
//! ## Sub-modules
//! - [`planner`]      drafts a [`planner::DecisionCard`] for a capability request
//! - [`invariants`]   rejects cards that touch oversight or transparency surfaces
//! - [`verify`]       runs the card's tests and scans its dependencies
//! - [`memory`]       turns failed cards into avoidance rules
//! - [`merge`]        writes the artifact and registers its entry point
//! - [`registry`]     task and proposal bookkeeping
//! - [`orchestrator`] drives one request through all of the above

pub mod invariants;
pub mod memory;
pub mod merge;
pub mod orchestrator;
pub mod planner;
pub mod registry;
pub mod verify;
