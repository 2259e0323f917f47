//! # genesis-kernel
//!
//! A supervised change loop. A capability request becomes a decision card,
//! the card is checked against protected invariants, verified, optionally
//! reviewed, and integrated. Failed proposals are consolidated into
//! avoidance rules that steer later planning.
//!
//! - [`self_tune`]: goal engine and homeostasis monitor
//! - [`self_modify`]: planner, invariants, verifier, memory, integrator and
//!   the orchestrator that drives them
//! - [`web`]: HTTP surface over the orchestrator
//! - [`store`]: SQLite persistence for proposals and avoidance rules

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod providers;
pub mod self_modify;
pub mod self_tune;
pub mod store;
pub mod util;
pub mod web;
