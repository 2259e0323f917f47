//! Intrinsic signals the change loop optimizes for and watches.
//!
//! - [`goal_engine`]: prime axioms, risk-adjusted reward, post-merge reinforcement
//! - [`homeostasis`]: sampled latency / memory / API-cost metabolism

pub mod goal_engine;
pub mod homeostasis;
