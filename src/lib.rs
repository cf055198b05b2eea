//! stoneforge — orchestration layers over `stoneforge-core`.
//!
//! [`dispatch`] picks ready-task/agent pairs under pool and rate-limit
//! constraints and issues atomic assign+notify transactions. [`session`]
//! runs provider-agnostic agent sessions (spawn, stream, suspend, resume,
//! interrupt) and normalizes their message streams. [`steward`] executes
//! scheduled reconciliation agents on cron and event triggers.
//!
//! The `sf` CLI binary is a thin shell over these modules honoring the
//! exit-code contract in [`runner`].

pub mod config;
pub mod dispatch;
pub mod runner;
pub mod session;
pub mod steward;
pub mod telemetry;
pub mod workspace;
