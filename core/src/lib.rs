//! dialer-core: lead assignment and reuse engine for a multi-tenant
//! sales dialer.
//!
//! Components are stateless services over an `EngineStore` connection.
//! Give each concurrent caller its own connection; the database is the
//! only shared state.

pub mod agent;
pub mod assignment;
pub mod assignment_manager;
pub mod auth;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod lead;
pub mod reaper;
pub mod reuse_policy;
pub mod reuse_scheduler;
pub mod store;
pub mod sweep;
pub mod types;
