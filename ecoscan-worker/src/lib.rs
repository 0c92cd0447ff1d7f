//! # ecoscan worker
//!
//! Fleet-scale vulnerability scanning worker for a module ecosystem.
//!
//! ## Overview
//!
//! The worker exposes two HTTP surfaces:
//!
//! - **Enqueue**: expand a module population and a set of analysis modes into
//!   deduplicated scan tasks and hand them to the dispatch queue.
//! - **Scan**: execute one scan task: fetch the module (or binary artifact),
//!   run the analyzer inside a sandbox bundle or directly on the host under a
//!   memory budget, and append a structured result row to the analytics
//!   store.
//!
//! ## Architecture
//!
//! Built on Axum and Tokio. External capabilities (module proxy, blob
//! store, analytics store, vulnerability database, dispatch queue) sit
//! behind ports so tests can swap them for fakes. Process-wide scan state
//! (the active-scan counter and the stored work-version snapshot) lives in a
//! [`scan::host::ScanHost`] owned by the application state.

pub mod analytics;
pub mod errors;
pub mod handlers;
pub mod proxy;
pub mod queue;
pub mod routes;
pub mod sandbox;
pub mod scan;
pub mod state;
pub mod storage;
pub mod vulndb;
