//! wiretap: outbound connection policy enforcement and traffic capture
//!
//! This crate lets a test harness (or a diagnostic tool) decide what happens
//! to every outbound TCP connection a process makes, and records the bytes
//! those connections carry.
//!
//! # Policy Model
//!
//! Each `(host, port)` pattern maps to one decision: **open**, **closed**
//! (refused before any I/O, with an error containing
//! [`intercept::REFUSAL_MARKER`]), **discard** (a connection to a peer that
//! never answers) or **delay**. Unmatched addresses are open.
//!
//! # Architecture
//!
//! - **Policy**: address registry and most-specific-match resolution
//! - **Intercept**: connection interceptor and the stream handles it returns
//! - **Capture**: per-connection packet recording, sessions and grouping
//! - **TLS**: plaintext capture at the TLS boundary
//! - **Config**: hierarchical TOML configuration
//! - **Telemetry**: structured audit events
//! - **Engine**: the [`Wiretap`] facade tying these together

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod capture;
pub mod cli;
pub mod cli_handler;
pub mod config;
pub mod engine;
pub mod intercept;
pub mod policy;
pub mod telemetry;
pub mod tls;

mod sync;

pub use engine::Wiretap;
