//! Connection interception.
//!
//! The [`ConnectionInterceptor`] stands in for a TCP connect. It resolves
//! the address against the policy registry and then:
//!
//! - **open**: connects for real and returns a stream that records its I/O
//! - **closed**: fails with [`InterceptError::PolicyRefusal`] without I/O
//! - **discard**: returns a stream backed by a simulated unresponsive peer
//! - **delay**: waits, then behaves like open
//!
//! Streams handed out on an allowed connection keep checking the policy;
//! closing their address later makes subsequent reads and writes fail with
//! a refusal. Use [`is_policy_refusal`] or [`REFUSAL_MARKER`] to tell those
//! apart from real network errors.

mod async_stream;
mod discard;
mod error;
mod guard;
mod hold;
mod interceptor;
mod proxy;
mod stream;

pub use async_stream::AsyncSniffedStream;
pub use error::{is_policy_refusal, InterceptError, InterceptResult, REFUSAL_MARKER};
pub use hold::{DelayInfo, DelayOutcome, DelayTicket, DelayedAttempts};
pub use interceptor::{AttemptState, ConnectionInterceptor};
pub use proxy::parse_connect_request;
pub use stream::SniffedStream;
