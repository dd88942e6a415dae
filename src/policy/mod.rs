//! Address policy: what happens to a connection attempt to a given address.
//!
//! The [`PolicyRegistry`] maps `(host, port)` patterns to a [`Decision`]
//! (open, closed, discard, or delay). Either half of a key can be the
//! wildcard (`*` for hosts, `-1` for ports). The [`AddressMatcher`] picks the
//! most specific entry for a concrete address.
//!
//! # Example
//!
//! ```ignore
//! use wiretap::policy::{Decision, PolicyRegistry};
//!
//! let registry = PolicyRegistry::new();
//! registry.set_status("payments.internal", -1, Decision::Closed)?;
//! registry.set_status("*", 6379, Decision::Discard)?;
//!
//! // Between test cases
//! registry.clear();
//! ```

mod decision;
mod error;
mod matcher;
mod pattern;
mod registry;
mod store;

pub use decision::Decision;
pub use error::{PolicyError, PolicyResult};
pub use matcher::{resolve_in, AddressMatcher, Resolution};
pub use pattern::{
    display_address, normalize_host, parse_host_port, AddressPattern, HostPattern, PortPattern,
    ANY_HOST, ANY_PORT,
};
pub use registry::{PolicyEntry, PolicyKey, PolicyRegistry, PolicySnapshot};
