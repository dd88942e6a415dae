//! TLS on intercepted connections.
//!
//! A TLS stream layered over an intercepted connection is captured on two
//! layers: the interceptor records ciphertext on the wire layer, and the
//! [`TlsCaptureAdapter`] records the application bytes on the plaintext
//! layer. Queries pick a layer with
//! [`TrafficQuery::layer`](crate::capture::TrafficQuery::layer).

mod capture;
mod connector;
mod error;

pub use capture::{PlaintextTap, Tapped, TlsCaptureAdapter};
pub use connector::{
    client_config, domain_to_server_name, load_native_roots, load_pem_roots, TlsClient,
};
pub use error::{TlsError, TlsResult};
