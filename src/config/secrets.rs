//! Secret handling utilities.
//!
//! Re-exports secrecy types so binaries can expose the database URL
//! without depending on secrecy directly.

pub use secrecy::{ExposeSecret, SecretString};
