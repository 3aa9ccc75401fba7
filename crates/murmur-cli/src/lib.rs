//! Local operations behind the `murmur` binary.
//!
//! The binary works on one installation's redb store: it creates the
//! identity, tops up and exports prekey bundles, computes safety numbers
//! against pinned peer identities, and seals, opens and rotates mapping
//! vault records.

#![forbid(unsafe_code)]

pub mod error;
pub mod local;

pub use error::CliError;
pub use local::{LocalStore, parse_identity};
