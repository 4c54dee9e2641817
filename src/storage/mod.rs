//! Persistent supervisor state
//!
//! Only small files live here: the version tokens compared by the
//! orchestrator. The dataset itself is handled by [`crate::dataset`].

pub mod token;

pub use token::{read_token, write_token, TokenStore, VersionToken};
