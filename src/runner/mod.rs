//! Runner module - execution of trusted helper programs
//!
//! Trusted programs (special judges shipped with the problem data) run
//! directly on the host, bounded only by a wall-clock timeout. Untrusted
//! code never goes through here; see the sandbox module.

pub mod trusted;

pub use trusted::{TrustedOutput, TrustedRunner};
