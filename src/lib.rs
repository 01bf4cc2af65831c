#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

pub mod code;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fetch;
pub mod format;
pub mod patcher;
pub mod verifier;

#[cfg(test)]
mod proptests;
#[cfg(test)]
mod testing;

pub use config::VerifierConfig;
pub use error::{result_code, ErrorCode, PayloadError};
pub use fetch::{cancel_pair, CancelHandle, CancelSignal, Transport};
pub use patcher::{AddressSpace, ImageBuffer, ProcessMemory};
pub use verifier::{PayloadVerifier, VerifiedPayload, VerifyOutcome};
