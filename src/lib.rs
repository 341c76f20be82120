//! Signed product QR codes: issuance, verification and replay detection.
//!
//! This crate provides:
//! - RSA-PSS/SHA-256 signing of a canonical product payload
//! - A key provider that fails closed when no key is active
//! - An atomic scan ledger that tells first use from reuse
//! - Risk scoring and rate limiting for the legacy barcode path
//! - Append-only audit logs in SQLite
//! - C-ABI FFI exports for native callers
//!
//! The CLI wrapper lives in `src/main.rs`.

#![deny(unsafe_code)]

pub mod error;
pub mod config;

pub mod api;
pub mod audit;
pub mod catalog;
pub mod keys;
pub mod ledger;
pub mod legacy;
pub mod payload;
pub mod ratelimit;
pub mod risk;
pub mod signing;
pub mod store;
pub mod util;
pub mod verify;

#[allow(unsafe_code)]
pub mod ffi;

#[cfg(test)]
mod testutil;
