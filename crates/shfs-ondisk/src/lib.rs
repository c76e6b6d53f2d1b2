#![forbid(unsafe_code)]
//! On-disk format parsing and encoding for SHFS volumes.
//!
//! Pure byte-level crate — no I/O, no side effects. Covers the chunk-0 label
//! (common header), the chunk-1 configuration header, and the packed
//! hash-table entry records. Every structure parses from and encodes back to
//! its fixed on-disk layout; the admin tool rewrites entries in place and the
//! test suites format scratch volumes through the same encoders.

pub mod hentry;
pub mod label;

pub use hentry::HashEntry;
pub use label::{AllocatorKind, CommonHeader, ConfigHeader, detect_hdr0};
