//! # avn-tests
//!
//! Integration tests for the Avalanria sync node.
//!
//! This crate provides:
//! - Chain and transaction generators
//! - A harness running the full sync service against packet-level peers
//! - End-to-end sync scenarios
//! - Property-based tests for sync invariants

pub mod generators;
pub mod harness;


#[cfg(test)]
mod property_tests;

pub use generators::*;
pub use harness::*;
