//! SDK helpers that wrap the low-level session bindings with an ergonomic
//! client.
//!
//! This module provides the authoritative reference for higher-level
//! behavior, including the connect → handshake → invoke lifecycle and the
//! capability registry helpers. Documented guarantees here are canonical.
pub mod client;

pub use client::TetherClient;
