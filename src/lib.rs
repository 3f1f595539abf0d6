//! ChainLedger - Durable block storage, fork resolution and peer replication
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Durability
//! - [`wal`] - Append-only write-ahead log with checksummed records
//! - [`snapshot`] - Periodic full-state snapshots bounding WAL replay
//! - [`store`] - Canonical chain store built on WAL + snapshots
//!
//! ## Consensus Bookkeeping
//! - [`block`] - Block structure, hashing and verification seams
//! - [`fork`] - Competing-branch tracking and deterministic resolution
//!
//! ## Replication
//! - [`replication`] - Chunked catch-up sync from peers
//!
//! ## Orchestration & Utilities
//! - [`node`] - Top-level node wiring and lifecycle
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Durability
// ============================================================================
pub mod snapshot;
pub mod store;
pub mod wal;

// ============================================================================
// Consensus Bookkeeping
// ============================================================================
pub mod block;
pub mod fork;

// ============================================================================
// Replication
// ============================================================================
pub mod replication;

// ============================================================================
// Orchestration & Utilities
// ============================================================================
pub mod config;
pub mod error;
pub mod node;
