//! Inventory consistency engine for bulk-oil deliveries.
//!
//! Tracks liters as they move between per-driver tanker balances and
//! per-branch tank slots. Branch tank writes are guarded by optimistic
//! concurrency control; every load and supply lands in an append-only ledger.

pub mod branch;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod ledger;
pub mod photo;
pub mod reconcile;
pub mod sequence;
pub mod service;
pub mod session;
pub mod store;
pub mod tanker;
pub mod telemetry;
pub mod types;
pub mod utils;

pub use error::InventoryError;
pub use service::{InventoryService, LoadRequest, SupplyRequest};
