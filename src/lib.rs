//! Raid Ledger Library
//!
//! Incrementally cached snapshots of a raid DKP database plus the joined
//! views built on them (loot, standings, audit log, drop sources).

pub mod audit;
pub mod cache;
pub mod joins;
pub mod ledger;
pub mod models;
pub mod query;
pub mod reconcile;
pub mod remote;
pub mod service;
pub mod sources;
