//! osmtracker - OpenStreetMap changeset tracker
//!
//! Follows the replication feed, filters the changesets it references
//! against configured label rules and drives the survivors through a
//! multi-stage analysis state machine backed by a shared changeset store.

pub mod analysis;
pub mod bus;
pub mod config;
pub mod model;
pub mod orchestration;
pub mod osmapi;
pub mod replication;
pub mod storage;
pub mod utils;
