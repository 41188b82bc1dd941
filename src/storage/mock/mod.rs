//! In-memory storage implementations for tests and standalone runs.

mod changeset_store;
mod context_store;

pub use changeset_store::MockChangesetStore;
pub use context_store::MockContextStore;

#[cfg(test)]
mod tests;
