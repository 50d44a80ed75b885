//! Keyed read-model storage abstractions (disposable projections).

pub mod store;

pub use store::{InMemoryReadModelStore, ReadModelStore};
