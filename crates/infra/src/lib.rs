//! Infrastructure layer: event store, command dispatch, read models,
//! projections, the alert registry, and the pharmacy orchestration facade.

/// Aggregate-type identifiers naming each stream family.
pub mod streams {
    pub const MEDICINE: &str = "pharmacy.medicine";
    pub const STOCK: &str = "pharmacy.stock";
    pub const SALE: &str = "pharmacy.sale";
}

pub mod alert_registry;
pub mod bill_numbers;
pub mod command_dispatcher;
pub mod event_store;
pub mod pharmacy;
pub mod projections;
pub mod read_model;
