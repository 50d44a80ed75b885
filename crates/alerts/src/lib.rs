//! Alert engine: derives low-stock / stock-out / expiry-warning conditions
//! from stock state and manages the alert lifecycle.

pub mod alert;
pub mod engine;

pub use alert::{Alert, AlertId, AlertKind, AlertPolicy, AlertStatus, ConditionKey};
pub use engine::{AlertDelta, desired_conditions, diff_conditions};
