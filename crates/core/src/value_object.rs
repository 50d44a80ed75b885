//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are immutable and compared by their attribute values
/// (`Money`, `Percent`, a reorder-level triple), as opposed to entities,
/// which are tracked by identity.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
