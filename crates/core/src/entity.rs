//! Entity trait: identity that survives state changes.

/// A persisted row with a database-assigned identity.
///
/// Catalog rows, documents and stock balances all implement this so stores can
/// key them uniformly.
pub trait Entity {
    /// Strongly-typed, copyable identifier.
    type Id: Copy + Eq + Ord + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> Self::Id;
}
