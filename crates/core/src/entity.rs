//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// Every persisted row in the engine (invoice, payment, allocation, batch, ...) is an
/// entity: two rows with the same id are the same thing even if their balances differ.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
