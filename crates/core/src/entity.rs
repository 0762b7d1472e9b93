//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// `KIND` is a stable, lowercase name for the entity type (e.g. `"product"`).
/// Infrastructure derives per-instance keys from it (`product:widget`) and a
/// collection key for listings (`product:all`).
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug + core::fmt::Display;

    /// Stable entity kind.
    const KIND: &'static str;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
