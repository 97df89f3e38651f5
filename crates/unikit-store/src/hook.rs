//! Request interception for store operations.

use unikit_common::error::Result;

/// The store operation a hook is being consulted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Single-object read.
    Get,
    /// Multi-object read.
    List,
    /// Create or replace.
    Upsert,
    /// Removal.
    Delete,
}

/// A hook consulted before every store operation completes.
///
/// The canonical implementation is a platform filter: it rejects writes
/// whose platform differs from the store's owning platform and discards
/// non-matching items from listings.
pub trait BeforeHook<T>: Send + Sync {
    /// Inspects `obj` for `op`.
    ///
    /// Returning `Ok(Some(obj))` continues the operation with the possibly
    /// transformed object; `Ok(None)` silently discards the object (only
    /// meaningful for [`Op::List`]); an error aborts the operation.
    ///
    /// # Errors
    ///
    /// Implementations reject objects that must not pass through the store.
    fn before(&self, op: Op, obj: &T) -> Result<Option<T>>;
}
