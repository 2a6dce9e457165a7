//! Async-result support types.
//!
//! Async mode changes the shape of values, not the scheduling model: an async
//! filter or test produces a pending [`AsyncCell`] that the VM resolves
//! synchronously at the point of use. Ids come from a per-environment
//! monotonic counter, so no process-wide state is needed.

use std::fmt;

use crate::{error::RunResult, value::Value};

/// Unique identifier for a deferred async result.
///
/// Sequential integers allocated by the owning environment. The counter always
/// increments, even when a result resolves immediately, to keep ids unique
/// within one environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct AsyncId(u32);

impl AsyncId {
    #[inline]
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

/// Deferred work producing a value when the VM reaches the point of use.
pub(crate) type Resolver = Box<dyn FnOnce() -> RunResult<Value>>;

/// The state of an async result value.
///
/// A pending cell holds the deferred computation; awaiting it runs the
/// resolver and stores the outcome so later uses see the resolved value.
/// Resolution is single-shot: the resolver is consumed on first await.
pub(crate) enum AsyncCell {
    /// Not yet resolved; the resolver is invoked on first use.
    Pending { id: AsyncId, resolver: Option<Resolver> },
    /// Resolved; the value is transparently unwrapped at every use.
    Resolved(Value),
}

impl AsyncCell {
    pub fn pending(id: AsyncId, resolver: Resolver) -> Self {
        Self::Pending {
            id,
            resolver: Some(resolver),
        }
    }

    /// Runs the resolver if this cell is still pending, storing the result.
    ///
    /// Returns a clone of the resolved value. A pending cell whose resolver
    /// was already taken (re-entrant resolution) is an internal invariant
    /// violation and resolves to undefined.
    pub fn resolve(&mut self) -> RunResult<Value> {
        match self {
            Self::Resolved(value) => Ok(value.clone()),
            Self::Pending { resolver, .. } => {
                let value = match resolver.take() {
                    Some(resolver) => resolver()?,
                    None => Value::Undefined,
                };
                *self = Self::Resolved(value.clone());
                Ok(value)
            }
        }
    }
}

impl fmt::Debug for AsyncCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending { id, .. } => f.debug_struct("Pending").field("id", id).finish_non_exhaustive(),
            Self::Resolved(value) => f.debug_tuple("Resolved").field(value).finish(),
        }
    }
}
