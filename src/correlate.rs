//! Bookkeeping for outbound requests that expect a reply.
//!
//! A [`Correlator`] issues monotonically increasing request identifiers and
//! holds the caller-supplied context for each in-flight request until a
//! matching reply resolves it, or a disconnect drains everything. The
//! context type is opaque here; the session layer decides what it means.

use std::collections::HashMap;

use thiserror::Error;

/// Internal invariant violation: an id was tracked twice.
///
/// Cannot happen while ids come from [`Correlator::next_id`], but the
/// failure is surfaced rather than silently overwriting a live context.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("request id {0} is already tracked")]
pub struct DuplicateId(pub u64);

/// Issues request ids and maps in-flight ids to caller context.
#[derive(Debug)]
pub struct Correlator<C> {
    next_id: u64,
    pending: HashMap<u64, C>,
}

impl<C> Correlator<C> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
        }
    }

    /// A fresh identifier, strictly greater than every previously issued one.
    pub fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Record the context for an in-flight request.
    ///
    /// # Errors
    ///
    /// Returns [`DuplicateId`] if the id is already tracked.
    pub fn track(&mut self, id: u64, context: C) -> Result<(), DuplicateId> {
        if self.pending.contains_key(&id) {
            return Err(DuplicateId(id));
        }
        self.pending.insert(id, context);
        Ok(())
    }

    /// Remove and return the context for `id`, if tracked.
    ///
    /// Unknown ids yield `None`; replies for requests we never tracked are
    /// the caller's to log and ignore.
    pub fn resolve(&mut self, id: u64) -> Option<C> {
        self.pending.remove(&id)
    }

    /// Remove and return every pending entry, for uniform failure on
    /// disconnect.
    pub fn drain(&mut self) -> Vec<(u64, C)> {
        self.pending.drain().collect()
    }

    /// Number of in-flight requests.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<C> Default for Correlator<C> {
    fn default() -> Self {
        Self::new()
    }
}
