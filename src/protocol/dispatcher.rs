//! # Handler Registry
//!
//! Maps integer message ids to handler closures.
//!
//! Handlers are stored behind `Arc` so a lookup can hand the handler out and
//! release the registry before the handler runs; the handler is then free to
//! mutate the state that owns the registry.
//!
//! Id `0` belongs to the handshake. The server and client register their own
//! id-0 handler when they are built, so application code that tries to claim it
//! gets `DuplicateHandlerId` like any other collision.

use crate::error::{NetError, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Message-id keyed table of handlers of type `H`
pub struct HandlerRegistry<H: ?Sized> {
    handlers: HashMap<i32, Arc<H>>,
}

impl<H: ?Sized> Default for HandlerRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: ?Sized> HandlerRegistry<H> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` for `id`.
    ///
    /// Fails with `InvalidHandlerId` for negative ids and `DuplicateHandlerId`
    /// when the id is already taken.
    pub fn register(&mut self, id: i32, handler: Arc<H>) -> Result<()> {
        if id < 0 {
            return Err(NetError::InvalidHandlerId(id));
        }
        if self.handlers.contains_key(&id) {
            return Err(NetError::DuplicateHandlerId(id));
        }
        self.handlers.insert(id, handler);
        Ok(())
    }

    /// Fetch the handler registered for `id`
    pub fn lookup(&self, id: i32) -> Result<Arc<H>> {
        self.handlers
            .get(&id)
            .cloned()
            .ok_or(NetError::UnknownHandlerId(id))
    }

    pub fn contains(&self, id: i32) -> bool {
        self.handlers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<H: ?Sized> fmt::Debug for HandlerRegistry<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.handlers.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("HandlerRegistry").field("ids", &ids).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Handler = dyn Fn(i32) -> i32 + Send + Sync;

    fn double() -> Arc<Handler> {
        Arc::new(|x| x * 2)
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = HandlerRegistry::<Handler>::new();
        registry.register(5, double()).unwrap();

        let handler = registry.lookup(5).unwrap();
        assert_eq!(handler(21), 42);
        assert!(registry.contains(5));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut registry = HandlerRegistry::<Handler>::new();
        registry.register(5, double()).unwrap();
        assert!(matches!(
            registry.register(5, double()),
            Err(NetError::DuplicateHandlerId(5))
        ));
        // the original handler survives the rejected registration
        assert_eq!(registry.lookup(5).unwrap()(1), 2);
    }

    #[test]
    fn test_negative_id_rejected() {
        let mut registry = HandlerRegistry::<Handler>::new();
        assert!(matches!(
            registry.register(-1, double()),
            Err(NetError::InvalidHandlerId(-1))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unknown_id_lookup() {
        let registry = HandlerRegistry::<Handler>::new();
        assert!(matches!(
            registry.lookup(99),
            Err(NetError::UnknownHandlerId(99))
        ));
    }

    #[test]
    fn test_handshake_id_can_be_taken_once() {
        let mut registry = HandlerRegistry::<Handler>::new();
        registry.register(0, double()).unwrap();
        assert!(matches!(
            registry.register(0, double()),
            Err(NetError::DuplicateHandlerId(0))
        ));
    }
}
