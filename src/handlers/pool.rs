//! Free-list pool of reusable handler state.
//!
//! # Responsibilities
//! - Hand out boxed state slots, reusing recycled ones when available
//! - Reset a slot exactly once when its lease ends
//! - Track how many slots are idle and how many are leased
//!
//! # Design Decisions
//! - The pool is an explicit object owned by the proxy, never a global
//! - A lease returns its slot on `release()` or on drop, whichever comes first;
//!   the second attempt is a no-op so a slot can never be inserted twice
//! - `max_idle` caps the free list; excess slots are simply dropped

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// State that can be reset and reused by a later exchange.
pub trait Recycle: Default + Send + 'static {
    /// Clear every reference to the previous exchange.
    fn recycle(&mut self);
}

/// Which handler a pool serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerRole {
    Error,
    ProxyError,
    ProxyResponse,
    ProxyUpgrade,
}

impl HandlerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerRole::Error => "error",
            HandlerRole::ProxyError => "proxy_error",
            HandlerRole::ProxyResponse => "proxy_response",
            HandlerRole::ProxyUpgrade => "proxy_upgrade",
        }
    }
}

impl fmt::Display for HandlerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pool of recyclable `T` slots for one handler role.
pub struct HandlerPool<T: Recycle> {
    role: HandlerRole,
    free: Mutex<Vec<Box<T>>>,
    max_idle: usize,
    leased: AtomicUsize,
}

impl<T: Recycle> HandlerPool<T> {
    /// Create an empty pool that keeps at most `max_idle` slots.
    pub fn new(role: HandlerRole, max_idle: usize) -> Self {
        Self {
            role,
            free: Mutex::new(Vec::new()),
            max_idle,
            leased: AtomicUsize::new(0),
        }
    }

    /// Lease a slot, reusing an idle one when possible.
    pub fn acquire(self: &Arc<Self>) -> Pooled<T> {
        let slot = self
            .free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop()
            .unwrap_or_default();
        self.leased.fetch_add(1, Ordering::Relaxed);

        Pooled {
            pool: Arc::clone(self),
            slot: Some(slot),
        }
    }

    /// Slots currently waiting in the free list.
    pub fn idle(&self) -> usize {
        self.free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Slots currently owned by an exchange.
    pub fn leased(&self) -> usize {
        self.leased.load(Ordering::Relaxed)
    }

    fn put_back(&self, mut slot: Box<T>) {
        slot.recycle();
        self.leased.fetch_sub(1, Ordering::Relaxed);

        let mut free = self
            .free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if free.len() < self.max_idle {
            free.push(slot);
        }
    }
}

impl<T: Recycle> fmt::Debug for HandlerPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerPool")
            .field("role", &self.role)
            .field("idle", &self.idle())
            .field("leased", &self.leased())
            .finish()
    }
}

/// A leased slot. Returned to its pool on release or drop.
pub struct Pooled<T: Recycle> {
    pool: Arc<HandlerPool<T>>,
    slot: Option<Box<T>>,
}

impl<T: Recycle> Pooled<T> {
    /// Return the slot to the pool. Later calls do nothing.
    pub fn release(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.put_back(slot);
        }
    }

    pub fn is_released(&self) -> bool {
        self.slot.is_none()
    }

    pub fn get(&self) -> Option<&T> {
        self.slot.as_deref()
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        self.slot.as_deref_mut()
    }
}

impl<T: Recycle> Drop for Pooled<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T: Recycle> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("role", &self.pool.role)
            .field("released", &self.is_released())
            .finish()
    }
}
