//! Reference-counted object base for daemon-side long-lived objects.
//!
//! Models explicit ownership counting with a registered destructor: the
//! count tracks *logical owners* (the registry, a pending save, a graph
//! patch operation), and the last `del_ref` runs the destructor exactly
//! once. Cloning a [`Refcounted`] handle does NOT touch the count — callers
//! that take ownership call [`Refcounted::add_ref`] and balance it with
//! [`Refcounted::del_ref`].
//!
//! Misuse is a programming-error fault, not a recoverable condition:
//! signature mismatch (dangling/corrupted object) and refcount underflow
//! both panic with a diagnostic.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Magic stamped into every live object, "LASH" in ASCII.
const SIGNATURE: u32 = 0x4C41_5348;

/// Signature after the destructor has run.
const DESTROYED: u32 = 0xDEAD_BEEF;

type Destructor<T> = Box<dyn FnOnce(&T) + Send>;

struct Inner<T> {
    signature: AtomicU32,
    count: AtomicU32,
    value: T,
    destructor: Mutex<Option<Destructor<T>>>,
}

/// A shared handle to a refcounted object.
pub struct Refcounted<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Refcounted<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Refcounted<T> {
    /// Create an object with a caller-supplied initial count and destructor.
    pub fn new(initial: u32, value: T, destructor: impl FnOnce(&T) + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                signature: AtomicU32::new(SIGNATURE),
                count: AtomicU32::new(initial),
                value,
                destructor: Mutex::new(Some(Box::new(destructor))),
            }),
        }
    }

    fn check_signature(&self) {
        let sig = self.inner.signature.load(Ordering::Acquire);
        if sig != SIGNATURE {
            panic!("refcounted object has invalid signature {sig:#010x}, expected {SIGNATURE:#010x}");
        }
    }

    /// Take another reference.
    pub fn add_ref(&self) {
        self.check_signature();
        self.inner.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Release one reference; the Nth matching release runs the destructor.
    pub fn del_ref(&self) {
        self.check_signature();
        let prev = self
            .inner
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
            .unwrap_or_else(|_| panic!("refcount underflow: del_ref on count 0"));

        if prev == 1 {
            let destructor = self
                .inner
                .destructor
                .lock()
                .expect("destructor lock poisoned")
                .take();
            if let Some(destructor) = destructor {
                destructor(&self.inner.value);
            }
            self.inner.signature.store(DESTROYED, Ordering::Release);
        }
    }

    /// Access the wrapped value. Faults if the object was already destroyed.
    pub fn get(&self) -> &T {
        self.check_signature();
        &self.inner.value
    }

    pub fn refcount(&self) -> u32 {
        self.check_signature();
        self.inner.count.load(Ordering::Acquire)
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Refcounted<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Refcounted")
            .field("count", &self.inner.count.load(Ordering::Relaxed))
            .field("value", &self.inner.value)
            .finish()
    }
}
