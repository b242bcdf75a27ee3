use std::{
    ops::{Deref, DerefMut},
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
};

use anyhow::Result;
use tracing::debug;

use crate::{
    backend::{CompiledModel, InferRequest},
    options::StateFlags,
};

/// A request together with the flag values last applied to it.
pub struct ManagedRequest {
    pub request: Box<dyn InferRequest>,
    pub flags: StateFlags,
}

/// A fixed set of requests for one compiled model.
///
/// [`RequestPool::acquire`] blocks until a request is idle and hands it out
/// behind a [`PooledRequest`], which puts it back when dropped.
pub struct RequestPool {
    name: &'static str,
    slots: Vec<Mutex<ManagedRequest>>,
    idle: Mutex<Vec<usize>>,
    released: Condvar,
    input_count: usize,
    output_names: Vec<String>,
}

impl RequestPool {
    pub fn new(name: &'static str, compiled: &dyn CompiledModel) -> Result<Self> {
        let capacity = compiled.optimal_concurrency().max(1);
        let slots = (0..capacity)
            .map(|_| {
                Ok(Mutex::new(ManagedRequest {
                    request: compiled.create_request()?,
                    flags: StateFlags::default(),
                }))
            })
            .collect::<Result<Vec<_>>>()?;
        debug!("Created {capacity} `{name}` requests.");
        Ok(Self {
            name,
            slots,
            idle: Mutex::new((0..capacity).rev().collect()),
            released: Condvar::new(),
            input_count: compiled.input_count(),
            output_names: compiled.output_names(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn idle_count(&self) -> usize {
        self.lock_idle().len()
    }

    pub fn input_count(&self) -> usize {
        self.input_count
    }

    pub fn has_output(&self, name: &str) -> bool {
        self.output_names.iter().any(|n| n == name)
    }

    fn lock_idle(&self) -> MutexGuard<'_, Vec<usize>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for an idle request.
    pub fn acquire(&self) -> PooledRequest<'_> {
        let mut idle = self.lock_idle();
        let slot = loop {
            if let Some(slot) = idle.pop() {
                break slot;
            }
            idle = self
                .released
                .wait(idle)
                .unwrap_or_else(PoisonError::into_inner);
        };
        drop(idle);

        // The slot index is exclusively ours, so this lock is never contended for long.
        let request = self.slots[slot]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        PooledRequest {
            pool: self,
            slot,
            request,
        }
    }
}

/// Exclusive use of one pooled request until dropped.
pub struct PooledRequest<'a> {
    pool: &'a RequestPool,
    slot: usize,
    request: MutexGuard<'a, ManagedRequest>,
}

impl PooledRequest<'_> {
    /// Stable identity of the underlying request within its pool.
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl Deref for PooledRequest<'_> {
    type Target = ManagedRequest;

    fn deref(&self) -> &ManagedRequest {
        &self.request
    }
}

impl DerefMut for PooledRequest<'_> {
    fn deref_mut(&mut self) -> &mut ManagedRequest {
        &mut self.request
    }
}

impl Drop for PooledRequest<'_> {
    fn drop(&mut self) {
        self.pool.lock_idle().push(self.slot);
        self.pool.released.notify_one();
    }
}
