//! Per-entity logical write locks.
//!
//! Writers hold the lock for the duration of their transaction; readers
//! never take one. Pair acquisition is id-ordered so concurrent `relate`
//! calls on crossing edges cannot deadlock.

use std::collections::HashSet;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use mnemo_error::Result;
use mnemo_types::{Cx, Uid};

/// Registry of held entity locks.
#[derive(Default, Debug)]
pub struct EntityLocks {
    held: Mutex<HashSet<Uid>>,
    released: Condvar,
}

impl EntityLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for one entity, waiting while another writer holds
    /// it. Honors cancellation and deadlines through `cx`.
    pub fn acquire(&self, cx: &Cx, id: Uid) -> Result<EntityGuard<'_>> {
        let mut held = self.held.lock();
        loop {
            cx.checkpoint_with("entity lock")?;
            if held.insert(id) {
                return Ok(EntityGuard {
                    locks: self,
                    ids: vec![id],
                });
            }
            self.released
                .wait_for(&mut held, Duration::from_millis(25));
        }
    }

    /// Acquire two entity locks in ascending-id order.
    pub fn acquire_pair(&self, cx: &Cx, a: Uid, b: Uid) -> Result<EntityGuard<'_>> {
        if a == b {
            return self.acquire(cx, a);
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let mut held = self.held.lock();
        loop {
            cx.checkpoint_with("entity lock")?;
            if !held.contains(&first) && !held.contains(&second) {
                held.insert(first);
                held.insert(second);
                return Ok(EntityGuard {
                    locks: self,
                    ids: vec![first, second],
                });
            }
            self.released
                .wait_for(&mut held, Duration::from_millis(25));
        }
    }

    /// Number of currently held locks.
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }
}

/// RAII guard releasing its entity locks on drop.
#[derive(Debug)]
pub struct EntityGuard<'a> {
    locks: &'a EntityLocks,
    ids: Vec<Uid>,
}

impl Drop for EntityGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock();
        for id in &self.ids {
            held.remove(id);
        }
        drop(held);
        self.locks.released.notify_all();
    }
}
