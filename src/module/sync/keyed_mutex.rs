//! Per-key mutual exclusion
//!
//! `KeyedMutex::acquire(key)` resolves to a [`LockTicket`] once every earlier
//! acquirer of the same key has released. Distinct keys never block each
//! other. There is no timeout; callers own deadlock avoidance.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

/// A key present in the table is locked; its queue holds the waiters in
/// acquisition order.
type LockTable<K> = Arc<Mutex<HashMap<K, VecDeque<oneshot::Sender<LockTicket<K>>>>>>;

fn lock_table<K: Eq + Hash + Clone>(
    table: &Mutex<HashMap<K, VecDeque<oneshot::Sender<LockTicket<K>>>>>,
) -> MutexGuard<'_, HashMap<K, VecDeque<oneshot::Sender<LockTicket<K>>>>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-key FIFO lock
pub struct KeyedMutex<K>
where
    K: Eq + Hash + Clone,
{
    table: LockTable<K>,
}

impl<K> KeyedMutex<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Acquire the lock for `key`, waiting behind earlier holders of the same key
    pub async fn acquire(&self, key: K) -> LockTicket<K> {
        loop {
            let rx = {
                let mut table = lock_table(&self.table);
                match table.entry(key.clone()) {
                    Entry::Vacant(slot) => {
                        slot.insert(VecDeque::new());
                        return LockTicket::new(key, Arc::clone(&self.table));
                    }
                    Entry::Occupied(mut slot) => {
                        let (tx, rx) = oneshot::channel();
                        slot.get_mut().push_back(tx);
                        rx
                    }
                }
            };

            // A sender is only dropped after handing over a ticket, so an
            // error here means our queue entry vanished; queue again.
            if let Ok(ticket) = rx.await {
                return ticket;
            }
        }
    }

    /// Whether some caller currently owns `key`
    pub fn is_locked(&self, key: &K) -> bool {
        lock_table(&self.table).contains_key(key)
    }

    /// Number of callers waiting behind the current owner of `key`
    pub fn waiting(&self, key: &K) -> usize {
        lock_table(&self.table)
            .get(key)
            .map(|waiters| waiters.len())
            .unwrap_or(0)
    }
}

impl<K> Default for KeyedMutex<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive ownership of one key.
///
/// Released on [`LockTicket::release`] or drop. `release` consumes the
/// ticket, so a lock can never be freed twice and one release wakes at most
/// one waiter.
pub struct LockTicket<K>
where
    K: Eq + Hash + Clone,
{
    key: K,
    table: LockTable<K>,
    armed: bool,
}

impl<K> LockTicket<K>
where
    K: Eq + Hash + Clone,
{
    fn new(key: K, table: LockTable<K>) -> Self {
        Self {
            key,
            table,
            armed: true,
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn release(self) {
        drop(self);
    }
}

impl<K> Drop for LockTicket<K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        loop {
            let next = {
                let mut table = lock_table(&self.table);
                let Some(waiters) = table.get_mut(&self.key) else {
                    return;
                };
                match waiters.pop_front() {
                    Some(tx) => tx,
                    None => {
                        table.remove(&self.key);
                        return;
                    }
                }
            };

            let ticket = LockTicket::new(self.key.clone(), Arc::clone(&self.table));
            match next.send(ticket) {
                Ok(()) => return,
                // Waiter gave up (its acquire future was dropped); try the next one
                Err(mut unclaimed) => unclaimed.armed = false,
            }
        }
    }
}

impl<K> fmt::Debug for LockTicket<K>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockTicket").field("key", &self.key).finish()
    }
}
