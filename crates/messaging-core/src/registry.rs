use std::{
    collections::{BTreeMap, BTreeSet, btree_map::Entry},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// Effect of one registry mutation on the tracked set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryChange {
    /// The set went from empty to non-empty.
    Activated,
    /// The set went from non-empty to empty.
    Deactivated,
    /// The set changed but stayed non-empty.
    Updated,
    /// The mutation was a no-op.
    Unchanged,
}

impl RegistryChange {
    /// Whether the poll run condition may have flipped.
    pub fn affects_run_condition(self) -> bool {
        matches!(self, Self::Activated | Self::Deactivated)
    }

    fn between(was_empty: bool, changed: bool, is_empty: bool) -> Self {
        match (changed, was_empty, is_empty) {
            (false, _, _) => Self::Unchanged,
            (true, true, false) => Self::Activated,
            (true, false, true) => Self::Deactivated,
            (true, _, _) => Self::Updated,
        }
    }
}

/// Thread-safe set of chat IDs currently being polled.
///
/// Every operation takes the same lock, so concurrent callers observe a
/// linearizable sequence of mutations. Each registration carries a
/// generation that is never reused, so a result fetched for an earlier
/// registration of the same ID can be told apart from the current one.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<Entries>>,
}

#[derive(Debug, Default)]
struct Entries {
    ids: BTreeMap<String, u64>,
    next_generation: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotently add a chat ID. Re-adding keeps the current generation.
    pub fn register(&self, chat_id: impl Into<String>) -> RegistryChange {
        let mut entries = self.lock();
        let was_empty = entries.ids.is_empty();
        let generation = entries.next_generation;
        let inserted = match entries.ids.entry(chat_id.into()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(generation);
                true
            }
        };
        if inserted {
            entries.next_generation = generation.wrapping_add(1);
        }
        RegistryChange::between(was_empty, inserted, entries.ids.is_empty())
    }

    /// Idempotently remove a chat ID.
    pub fn deregister(&self, chat_id: &str) -> RegistryChange {
        let mut entries = self.lock();
        let was_empty = entries.ids.is_empty();
        let removed = entries.ids.remove(chat_id).is_some();
        RegistryChange::between(was_empty, removed, entries.ids.is_empty())
    }

    /// Remove `chat_id` only while it is still the registration `generation`.
    pub fn deregister_generation(&self, chat_id: &str, generation: u64) -> RegistryChange {
        let mut entries = self.lock();
        let was_empty = entries.ids.is_empty();
        let removed = entries.ids.get(chat_id) == Some(&generation);
        if removed {
            entries.ids.remove(chat_id);
        }
        RegistryChange::between(was_empty, removed, entries.ids.is_empty())
    }

    /// Remove every chat ID.
    pub fn clear(&self) -> RegistryChange {
        let mut entries = self.lock();
        let was_empty = entries.ids.is_empty();
        entries.ids.clear();
        RegistryChange::between(was_empty, !was_empty, true)
    }

    /// Point-in-time copy of the tracked IDs.
    pub fn snapshot(&self) -> BTreeSet<String> {
        self.lock().ids.keys().cloned().collect()
    }

    /// Point-in-time copy of the tracked IDs with their generations.
    pub fn generations(&self) -> BTreeMap<String, u64> {
        self.lock().ids.clone()
    }

    /// Generation of the current registration of `chat_id`, if tracked.
    pub fn generation(&self, chat_id: &str) -> Option<u64> {
        self.lock().ids.get(chat_id).copied()
    }

    pub fn contains(&self, chat_id: &str) -> bool {
        self.lock().ids.contains_key(chat_id)
    }

    pub fn len(&self) -> usize {
        self.lock().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().ids.is_empty()
    }

    // A panic while holding the lock cannot leave a BTreeMap half-mutated.
    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
