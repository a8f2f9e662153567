use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use hashbrown::HashMap;

use super::task::DriverTask;
use crate::ids::FragmentInstanceId;

/// Total ordering over schedule priorities.
#[derive(Debug, Clone, Copy)]
pub struct PriorityKey(pub f64);

impl PartialEq for PriorityKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PriorityKey {}

impl PartialOrd for PriorityKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Priority queue of tasks that also supports lookup and removal by id.
///
/// Lowest key is polled first. Ties are broken by task id so ordering is
/// deterministic.
#[derive(Debug)]
pub struct IndexedQueue<K: Ord + Copy> {
    order: BTreeSet<(K, FragmentInstanceId)>,
    entries: HashMap<FragmentInstanceId, (K, Arc<DriverTask>)>,
}

impl<K: Ord + Copy> IndexedQueue<K> {
    pub fn new() -> Self {
        IndexedQueue {
            order: BTreeSet::new(),
            entries: HashMap::new(),
        }
    }

    /// Insert a task, replacing its key if it's already present.
    pub fn push(&mut self, key: K, task: Arc<DriverTask>) {
        let id = task.id();
        if let Some((old_key, _)) = self.entries.insert(id, (key, task)) {
            self.order.remove(&(old_key, id));
        }
        self.order.insert((key, id));
    }

    pub fn pop(&mut self) -> Option<Arc<DriverTask>> {
        let (_, id) = self.order.pop_first()?;
        self.entries.remove(&id).map(|(_, task)| task)
    }

    pub fn get(&self, id: &FragmentInstanceId) -> Option<&Arc<DriverTask>> {
        self.entries.get(id).map(|(_, task)| task)
    }

    pub fn contains(&self, id: &FragmentInstanceId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn remove(&mut self, id: &FragmentInstanceId) -> Option<Arc<DriverTask>> {
        let (key, task) = self.entries.remove(id)?;
        self.order.remove(&(key, *id));
        Some(task)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<DriverTask>> {
        self.entries.values().map(|(_, task)| task)
    }

    /// Iterate in poll order without removing anything.
    pub fn iter_ordered(&self) -> impl Iterator<Item = (K, &Arc<DriverTask>)> {
        self.order
            .iter()
            .filter_map(|(key, id)| self.entries.get(id).map(|(_, task)| (*key, task)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Ord + Copy> Default for IndexedQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}
