use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::sync::OnceCell;

/// Keyed load-once cells.
///
/// Concurrent `get_or_try_init` calls for the same key run the initializer at
/// most once at a time; every caller waits for it and receives a clone of the
/// stored value. A failed initialization leaves the cell empty, so the next
/// caller retries; the key is forgotten once no caller is left waiting on it.
/// Values live until [`clear`](Self::clear) or drop.
#[derive(Debug)]
pub struct SingleFlight<K, V> {
    cells: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_try_init<E, F, Fut>(&self, key: &K, init: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cell = {
            let mut cells = self.cells.lock();
            Arc::clone(cells.entry(key.clone()).or_default())
        };

        let result = cell.get_or_try_init(init).await.cloned();
        if result.is_err() {
            self.forget_failed(key, cell);
        }
        result
    }

    /// Drops the entry for `key` if it is still `cell`, uninitialized and
    /// unused by any other caller.
    fn forget_failed(&self, key: &K, cell: Arc<OnceCell<V>>) {
        let ptr = Arc::as_ptr(&cell);
        drop(cell);

        let mut cells = self.cells.lock();
        let stale = cells.get(key).is_some_and(|current| {
            std::ptr::eq(Arc::as_ptr(current), ptr)
                && !current.initialized()
                && Arc::strong_count(current) == 1
        });
        if stale {
            cells.remove(key);
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let cells = self.cells.lock();
        cells.get(key).and_then(|cell| cell.get().cloned())
    }

    /// Number of keys holding an initialized value.
    pub fn len(&self) -> usize {
        let cells = self.cells.lock();
        cells.values().filter(|cell| cell.initialized()).count()
    }

    /// Number of tracked keys, including ones still loading.
    pub fn key_count(&self) -> usize {
        self.cells.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.cells.lock().clear();
    }
}
