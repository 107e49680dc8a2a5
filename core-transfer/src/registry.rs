//! Running-task registry.
//!
//! Keyed by resource identity so a second build or start for a resource that
//! is already moving returns the task in flight instead of a duplicate.

use crate::task::Task;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

/// Download identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DownloadKey {
    pub drive_id: String,
    pub file_id: String,
}

/// Upload identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UploadKey {
    pub drive_id: String,
    pub parent_file_id: String,
    pub local_path: std::path::PathBuf,
}

#[derive(Debug)]
pub struct TaskRegistry<K> {
    running: Mutex<HashMap<K, Task>>,
}

impl<K: Eq + Hash> TaskRegistry<K> {
    pub fn new() -> Self {
        Self {
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<Task> {
        self.running
            .lock()
            .ok()
            .and_then(|running| running.get(key).cloned())
    }

    /// Insert unless the key is taken. Check and insert happen under one lock.
    pub fn try_register(&self, key: K, task: &Task) -> bool {
        let Ok(mut running) = self.running.lock() else {
            return false;
        };
        if running.contains_key(&key) {
            return false;
        }
        running.insert(key, task.clone());
        true
    }

    /// Remove `key` if it still maps to `task`.
    pub fn deregister(&self, key: &K, task: &Task) {
        if let Ok(mut running) = self.running.lock() {
            if running.get(key).is_some_and(|t| t.ptr_eq(task)) {
                running.remove(key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.running.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash> Default for TaskRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::tests::download_task;
    use core_runtime::CallbackContext;

    fn key() -> DownloadKey {
        DownloadKey {
            drive_id: "d".to_string(),
            file_id: "f".to_string(),
        }
    }

    #[test]
    fn test_second_registration_is_refused() {
        let callbacks = CallbackContext::new().unwrap();
        let registry = TaskRegistry::new();
        let first = download_task(callbacks.clone());
        let second = download_task(callbacks);

        assert!(registry.try_register(key(), &first));
        assert!(!registry.try_register(key(), &first));
        assert!(!registry.try_register(key(), &second));
        assert!(registry.get(&key()).unwrap().ptr_eq(&first));
    }

    #[test]
    fn test_deregister_only_removes_matching_task() {
        let callbacks = CallbackContext::new().unwrap();
        let registry = TaskRegistry::new();
        let first = download_task(callbacks.clone());
        let other = download_task(callbacks);
        registry.try_register(key(), &first);

        registry.deregister(&key(), &other);
        assert_eq!(registry.len(), 1);

        registry.deregister(&key(), &first);
        assert!(registry.is_empty());
    }
}
