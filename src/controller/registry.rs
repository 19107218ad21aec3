// src/controller/registry.rs

//! Live process handles, keyed by instance id.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::process::ProcessHandle;

/// One started attempt.
#[derive(Debug)]
pub struct ActiveProcess {
    /// Distinguishes attempts of the same instance; supervision outcomes for
    /// an older generation are ignored.
    pub generation: u64,
    pub handle: ProcessHandle,
    /// Cancels the supervision task.
    pub supervisor: CancellationToken,
}

/// Written only while holding the instance's lock; reads are unguarded
/// snapshots.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    entries: Mutex<HashMap<String, ActiveProcess>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, ActiveProcess>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Returns the displaced entry, which callers treat as a bug and stop.
    pub fn insert(&self, id: &str, process: ActiveProcess) -> Option<ActiveProcess> {
        self.entries().insert(id.to_string(), process)
    }

    pub fn take(&self, id: &str) -> Option<ActiveProcess> {
        let process = self.entries().remove(id)?;
        process.supervisor.cancel();
        Some(process)
    }

    /// Take the entry only if it is still the given attempt.
    pub fn take_if_generation(&self, id: &str, generation: u64) -> Option<ActiveProcess> {
        let mut entries = self.entries();
        if entries.get(id)?.generation != generation {
            return None;
        }
        entries.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn live_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::BoxFuture;
    use crate::process::{ProcessDriver, ProcessIo, StartError, StopError};
    use crate::types::RuntimeMode;

    struct Idle;

    impl ProcessDriver for Idle {
        fn process_id(&self) -> Option<String> {
            None
        }

        fn start<'a>(
            &'a mut self,
            _io: &'a ProcessIo,
            _cancel: &'a CancellationToken,
        ) -> BoxFuture<'a, Result<(), StartError>> {
            Box::pin(async { Ok(()) })
        }

        fn terminate(&mut self, _grace: Duration) -> BoxFuture<'_, Result<(), StopError>> {
            Box::pin(async { Ok(()) })
        }

        fn kill(&mut self) -> BoxFuture<'_, Result<(), StopError>> {
            Box::pin(async { Ok(()) })
        }

        fn release(&mut self) -> BoxFuture<'_, Result<(), StopError>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn active(generation: u64) -> ActiveProcess {
        ActiveProcess {
            generation,
            handle: ProcessHandle::new(RuntimeMode::Native, "wf-1", Box::new(Idle)),
            supervisor: CancellationToken::new(),
        }
    }

    #[test]
    fn stale_generation_is_not_taken() {
        let registry = ProcessRegistry::new();
        assert!(registry.insert("wf-1", active(2)).is_none());

        assert!(registry.take_if_generation("wf-1", 1).is_none());
        assert!(registry.contains("wf-1"));
        assert_eq!(registry.take_if_generation("wf-1", 2).map(|p| p.generation), Some(2));
        assert!(registry.is_empty());
    }

    #[test]
    fn take_cancels_supervision() {
        let registry = ProcessRegistry::new();
        let entry = active(1);
        let supervisor = entry.supervisor.clone();
        registry.insert("wf-1", entry);

        assert!(registry.take("wf-1").is_some());
        assert!(supervisor.is_cancelled());
        assert!(registry.take("wf-1").is_none());
    }
}
