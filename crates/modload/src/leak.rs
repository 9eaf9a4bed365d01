//! Diagnostic tracking of released modules.
//!
//! After a module set is released, the detector keeps weak references to
//! its modules. Any that are still alive later are being retained by the
//! host somewhere.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::warn;

use crate::types::LoadedModule;

/// Observes modules that should be dropped soon.
pub trait LeakDetector: Send + Sync {
    /// Start watching a released module.
    fn watch(&self, module: Weak<LoadedModule>, note: &str);
}

/// Detector that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLeakDetector;

impl LeakDetector for NoopLeakDetector {
    fn watch(&self, _module: Weak<LoadedModule>, _note: &str) {}
}

struct Watched {
    module: Weak<LoadedModule>,
    note: String,
}

/// A module still alive after release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leak {
    pub name: String,
    pub id: String,
    pub note: String,
    pub strong_count: usize,
}

/// Detector that remembers released modules until they are dropped.
#[derive(Default)]
pub struct TrackingLeakDetector {
    watched: Mutex<Vec<Watched>>,
}

impl std::fmt::Debug for TrackingLeakDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingLeakDetector")
            .field("watched", &self.watched.lock().len())
            .finish()
    }
}

impl TrackingLeakDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Released modules that are still alive. Dropped ones are forgotten.
    pub fn leaks(&self) -> Vec<Leak> {
        let mut watched = self.watched.lock();
        watched.retain(|w| w.module.strong_count() > 0);
        watched
            .iter()
            .filter_map(|w| {
                let module: Arc<LoadedModule> = w.module.upgrade()?;
                Some(Leak {
                    name: module.name.clone(),
                    id: module.id.clone(),
                    note: w.note.clone(),
                    // Minus the upgrade above.
                    strong_count: Arc::strong_count(&module) - 1,
                })
            })
            .collect()
    }

    /// Log every current leak; returns how many were found.
    pub fn report(&self) -> usize {
        let leaks = self.leaks();
        for leak in &leaks {
            warn!(
                name = %leak.name,
                id = %leak.id,
                note = %leak.note,
                strong_count = leak.strong_count,
                "module retained after release"
            );
        }
        leaks.len()
    }
}

impl LeakDetector for TrackingLeakDetector {
    fn watch(&self, module: Weak<LoadedModule>, note: &str) {
        self.watched.lock().push(Watched {
            module,
            note: note.to_string(),
        });
    }
}
