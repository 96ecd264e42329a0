//! Collaborator traits the stages consume but do not implement.

use std::sync::Arc;

use async_trait::async_trait;
use tidewire_core::Error;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Something that has finished work the user has not seen yet (background
/// tasks, mostly).
#[async_trait]
pub trait NotificationSource: Send + Sync {
    /// Unread notifications, oldest first. Returned items count as read.
    async fn take_unread(&self) -> Vec<String>;
}

/// An optional subsystem that is loaded on first use and shut down with
/// the engine.
#[async_trait]
pub trait Subsystem: Send + Sync {
    fn name(&self) -> &str;

    async fn load(&self) -> Result<(), Error>;

    async fn shutdown(&self) {}
}

/// The engine's subsystems. Each one loads at most once; a failed load is
/// attempted again by the next request.
#[derive(Default)]
pub struct Subsystems {
    entries: Vec<(Arc<dyn Subsystem>, OnceCell<()>)>,
}

impl Subsystems {
    pub fn new(subsystems: Vec<Arc<dyn Subsystem>>) -> Self {
        Self {
            entries: subsystems
                .into_iter()
                .map(|s| (s, OnceCell::new()))
                .collect(),
        }
    }

    /// Load every subsystem that is not loaded yet. Returns each failure
    /// with the subsystem's name.
    pub async fn ensure_loaded(&self) -> Vec<(String, Error)> {
        let mut failures = Vec::new();
        for (subsystem, loaded) in &self.entries {
            let result = loaded
                .get_or_try_init(|| async {
                    debug!(subsystem = subsystem.name(), "Loading subsystem");
                    subsystem.load().await
                })
                .await;
            if let Err(e) = result {
                warn!(subsystem = subsystem.name(), error = %e, "Subsystem failed to load");
                failures.push((subsystem.name().to_string(), e));
            }
        }
        failures
    }

    /// Shut down the subsystems that were loaded.
    pub async fn shutdown(&self) {
        for (subsystem, loaded) in &self.entries {
            if loaded.initialized() {
                subsystem.shutdown().await;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
