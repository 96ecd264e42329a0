//! Recurring schedules: a prompt spawned as a background task on a fixed
//! interval.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tidewire_config::ScheduleConfig;
use tidewire_core::CancellationToken;
use tidewire_core::error::TaskError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::manager::TaskManager;

/// A schedule as listed to callers.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleInfo {
    pub name: String,
    pub interval_secs: u64,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
}

pub(crate) struct ScheduleEntry {
    info: ScheduleInfo,
    cancel: CancellationToken,
}

impl TaskManager {
    /// Start a schedule. The first run happens one interval from now.
    /// Replaces a schedule with the same name.
    pub fn add_schedule(
        self: &Arc<Self>,
        name: impl Into<String>,
        interval: Duration,
        prompt: impl Into<String>,
    ) -> Result<(), TaskError> {
        let name = name.into();
        if interval.is_zero() {
            return Err(TaskError::InvalidSchedule {
                name,
                reason: "interval must be greater than zero".into(),
            });
        }
        let info = ScheduleInfo {
            name: name.clone(),
            interval_secs: interval.as_secs(),
            prompt: prompt.into(),
            created_at: Utc::now(),
        };
        let cancel = CancellationToken::new();

        let previous = self
            .schedules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                name.clone(),
                ScheduleEntry {
                    info: info.clone(),
                    cancel: cancel.clone(),
                },
            );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                match manager.spawn_prompt(format!("schedule: {}", info.name), info.prompt.clone()) {
                    Ok(handle) => {
                        debug!(schedule = %info.name, task_id = %handle.id, "Schedule fired");
                    }
                    Err(e) => warn!(schedule = %info.name, error = %e, "Schedule could not spawn its task"),
                }
            }
            debug!(schedule = %info.name, "Schedule stopped");
        });

        info!(schedule = %name, interval_secs = interval.as_secs(), "Schedule added");
        Ok(())
    }

    /// Schedules, sorted by name.
    pub fn list_schedules(&self) -> Vec<ScheduleInfo> {
        let mut schedules: Vec<ScheduleInfo> = self
            .schedules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        schedules.sort_by(|a, b| a.name.cmp(&b.name));
        schedules
    }

    /// Stop a schedule. Tasks it already spawned keep running.
    pub fn cancel_schedule(&self, name: &str) -> bool {
        let removed = self
            .schedules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                info!(schedule = %name, "Schedule cancelled");
                true
            }
            None => false,
        }
    }

    pub(crate) fn cancel_all_schedules(&self) {
        let drained: Vec<ScheduleEntry> = self
            .schedules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in drained {
            entry.cancel.cancel();
        }
    }

    /// Start every configured schedule. Returns one message per schedule
    /// that could not be started.
    pub fn load_schedules(self: &Arc<Self>, schedules: &[ScheduleConfig]) -> Vec<String> {
        let mut errors = Vec::new();
        for schedule in schedules {
            if let Err(e) = self.add_schedule(
                &schedule.name,
                Duration::from_secs(schedule.interval_secs),
                &schedule.prompt,
            ) {
                errors.push(format!("Schedule '{}': {e}", schedule.name));
            }
        }
        errors
    }
}
