//! Reality bridges: real-world follow-up tasks issued on quest completion, with a persisted
//! record and a one-shot reminder timer.
//!
//! Timers never touch a session. When a reminder is due the timer task only sends a
//! [`ReminderDue`] on the scheduler's channel; the owner of the user's session calls
//! [`BridgeScheduler::fire`] from its own serialized queue, which re-reads the bridge first.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::quest::BridgeSpec;
use crate::store::BridgeStore;

/// What to do when a user completes a quest while a previous bridge is still open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgePolicy {
    /// Supersede the open bridge and cancel its timer. The old record is kept.
    #[default]
    Overwrite,
    /// Refuse to create a new bridge.
    Reject,
    /// Keep every bridge and timer; completion resolves the oldest first.
    Queue,
}

impl BridgePolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "overwrite" => Some(BridgePolicy::Overwrite),
            "reject" => Some(BridgePolicy::Reject),
            "queue" => Some(BridgePolicy::Queue),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("User {user_id} already has a pending bridge {bridge_id}")]
    PendingBridge { user_id: String, bridge_id: String },
    #[error("No open bridge for user {0}")]
    NotFound(String),
    #[error("Bridge {0} has an out-of-range deadline or reminder")]
    InvalidSchedule(String),
    #[error("Bridge storage failed: {0:#}")]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveBridge {
    pub id: String,
    pub user_id: String,
    pub quest_id: String,
    pub bridge_id: String,
    pub title: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub deadline_at: DateTime<Utc>,
    pub reminder_at: DateTime<Utc>,
    pub completed: bool,
    pub reminded: bool,
    pub superseded: bool,
    pub verification_response: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ActiveBridge {
    pub fn is_open(&self) -> bool {
        !self.completed && !self.superseded
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderDue {
    pub user_id: String,
    pub bridge_key: String,
}

/// Delivery side of a reminder. Implemented by the transport.
#[async_trait]
pub trait ReminderSink: Send + Sync {
    async fn on_reminder_due(&self, user_id: &str, bridge: &ActiveBridge) -> Result<()>;
}

pub struct BridgeScheduler {
    store: Arc<dyn BridgeStore>,
    clock: Arc<dyn Clock>,
    policy: BridgePolicy,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
    due_tx: flume::Sender<ReminderDue>,
}

impl BridgeScheduler {
    pub fn new(
        store: Arc<dyn BridgeStore>,
        clock: Arc<dyn Clock>,
        policy: BridgePolicy,
    ) -> (Self, flume::Receiver<ReminderDue>) {
        let (due_tx, due_rx) = flume::unbounded();
        (
            Self {
                store,
                clock,
                policy,
                timers: Mutex::new(HashMap::new()),
                due_tx,
            },
            due_rx,
        )
    }

    pub fn policy(&self) -> BridgePolicy {
        self.policy
    }

    fn lock_timers(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        match self.timers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn pending_timers(&self) -> usize {
        self.lock_timers()
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    pub fn open_for_user(&self, user_id: &str) -> Result<Vec<ActiveBridge>> {
        self.store.open_bridges_for(user_id)
    }

    /// Persist a new bridge for a completed quest and arm its reminder.
    pub fn create(
        &self,
        user_id: &str,
        quest_id: &str,
        spec: &BridgeSpec,
    ) -> Result<ActiveBridge, BridgeError> {
        let now = self.clock.now();
        let at = |hours: i64| {
            ChronoDuration::try_hours(hours).and_then(|delta| now.checked_add_signed(delta))
        };
        let (Some(deadline_at), Some(reminder_at)) = (at(spec.deadline_hours), at(spec.reminder_hours))
        else {
            return Err(BridgeError::InvalidSchedule(spec.id.clone()));
        };

        let open = self.store.open_bridges_for(user_id)?;

        match self.policy {
            BridgePolicy::Reject => {
                if let Some(existing) = open.first() {
                    return Err(BridgeError::PendingBridge {
                        user_id: user_id.to_string(),
                        bridge_id: existing.bridge_id.clone(),
                    });
                }
            }
            BridgePolicy::Overwrite => {
                for mut previous in open {
                    previous.superseded = true;
                    self.store.save_bridge(&previous)?;
                    self.cancel(&previous.id);
                    tracing::info!(
                        "Bridge {} for user {} superseded by quest {}",
                        previous.bridge_id,
                        user_id,
                        quest_id
                    );
                }
            }
            BridgePolicy::Queue => {}
        }

        let bridge = ActiveBridge {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            quest_id: quest_id.to_string(),
            bridge_id: spec.id.clone(),
            title: spec.title.clone(),
            description: spec.description.clone(),
            created_at: now,
            deadline_at,
            reminder_at,
            completed: false,
            reminded: false,
            superseded: false,
            verification_response: None,
            completed_at: None,
        };
        self.store.save_bridge(&bridge)?;
        self.schedule(&bridge);

        tracing::info!(
            "Bridge {} created for user {} (reminder {}, deadline {})",
            bridge.bridge_id,
            user_id,
            bridge.reminder_at,
            bridge.deadline_at
        );
        Ok(bridge)
    }

    /// Arm a one-shot timer for the bridge's reminder instant. A past instant fires at once.
    fn schedule(&self, bridge: &ActiveBridge) {
        let delay = (bridge.reminder_at - self.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let due = ReminderDue {
            user_id: bridge.user_id.clone(),
            bridge_key: bridge.id.clone(),
        };
        let tx = self.due_tx.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send_async(due).await.is_err() {
                tracing::debug!("Reminder channel closed before delivery");
            }
        });

        if let Some(previous) = self.lock_timers().insert(bridge.id.clone(), handle) {
            previous.abort();
        }
        tracing::debug!("Reminder for bridge {} armed in {:?}", bridge.id, delay);
    }

    fn cancel(&self, bridge_key: &str) {
        if let Some(handle) = self.lock_timers().remove(bridge_key) {
            handle.abort();
            tracing::debug!("Reminder for bridge {} cancelled", bridge_key);
        }
    }

    /// Handle a due reminder. Returns the bridge when the sink was invoked.
    pub async fn fire(
        &self,
        due: &ReminderDue,
        sink: &dyn ReminderSink,
    ) -> Result<Option<ActiveBridge>> {
        self.lock_timers().remove(&due.bridge_key);

        let Some(mut bridge) = self.store.get_bridge(&due.bridge_key)? else {
            tracing::warn!("Reminder for unknown bridge {}", due.bridge_key);
            return Ok(None);
        };
        if !bridge.is_open() || bridge.reminded {
            tracing::debug!(
                "Skipping reminder for bridge {} (completed={}, superseded={}, reminded={})",
                bridge.id,
                bridge.completed,
                bridge.superseded,
                bridge.reminded
            );
            return Ok(None);
        }

        bridge.reminded = true;
        self.store.save_bridge(&bridge)?;

        if let Err(e) = sink.on_reminder_due(&bridge.user_id, &bridge).await {
            tracing::error!(
                "Reminder delivery failed for user {} bridge {}: {:#}",
                bridge.user_id,
                bridge.bridge_id,
                e
            );
        }
        Ok(Some(bridge))
    }

    /// Mark the user's oldest open bridge completed and disarm its reminder.
    pub fn complete(
        &self,
        user_id: &str,
        verification_response: &str,
    ) -> Result<ActiveBridge, BridgeError> {
        let mut bridge = self
            .store
            .open_bridges_for(user_id)?
            .into_iter()
            .next()
            .ok_or_else(|| BridgeError::NotFound(user_id.to_string()))?;

        bridge.completed = true;
        bridge.verification_response = Some(verification_response.to_string());
        bridge.completed_at = Some(self.clock.now());
        self.store.save_bridge(&bridge)?;
        self.cancel(&bridge.id);

        tracing::info!("Bridge {} completed by user {}", bridge.bridge_id, user_id);
        Ok(bridge)
    }

    /// Re-arm reminders for persisted bridges that are open, unexpired and not yet reminded.
    pub fn restore_on_startup(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut armed = 0;
        for bridge in self.store.open_bridges()? {
            if bridge.is_expired(now) {
                tracing::warn!(
                    "Bridge {} for user {} expired at {}",
                    bridge.bridge_id,
                    bridge.user_id,
                    bridge.deadline_at
                );
                continue;
            }
            if !bridge.reminded {
                self.schedule(&bridge);
                armed += 1;
            }
        }
        tracing::info!("Restored {} bridge reminders", armed);
        Ok(armed)
    }

    /// Open bridges whose deadline has passed. They are reported, never removed.
    pub fn check_deadlines(&self) -> Result<Vec<ActiveBridge>> {
        let now = self.clock.now();
        let expired: Vec<ActiveBridge> = self
            .store
            .open_bridges()?
            .into_iter()
            .filter(|bridge| bridge.is_expired(now))
            .collect();
        for bridge in &expired {
            tracing::warn!(
                "Bridge {} for user {} is past its deadline",
                bridge.bridge_id,
                bridge.user_id
            );
        }
        Ok(expired)
    }

    pub fn shutdown(&self) {
        for (_, handle) in self.lock_timers().drain() {
            handle.abort();
        }
    }
}
