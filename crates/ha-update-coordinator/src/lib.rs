//! Data Update Coordinator
//!
//! Polls a data source on a fixed interval on behalf of any number of
//! entities. A [`DataUpdater`] does the fetching; the
//! [`DataUpdateCoordinator`] serializes calls, bounds each one with a
//! timeout, keeps the last good data across failures and publishes a
//! [`CoordinatorSnapshot`] to subscribers after every attempt.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

/// Default polling interval
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(30);

/// Default bound for a single update call
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A poll did not produce data
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct UpdateFailed(pub String);

impl UpdateFailed {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// The first refresh during entry setup failed; setup should be retried
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ConfigEntryNotReady(pub String);

/// Result of a successful poll
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome<T> {
    /// Replace the cached data
    Updated(T),
    /// Nothing new; keep the cached data
    Unchanged,
}

/// Fetches data for a coordinator
#[async_trait]
pub trait DataUpdater: Send + 'static {
    type Data: Clone + Send + Sync + 'static;

    async fn update(&mut self) -> Result<UpdateOutcome<Self::Data>, UpdateFailed>;
}

/// What subscribers see after each refresh attempt
#[derive(Debug, Clone)]
pub struct CoordinatorSnapshot<T> {
    /// Last good data, kept across failures
    pub data: Option<T>,
    pub last_update_success: bool,
    pub last_error: Option<String>,
    /// Time of the last successful refresh
    pub last_update: Option<DateTime<Utc>>,
}

impl<T> Default for CoordinatorSnapshot<T> {
    fn default() -> Self {
        Self {
            data: None,
            last_update_success: true,
            last_error: None,
            last_update: None,
        }
    }
}

pub struct DataUpdateCoordinator<U: DataUpdater> {
    name: String,
    update_interval: Duration,
    request_timeout: Duration,

    /// Held for the whole refresh, so at most one call is in flight
    updater: Mutex<U>,

    snapshot: watch::Sender<CoordinatorSnapshot<U::Data>>,

    task: Mutex<Option<JoinHandle<()>>>,
}

impl<U: DataUpdater> DataUpdateCoordinator<U> {
    pub fn new(
        name: impl Into<String>,
        updater: U,
        update_interval: Duration,
        request_timeout: Duration,
    ) -> Self {
        let (snapshot, _) = watch::channel(CoordinatorSnapshot::default());
        Self {
            name: name.into(),
            update_interval,
            request_timeout,
            updater: Mutex::new(updater),
            snapshot,
            task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn update_interval(&self) -> Duration {
        self.update_interval
    }

    pub fn data(&self) -> Option<U::Data> {
        self.snapshot.borrow().data.clone()
    }

    pub fn last_update_success(&self) -> bool {
        self.snapshot.borrow().last_update_success
    }

    pub fn snapshot(&self) -> CoordinatorSnapshot<U::Data> {
        self.snapshot.borrow().clone()
    }

    /// Receiver that is notified after every refresh attempt
    pub fn subscribe(&self) -> watch::Receiver<CoordinatorSnapshot<U::Data>> {
        self.snapshot.subscribe()
    }

    /// Poll once. Failures keep the cached data and are logged only when
    /// the coordinator goes from healthy to failing.
    pub async fn refresh(&self) -> Result<(), UpdateFailed> {
        let mut updater = self.updater.lock().await;

        let result = match tokio::time::timeout(self.request_timeout, updater.update()).await {
            Ok(result) => result,
            Err(_) => Err(UpdateFailed::new(format!(
                "Timeout fetching {} data after {:?}",
                self.name, self.request_timeout
            ))),
        };

        let was_success = self.snapshot.borrow().last_update_success;
        match result {
            Ok(outcome) => {
                if !was_success {
                    info!("Fetching {} data recovered", self.name);
                }
                let updated = matches!(outcome, UpdateOutcome::Updated(_));
                self.snapshot.send_modify(|snapshot| {
                    if let UpdateOutcome::Updated(data) = outcome {
                        snapshot.data = Some(data);
                    }
                    snapshot.last_update_success = true;
                    snapshot.last_error = None;
                    snapshot.last_update = Some(Utc::now());
                });
                debug!("Finished fetching {} data (updated: {})", self.name, updated);
                Ok(())
            }
            Err(err) => {
                if was_success {
                    error!("Error fetching {} data: {}", self.name, err);
                } else {
                    debug!("Fetching {} data still failing: {}", self.name, err);
                }
                self.snapshot.send_modify(|snapshot| {
                    snapshot.last_update_success = false;
                    snapshot.last_error = Some(err.to_string());
                });
                Err(err)
            }
        }
    }

    /// Initial refresh during entry setup
    pub async fn first_refresh(&self) -> Result<(), ConfigEntryNotReady> {
        self.refresh()
            .await
            .map_err(|err| ConfigEntryNotReady(err.to_string()))
    }

    /// Start polling every `update_interval`, first poll one interval from now
    pub async fn start(self: &Arc<Self>) {
        let coordinator = Arc::downgrade(self);
        let period = self.update_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                // Already logged and published by refresh()
                let _ = coordinator.refresh().await;
            }
        });

        if let Some(previous) = self.task.lock().await.replace(handle) {
            previous.abort();
        }
        debug!("Started polling {} every {:?}", self.name, period);
    }

    /// Stop polling; an in-flight call is cancelled
    pub async fn shutdown(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
            debug!("Stopped polling {}", self.name);
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}
