use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use controller::{EditScope, PersonController};
use shared::error::ApiError;
use storage::Storage;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub(crate) type SharedController = Arc<Mutex<PersonController<Storage>>>;

pub(crate) const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

struct Entry {
    controller: SharedController,
    touched: Instant,
}

/// Controllers of conversations whose edit scope is still open, keyed by the
/// id handed to the client. Conversations untouched for longer than the idle
/// timeout are dropped.
#[derive(Clone)]
pub(crate) struct Conversations {
    inner: Arc<Mutex<HashMap<Uuid, Entry>>>,
    idle_timeout: Duration,
}

impl Default for Conversations {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT)
    }
}

/// A controller checked out for one request.
pub(crate) struct Checkout {
    pub(crate) id: Option<Uuid>,
    pub(crate) controller: SharedController,
}

impl Conversations {
    pub(crate) fn new(idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::default(),
            idle_timeout,
        }
    }

    /// Returns the controller for `cid`, or a transient one when no id is
    /// given.
    pub(crate) async fn checkout(
        &self,
        storage: &Storage,
        cid: Option<&str>,
    ) -> Result<Checkout, ApiError> {
        let Some(raw) = cid.map(str::trim).filter(|raw| !raw.is_empty()) else {
            return Ok(Checkout {
                id: None,
                controller: Arc::new(Mutex::new(PersonController::new(storage.clone()))),
            });
        };

        let id = Uuid::parse_str(raw)
            .map_err(|_| ApiError::validation(format!("'{raw}' is not a conversation id")))?;

        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        self.evict_expired(&mut inner, now);
        let entry = inner
            .get_mut(&id)
            .ok_or_else(|| ApiError::not_found(format!("conversation {id} not found")))?;
        entry.touched = now;
        Ok(Checkout {
            id: Some(id),
            controller: entry.controller.clone(),
        })
    }

    /// Keeps the conversation while its scope is active and drops it once the
    /// scope has ended. Returns the id the client should send next.
    pub(crate) async fn settle(&self, checkout: &Checkout, scope: EditScope) -> Option<Uuid> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        match (scope, checkout.id) {
            (EditScope::Active, Some(id)) => {
                inner
                    .entry(id)
                    .and_modify(|entry| entry.touched = now)
                    .or_insert_with(|| Entry {
                        controller: checkout.controller.clone(),
                        touched: now,
                    });
                Some(id)
            }
            (EditScope::Active, None) => {
                let id = Uuid::new_v4();
                inner.insert(
                    id,
                    Entry {
                        controller: checkout.controller.clone(),
                        touched: now,
                    },
                );
                debug!(conversation_id = %id, "conversation started");
                Some(id)
            }
            (EditScope::Inactive, Some(id)) => {
                inner.remove(&id);
                debug!(conversation_id = %id, "conversation ended");
                None
            }
            (EditScope::Inactive, None) => None,
        }
    }

    /// Drops every conversation idle for longer than the timeout. Returns how
    /// many were dropped.
    pub(crate) async fn evict_idle(&self) -> usize {
        let mut inner = self.inner.lock().await;
        self.evict_expired(&mut inner, Instant::now())
    }

    pub(crate) fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    fn evict_expired(&self, inner: &mut HashMap<Uuid, Entry>, now: Instant) -> usize {
        let before = inner.len();
        inner.retain(|id, entry| {
            let live = now.saturating_duration_since(entry.touched) <= self.idle_timeout;
            if !live {
                debug!(conversation_id = %id, "idle conversation evicted");
            }
            live
        });
        before - inner.len()
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}
