//! Named concurrency groups.
//!
//! A group admits one run at a time. Later requests queue in arrival order
//! and are granted as soon as the holder releases. Permits release on drop, so
//! a stage that fails or panics still hands the group on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info, warn};
use trunkline_core::RunId;
use trunkline_core::{Error, Result};

/// How a permit was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The group was free.
    Acquired,
    /// The request waited behind another holder.
    Queued,
}

struct Holder {
    run_id: RunId,
    _permit: OwnedSemaphorePermit,
}

struct Group {
    name: String,
    semaphore: Arc<Semaphore>,
    holder: Mutex<Option<Holder>>,
    waiting: AtomicUsize,
}

impl Group {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            semaphore: Arc::new(Semaphore::new(1)),
            holder: Mutex::new(None),
            waiting: AtomicUsize::new(0),
        }
    }

    /// Count a waiter until the returned guard drops, including when the
    /// waiting future is dropped mid-wait.
    fn enqueue(&self) -> (Waiting<'_>, usize) {
        let position = self.waiting.fetch_add(1, Ordering::SeqCst) + 1;
        (Waiting(self), position)
    }

    fn holder(&self) -> MutexGuard<'_, Option<Holder>> {
        self.holder.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, run_id: RunId) -> Result<()> {
        let mut holder = self.holder();
        match holder.as_ref() {
            Some(current) if current.run_id == run_id => {
                // Dropping the semaphore permit wakes the next waiter.
                *holder = None;
                info!(group = %self.name, run_id = %run_id, "Concurrency group released");
                Ok(())
            }
            _ => Err(Error::GateNotHeld {
                group: self.name.clone(),
                run_id: run_id.to_string(),
            }),
        }
    }
}

struct Waiting<'a>(&'a Group);

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Registry of named concurrency groups shared by overlapping runs.
pub struct ConcurrencyGate {
    groups: Mutex<HashMap<String, Arc<Group>>>,
    acquire_timeout: Option<Duration>,
}

impl ConcurrencyGate {
    /// A gate whose waiters queue without bound.
    pub fn new() -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            acquire_timeout: None,
        }
    }

    /// A gate whose waiters give up with `Error::GateTimeout` after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            acquire_timeout: Some(timeout),
            ..Self::new()
        }
    }

    fn group(&self, name: &str) -> Arc<Group> {
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        groups
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Group::new(name)))
            .clone()
    }

    /// Acquire `group_name` for `run_id`, waiting in FIFO order behind the
    /// current holder and any earlier waiters.
    pub async fn acquire(&self, group_name: &str, run_id: RunId) -> Result<GatePermit> {
        let group = self.group(group_name);

        let (permit, admission) = match group.semaphore.clone().try_acquire_owned() {
            Ok(permit) => (permit, Admission::Acquired),
            Err(TryAcquireError::NoPermits) => {
                let holder = group.holder().as_ref().map(|h| h.run_id.to_string());
                let (waiting, position) = group.enqueue();
                info!(
                    group = group_name,
                    run_id = %run_id,
                    holder = holder.as_deref().unwrap_or("-"),
                    position,
                    "Concurrency group busy, queued"
                );

                let started = Instant::now();
                let waited = match self.acquire_timeout {
                    Some(limit) => {
                        tokio::time::timeout(limit, group.semaphore.clone().acquire_owned())
                            .await
                            .ok()
                    }
                    None => Some(group.semaphore.clone().acquire_owned().await),
                };
                drop(waiting);

                match waited {
                    Some(Ok(permit)) => (permit, Admission::Queued),
                    Some(Err(_)) => {
                        return Err(Error::Internal(format!(
                            "concurrency group {} closed",
                            group_name
                        )));
                    }
                    None => {
                        let waited_ms = started.elapsed().as_millis() as u64;
                        warn!(group = group_name, run_id = %run_id, waited_ms, "Gave up waiting for concurrency group");
                        return Err(Error::GateTimeout {
                            group: group_name.to_string(),
                            waited_ms,
                        });
                    }
                }
            }
            Err(TryAcquireError::Closed) => {
                return Err(Error::Internal(format!(
                    "concurrency group {} closed",
                    group_name
                )));
            }
        };

        *group.holder() = Some(Holder {
            run_id,
            _permit: permit,
        });
        info!(group = group_name, run_id = %run_id, ?admission, "Concurrency group acquired");

        Ok(GatePermit {
            group,
            run_id,
            admission,
            released: false,
        })
    }

    /// Release `group_name` if `run_id` holds it.
    pub fn release(&self, group_name: &str, run_id: RunId) -> Result<()> {
        self.group(group_name).release(run_id)
    }

    /// Current holder of a group.
    pub fn holder(&self, group_name: &str) -> Option<RunId> {
        self.group(group_name).holder().as_ref().map(|h| h.run_id)
    }

    /// Number of runs waiting for a group.
    pub fn queued(&self, group_name: &str) -> usize {
        self.group(group_name).waiting.load(Ordering::SeqCst)
    }
}

impl Default for ConcurrencyGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof of holding a concurrency group. Releases on drop.
pub struct GatePermit {
    group: Arc<Group>,
    run_id: RunId,
    admission: Admission,
    released: bool,
}

impl GatePermit {
    pub fn group(&self) -> &str {
        &self.group.name
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn admission(&self) -> Admission {
        self.admission
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.group.release(self.run_id)
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        if !self.released
            && let Err(e) = self.group.release(self.run_id)
        {
            debug!(error = %e, "Permit already released");
        }
    }
}

impl std::fmt::Debug for GatePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatePermit")
            .field("group", &self.group.name)
            .field("run_id", &self.run_id)
            .field("admission", &self.admission)
            .finish()
    }
}
