//! Active execution registry
//!
//! Created once per process and shared by reference. It gates how many
//! local-mode executions run at once, holds the cancellation token of every
//! active execution and routes inbound batch callbacks to the execution
//! that is collecting them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dispatcher::DispatchMessage;
use crate::models::ExecutionMode;

/// What happens when the local execution limit is reached
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionPolicy {
    /// Wait for a slot
    #[default]
    Queue,
    /// Refuse immediately
    Reject,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Concurrency limit reached: {limit} local executions already running")]
    LimitReached { limit: usize },

    #[error("Execution {0} is already active")]
    AlreadyActive(String),

    #[error("Execution {0} was stopped while waiting for a slot")]
    Cancelled(String),

    #[error("Execution registry is closed")]
    Closed,
}

struct ActiveEntry {
    cancel: CancellationToken,
    inbox: Option<mpsc::UnboundedSender<DispatchMessage>>,
}

/// Registry of running executions
pub struct ExecutionRegistry {
    limit: usize,
    policy: AdmissionPolicy,
    slots: Arc<Semaphore>,
    active: Mutex<HashMap<String, ActiveEntry>>,
}

impl ExecutionRegistry {
    pub fn new(limit: usize, policy: AdmissionPolicy) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            policy,
            slots: Arc::new(Semaphore::new(limit)),
            active: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, ActiveEntry>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an execution. Local executions take an admission slot,
    /// waiting or failing according to the policy.
    pub async fn register(
        self: &Arc<Self>,
        execution_id: &str,
        mode: ExecutionMode,
    ) -> Result<ExecutionTicket, AdmissionError> {
        let cancel = CancellationToken::new();
        {
            let mut active = self.entries();
            if active.contains_key(execution_id) {
                return Err(AdmissionError::AlreadyActive(execution_id.to_string()));
            }
            active.insert(
                execution_id.to_string(),
                ActiveEntry {
                    cancel: cancel.clone(),
                    inbox: None,
                },
            );
        }

        // the ticket removes the entry again if admission fails below
        let mut ticket = ExecutionTicket {
            execution_id: execution_id.to_string(),
            cancel: cancel.clone(),
            _permit: None,
            registry: Arc::clone(self),
        };

        if mode == ExecutionMode::Local {
            let permit = match self.policy {
                AdmissionPolicy::Reject => match Arc::clone(&self.slots).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(TryAcquireError::NoPermits) => {
                        warn!("Rejected {}: {} local executions running", execution_id, self.limit);
                        return Err(AdmissionError::LimitReached { limit: self.limit });
                    }
                    Err(TryAcquireError::Closed) => return Err(AdmissionError::Closed),
                },
                AdmissionPolicy::Queue => {
                    if self.slots.available_permits() == 0 {
                        info!("Execution {} queued for a local slot", execution_id);
                    }
                    tokio::select! {
                        permit = Arc::clone(&self.slots).acquire_owned() => {
                            permit.map_err(|_| AdmissionError::Closed)?
                        }
                        _ = cancel.cancelled() => {
                            return Err(AdmissionError::Cancelled(execution_id.to_string()));
                        }
                    }
                }
            };
            ticket._permit = Some(permit);
        }

        debug!("Registered execution {} ({})", execution_id, mode);
        Ok(ticket)
    }

    /// Route batch callbacks for `execution_id` into `inbox`
    pub fn attach_inbox(&self, execution_id: &str, inbox: mpsc::UnboundedSender<DispatchMessage>) {
        if let Some(entry) = self.entries().get_mut(execution_id) {
            entry.inbox = Some(inbox);
        }
    }

    /// Deliver an inbound message. Returns false if nobody is collecting.
    pub fn deliver(&self, execution_id: &str, message: DispatchMessage) -> bool {
        let inbox = self
            .entries()
            .get(execution_id)
            .and_then(|e| e.inbox.clone());
        match inbox {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Request cancellation. Returns false if the execution is not active.
    pub fn stop(&self, execution_id: &str) -> bool {
        match self.entries().get(execution_id) {
            Some(entry) => {
                entry.cancel.cancel();
                info!("Stop requested for execution {}", execution_id);
                true
            }
            None => false,
        }
    }

    /// Cancel every active execution
    #[cfg(test)]
    pub fn stop_all(&self) -> usize {
        let active = self.entries();
        for entry in active.values() {
            entry.cancel.cancel();
        }
        active.len()
    }

    pub fn is_active(&self, execution_id: &str) -> bool {
        self.entries().contains_key(execution_id)
    }

    #[cfg(test)]
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    fn release(&self, execution_id: &str) {
        self.entries().remove(execution_id);
        debug!("Released execution {}", execution_id);
    }
}

impl Default for ExecutionRegistry {
    fn default() -> Self {
        Self::new(3, AdmissionPolicy::Queue)
    }
}

/// Proof of registration. Dropping it releases the slot and the entry.
pub struct ExecutionTicket {
    execution_id: String,
    cancel: CancellationToken,
    _permit: Option<OwnedSemaphorePermit>,
    registry: Arc<ExecutionRegistry>,
}

impl ExecutionTicket {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

}

impl Drop for ExecutionTicket {
    fn drop(&mut self) {
        self.registry.release(&self.execution_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_reject_policy_refuses_beyond_limit() {
        let registry = Arc::new(ExecutionRegistry::new(2, AdmissionPolicy::Reject));
        let _a = registry.register("a", ExecutionMode::Local).await.unwrap();
        let _b = registry.register("b", ExecutionMode::Local).await.unwrap();

        let err = registry.register("c", ExecutionMode::Local).await.err().unwrap();
        assert_eq!(err, AdmissionError::LimitReached { limit: 2 });
        // the refused execution is not left behind
        assert!(!registry.is_active("c"));
    }

    #[tokio::test]
    async fn test_parallel_executions_bypass_local_gate() {
        let registry = Arc::new(ExecutionRegistry::new(1, AdmissionPolicy::Reject));
        let _local = registry.register("local", ExecutionMode::Local).await.unwrap();
        let parallel = registry.register("par", ExecutionMode::ParallelWorkflow).await;
        assert!(parallel.is_ok());
    }

    #[tokio::test]
    async fn test_queue_policy_waits_for_slot() {
        let registry = Arc::new(ExecutionRegistry::new(1, AdmissionPolicy::Queue));
        let first = registry.register("first", ExecutionMode::Local).await.unwrap();

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.register("second", ExecutionMode::Local).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert!(registry.is_active("second"));

        drop(first);
        let second = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(second.is_ok());
        assert_eq!(registry.available_slots(), 0);
    }

    #[tokio::test]
    async fn test_stop_while_queued() {
        let registry = Arc::new(ExecutionRegistry::new(1, AdmissionPolicy::Queue));
        let _first = registry.register("first", ExecutionMode::Local).await.unwrap();

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.register("queued", ExecutionMode::Local).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.stop("queued"));

        let result = waiter.await.unwrap();
        assert_eq!(result.err(), Some(AdmissionError::Cancelled("queued".to_string())));
        assert!(!registry.is_active("queued"));
    }

    #[tokio::test]
    async fn test_stop_and_release() {
        let registry = Arc::new(ExecutionRegistry::default());
        let ticket = registry.register("exec", ExecutionMode::Local).await.unwrap();
        assert_eq!(registry.available_slots(), 2);

        assert!(registry.stop("exec"));
        assert!(ticket.cancel_token().is_cancelled());
        assert!(!registry.stop("unknown"));

        drop(ticket);
        assert!(!registry.is_active("exec"));
        assert_eq!(registry.available_slots(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let registry = Arc::new(ExecutionRegistry::default());
        let _ticket = registry.register("dup", ExecutionMode::Local).await.unwrap();
        let err = registry.register("dup", ExecutionMode::Local).await.err().unwrap();
        assert_eq!(err, AdmissionError::AlreadyActive("dup".to_string()));
        assert!(registry.is_active("dup"));
    }

    #[tokio::test]
    async fn test_deliver_requires_inbox() {
        let registry = Arc::new(ExecutionRegistry::default());
        let _ticket = registry
            .register("exec", ExecutionMode::ParallelWorkflow)
            .await
            .unwrap();
        let message = || DispatchMessage::Finalize(None);
        assert!(!registry.deliver("exec", message()));

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.attach_inbox("exec", tx);
        assert!(registry.deliver("exec", message()));
        assert!(matches!(rx.recv().await, Some(DispatchMessage::Finalize(None))));
    }
}
