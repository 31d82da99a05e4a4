//! Tracker registry: one precise-tracker slot per invocation context.
//!
//! The registry only manages slots and cancellation signals; the session
//! itself emits its notices and vacates its slot on the way out, so a slot
//! being present always means a non-terminal session.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::info;

/// Slot lifecycle. Terminal sessions are absent, not a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Running,
    Cancelling,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StartError {
    #[error("a precise tracker is already active in this context")]
    AlreadyActive,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CancelError {
    #[error("no precise tracker is active in this context")]
    NotActive,
}

struct Slot {
    state: SlotState,
    cancel: watch::Sender<bool>,
}

/// Context id -> active session slot.
pub struct TrackerRegistry {
    slots: Mutex<HashMap<u64, Slot>>,
}

impl TrackerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(HashMap::new()),
        })
    }

    /// Claim the slot for a context. Returns the cancellation receiver the
    /// session must watch.
    pub async fn claim(&self, context: u64) -> Result<watch::Receiver<bool>, StartError> {
        let mut slots = self.slots.lock().await;
        if slots.contains_key(&context) {
            return Err(StartError::AlreadyActive);
        }

        let (cancel, rx) = watch::channel(false);
        slots.insert(
            context,
            Slot {
                state: SlotState::Running,
                cancel,
            },
        );
        Ok(rx)
    }

    /// Request cooperative cancellation. The session performs its own
    /// cleanup and notices before the slot is vacated.
    pub async fn cancel(&self, context: u64) -> Result<(), CancelError> {
        let mut slots = self.slots.lock().await;
        match slots.get_mut(&context) {
            Some(slot) => {
                slot.state = SlotState::Cancelling;
                let _ = slot.cancel.send(true);
                info!("Cancellation requested for tracker context {}", context);
                Ok(())
            }
            None => Err(CancelError::NotActive),
        }
    }

    /// Called by the session itself as its final act.
    pub async fn vacate(&self, context: u64) {
        self.slots.lock().await.remove(&context);
    }

    pub async fn state(&self, context: u64) -> Option<SlotState> {
        self.slots.lock().await.get(&context).map(|slot| slot.state)
    }

    pub async fn active_count(&self) -> usize {
        self.slots.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_is_exclusive_per_context() {
        let registry = TrackerRegistry::new();
        let _rx = registry.claim(1).await.unwrap();
        assert_eq!(registry.claim(1).await.unwrap_err(), StartError::AlreadyActive);
        // A different context is unaffected.
        assert!(registry.claim(2).await.is_ok());
    }

    #[tokio::test]
    async fn cancel_signals_and_marks_cancelling() {
        let registry = TrackerRegistry::new();
        let rx = registry.claim(1).await.unwrap();

        registry.cancel(1).await.unwrap();
        assert!(*rx.borrow());
        assert_eq!(registry.state(1).await, Some(SlotState::Cancelling));
    }

    #[tokio::test]
    async fn cancel_without_session_is_rejected() {
        let registry = TrackerRegistry::new();
        assert_eq!(registry.cancel(1).await.unwrap_err(), CancelError::NotActive);
    }

    #[tokio::test]
    async fn vacate_frees_the_slot_for_reuse() {
        let registry = TrackerRegistry::new();
        let _rx = registry.claim(1).await.unwrap();
        registry.vacate(1).await;
        assert_eq!(registry.state(1).await, None);
        assert!(registry.claim(1).await.is_ok());
    }
}
