//! Confirmation and alert prompts shown to the user by a connected client.

use async_trait::async_trait;
use shared::{AlertData, ConfirmRequiredData, Event};
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{info, warn};

#[async_trait]
pub trait ConfirmGate: Send + Sync {
    async fn confirm(&self, message: &str) -> bool;
    async fn alert(&self, message: &str);
}

/// Accepts every prompt; alerts only reach the log.
pub struct AutoConfirm;

#[async_trait]
impl ConfirmGate for AutoConfirm {
    async fn confirm(&self, message: &str) -> bool {
        info!("Auto-confirming: {}", message);
        true
    }

    async fn alert(&self, message: &str) {
        warn!("{}", message);
    }
}

/// Asks connected clients through a `commit.confirm_required` event and
/// waits for one of them to send `commit.confirm`.
pub struct IpcConfirmGate {
    event_tx: broadcast::Sender<Event>,
    pending: Mutex<Option<oneshot::Sender<bool>>>,
}

impl IpcConfirmGate {
    pub fn new(event_tx: broadcast::Sender<Event>) -> Self {
        Self {
            event_tx,
            pending: Mutex::new(None),
        }
    }

    /// Deliver the user's answer. Returns false when no prompt was open.
    pub async fn answer(&self, accepted: bool) -> bool {
        match self.pending.lock().await.take() {
            Some(tx) => tx.send(accepted).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl ConfirmGate for IpcConfirmGate {
    async fn confirm(&self, message: &str) -> bool {
        let (tx, rx) = oneshot::channel();
        // A newer prompt replaces an unanswered one, which then reads as "no"
        *self.pending.lock().await = Some(tx);

        let event = Event {
            event: "commit.confirm_required".to_string(),
            data: serde_json::to_value(ConfirmRequiredData {
                message: message.to_string(),
            })
            .unwrap_or_default(),
        };
        if self.event_tx.send(event).is_err() {
            warn!("No client connected to confirm: {}", message);
            self.pending.lock().await.take();
            return false;
        }

        rx.await.unwrap_or(false)
    }

    async fn alert(&self, message: &str) {
        warn!("{}", message);
        let event = Event {
            event: "alert".to_string(),
            data: serde_json::to_value(AlertData {
                message: message.to_string(),
            })
            .unwrap_or_default(),
        };
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Answers prompts with a fixed value and records what it was shown.
    pub struct ScriptedGate {
        pub answer: bool,
        pub prompts: StdMutex<Vec<String>>,
        pub alerts: StdMutex<Vec<String>>,
    }

    impl ScriptedGate {
        pub fn answering(answer: bool) -> Self {
            Self {
                answer,
                prompts: StdMutex::new(Vec::new()),
                alerts: StdMutex::new(Vec::new()),
            }
        }

        pub fn prompt_count(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }

        pub fn alert_count(&self) -> usize {
            self.alerts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ConfirmGate for ScriptedGate {
        async fn confirm(&self, message: &str) -> bool {
            self.prompts.lock().unwrap().push(message.to_string());
            self.answer
        }

        async fn alert(&self, message: &str) {
            self.alerts.lock().unwrap().push(message.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_ipc_gate_waits_for_answer() {
        let (event_tx, mut event_rx) = broadcast::channel(16);
        let gate = Arc::new(IpcConfirmGate::new(event_tx));

        let asking = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.confirm("Move 2 groups?").await })
        };

        let event = event_rx.recv().await.unwrap();
        assert_eq!(event.event, "commit.confirm_required");
        assert_eq!(event.data["message"], "Move 2 groups?");

        assert!(gate.answer(true).await);
        assert!(asking.await.unwrap());
    }

    #[tokio::test]
    async fn test_ipc_gate_without_clients_declines() {
        let (event_tx, event_rx) = broadcast::channel(16);
        drop(event_rx);
        let gate = IpcConfirmGate::new(event_tx);
        assert!(!gate.confirm("anyone?").await);
        assert!(!gate.answer(true).await);
    }
}
