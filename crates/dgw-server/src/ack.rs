//! Correlates a blocking wait with an acknowledgement arriving on an
//! independent connection.
//!
//! Each pending command id owns a single-shot slot. The slot is created by
//! the waiter and consumed (or dropped) exactly once: delivery consumes the
//! sender, timeout and cancel drop it, so a notify/timeout race can never
//! double-complete a slot.

use dgw_core::messages::AckPayload;
use dgw_core::{GatewayError, GatewayResult};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Default)]
pub struct AckWaiter {
    waiters: Mutex<HashMap<String, oneshot::Sender<AckPayload>>>,
}

impl AckWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the acknowledgement for `cmd_id` arrives or `timeout`
    /// elapses. The slot is reclaimed on every exit path.
    ///
    /// Each cmd_id has at most one waiter at a time; ids are generated
    /// unique by the caller.
    pub async fn wait(&self, cmd_id: &str, timeout: Duration) -> GatewayResult<AckPayload> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(cmd_id.to_string(), tx);

        let result = tokio::time::timeout(timeout, rx).await;

        // Reclaim the slot; a successful delivery already consumed it.
        self.lock().remove(cmd_id);

        match result {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(GatewayError::AckCancelled(cmd_id.to_string())),
            Err(_) => Err(GatewayError::AckTimeout(cmd_id.to_string())),
        }
    }

    /// Deliver an acknowledgement. A second notify for the same id, or one
    /// with no registered waiter, is a no-op.
    pub fn notify(&self, cmd_id: &str, ack: AckPayload) {
        let slot = self.lock().remove(cmd_id);
        match slot {
            Some(tx) => {
                // The waiter may have timed out between removal and send.
                if tx.send(ack).is_err() {
                    debug!(cmd_id = %cmd_id, "ack waiter already gone");
                }
            }
            None => debug!(cmd_id = %cmd_id, "ack for unknown command dropped"),
        }
    }

    /// Drop the slot, unblocking the waiter with no value.
    pub fn cancel(&self, cmd_id: &str) {
        self.lock().remove(cmd_id);
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<AckPayload>>> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ack(cmd_id: &str) -> AckPayload {
        AckPayload {
            cmd_id: cmd_id.to_string(),
            status: "ok".to_string(),
            detail: "done".to_string(),
        }
    }

    #[tokio::test]
    async fn notify_delivers_to_waiter() {
        let waiter = Arc::new(AckWaiter::new());

        let task = {
            let waiter = Arc::clone(&waiter);
            tokio::spawn(async move { waiter.wait("cmd-1", Duration::from_secs(5)).await })
        };

        // Let the waiter register its slot.
        tokio::task::yield_now().await;
        while waiter.pending() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        waiter.notify("cmd-1", ack("cmd-1"));
        let got = task.await.unwrap().unwrap();
        assert_eq!(got.cmd_id, "cmd-1");
        assert_eq!(got.status, "ok");
        assert_eq!(waiter.pending(), 0);
    }

    #[tokio::test]
    async fn wait_times_out_and_reclaims_slot() {
        let waiter = AckWaiter::new();
        let err = waiter.wait("cmd-2", Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, GatewayError::AckTimeout(_)));
        assert_eq!(waiter.pending(), 0);
    }

    #[tokio::test]
    async fn notify_without_waiter_is_a_no_op() {
        let waiter = AckWaiter::new();
        waiter.notify("nobody", ack("nobody"));
        assert_eq!(waiter.pending(), 0);
    }

    #[tokio::test]
    async fn second_notify_is_a_no_op() {
        let waiter = Arc::new(AckWaiter::new());

        let task = {
            let waiter = Arc::clone(&waiter);
            tokio::spawn(async move { waiter.wait("cmd-3", Duration::from_secs(5)).await })
        };
        while waiter.pending() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let mut first = ack("cmd-3");
        first.detail = "first".to_string();
        waiter.notify("cmd-3", first);
        waiter.notify("cmd-3", ack("cmd-3"));

        let got = task.await.unwrap().unwrap();
        assert_eq!(got.detail, "first");
    }

    #[tokio::test]
    async fn cancel_unblocks_waiter_with_no_value() {
        let waiter = Arc::new(AckWaiter::new());

        let task = {
            let waiter = Arc::clone(&waiter);
            tokio::spawn(async move { waiter.wait("cmd-4", Duration::from_secs(5)).await })
        };
        while waiter.pending() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        waiter.cancel("cmd-4");
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, GatewayError::AckCancelled(_)));
        assert_eq!(waiter.pending(), 0);
    }

    #[tokio::test]
    async fn independent_commands_do_not_interfere() {
        let waiter = Arc::new(AckWaiter::new());

        let mut tasks = Vec::new();
        for i in 0..8 {
            let waiter = Arc::clone(&waiter);
            tasks.push(tokio::spawn(async move {
                waiter.wait(&format!("cmd-{i}"), Duration::from_secs(5)).await
            }));
        }
        while waiter.pending() < 8 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        for i in (0..8).rev() {
            waiter.notify(&format!("cmd-{i}"), ack(&format!("cmd-{i}")));
        }
        for (i, task) in tasks.into_iter().enumerate() {
            let got = task.await.unwrap().unwrap();
            assert_eq!(got.cmd_id, format!("cmd-{i}"));
        }
    }
}
