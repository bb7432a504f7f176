//! Control channel request tracking
//!
//! [`ControlChannel`] owns the three correlation tables of the control
//! protocol: the outbound queue, the pending handlers keyed by message id,
//! and one watchdog per in-flight message. A handler enters the table in
//! [`ControlChannel::submit`] and leaves it exactly once, through
//! [`resolve`](ControlChannel::resolve), [`next_expired`](ControlChannel::next_expired)
//! or one of the `fail_*` methods. Leaving the table always removes the
//! message's watchdog with it.

use std::collections::HashMap;
use std::future::poll_fn;
use std::task::Poll;
use std::time::Duration;

use t7_core::time::{current_time_millis, elapsed_millis};
use t7_core::SessionError;
use t7_protocol::{ControlMessage, ControlReply, ControlRequest, MessageId};
use tokio_util::time::{delay_queue, DelayQueue};

use crate::queue::OutboundQueue;

/// A request that could not be queued; the handler is handed back
#[derive(Debug)]
pub struct Rejected<H> {
    pub handler: H,
    pub error: SessionError,
}

struct Pending<H> {
    handler: H,
    kind: &'static str,
    watchdog: Option<delay_queue::Key>,
    sent_at: Option<u64>,
}

/// Request/acknowledgement engine of one session
pub struct ControlChannel<H> {
    next_id: u64,
    timeout: Duration,
    queue: OutboundQueue<(MessageId, String)>,
    pending: HashMap<MessageId, Pending<H>>,
    watchdogs: DelayQueue<MessageId>,
}

impl<H> ControlChannel<H> {
    /// `timeout` is the watchdog armed for every sent message
    pub fn new(timeout: Duration, capacity: usize) -> Self {
        Self {
            next_id: 0,
            timeout,
            queue: OutboundQueue::new(capacity),
            pending: HashMap::new(),
            watchdogs: DelayQueue::new(),
        }
    }

    /// Assign the next id to `request` and queue it for sending
    pub fn submit(
        &mut self,
        request: &ControlRequest,
        handler: H,
    ) -> Result<MessageId, Rejected<H>> {
        let id = MessageId::new(self.next_id);
        let payload = match ControlMessage::new(id, request, current_time_millis()).to_json() {
            Ok(payload) => payload,
            Err(e) => {
                return Err(Rejected {
                    handler,
                    error: e.into(),
                })
            }
        };
        if self.queue.push((id, payload)).is_err() {
            return Err(Rejected {
                handler,
                error: SessionError::QueueFull,
            });
        }
        self.next_id += 1;
        self.pending.insert(
            id,
            Pending {
                handler,
                kind: request.kind(),
                watchdog: None,
                sent_at: None,
            },
        );
        tracing::debug!("Queued {} as message {}", request.kind(), id);
        Ok(id)
    }

    /// Take every queued message, in submission order, arming its watchdog
    ///
    /// Call only when the control stream is open; the caller must write
    /// the returned payloads in the order given.
    pub fn take_outbound(&mut self) -> Vec<(MessageId, String)> {
        let outbound: Vec<_> = self.queue.drain().collect();
        for (id, _) in &outbound {
            if let Some(pending) = self.pending.get_mut(id) {
                let key = self.watchdogs.insert(*id, self.timeout);
                pending.watchdog = Some(key);
                pending.sent_at = Some(current_time_millis());
                tracing::trace!("Armed watchdog for {} ({})", id, pending.kind);
            }
        }
        outbound
    }

    /// Match an ack or nack to its pending handler
    ///
    /// Returns `None` for a reference that is not (or no longer) pending.
    pub fn resolve(&mut self, reply: &ControlReply) -> Option<H> {
        let pending = self.pending.remove(&reply.reference)?;
        if let Some(key) = pending.watchdog {
            self.watchdogs.remove(&key);
        }
        tracing::debug!(
            "Message {} ({}) answered after {}ms",
            reply.reference,
            pending.kind,
            pending.sent_at.map(elapsed_millis).unwrap_or(0)
        );
        Some(pending.handler)
    }

    /// Wait for the next watchdog to fire
    ///
    /// Pends forever while no watchdog is armed. Cancel safe.
    pub async fn next_expired(&mut self) -> (MessageId, H) {
        loop {
            let id = poll_fn(|cx| match self.watchdogs.poll_expired(cx) {
                Poll::Ready(Some(expired)) => Poll::Ready(expired.into_inner()),
                _ => Poll::Pending,
            })
            .await;
            if let Some(pending) = self.pending.remove(&id) {
                tracing::warn!("Watchdog fired for message {} ({})", id, pending.kind);
                return (id, pending.handler);
            }
        }
    }

    /// Drop every message already sent, leaving queued ones in place
    pub fn fail_in_flight(&mut self) -> Vec<H> {
        let sent: Vec<MessageId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.watchdog.is_some())
            .map(|(id, _)| *id)
            .collect();
        self.take_sorted(sent)
    }

    /// Drop every queued and in-flight message
    pub fn fail_all(&mut self) -> Vec<H> {
        self.queue.clear();
        let all: Vec<MessageId> = self.pending.keys().copied().collect();
        self.take_sorted(all)
    }

    fn take_sorted(&mut self, mut ids: Vec<MessageId>) -> Vec<H> {
        ids.sort();
        ids.into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .map(|pending| {
                if let Some(key) = pending.watchdog {
                    self.watchdogs.remove(&key);
                }
                pending.handler
            })
            .collect()
    }

    /// Whether `id` is still waiting in the queue, unsent
    pub fn is_queued(&self, id: MessageId) -> bool {
        self.pending
            .get(&id)
            .map(|p| p.watchdog.is_none())
            .unwrap_or(false)
    }

    /// Requests awaiting an answer, sent or not
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Requests waiting for the control stream to open
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Watchdogs currently armed
    pub fn armed_len(&self) -> usize {
        self.watchdogs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use t7_protocol::TerminalSize;

    fn reply(id: u64) -> ControlReply {
        ControlReply {
            reference: MessageId::new(id),
            body: Value::Null,
        }
    }

    fn add_pane(cmd: &str) -> ControlRequest {
        ControlRequest::AddPane {
            command: vec![cmd.to_string()],
            size: TerminalSize::default(),
            parent: None,
        }
    }

    #[tokio::test]
    async fn test_queued_messages_flush_in_order() {
        let mut control = ControlChannel::new(Duration::from_secs(5), 16);
        for i in 0..5 {
            control.submit(&add_pane(&format!("cmd{}", i)), i).unwrap();
        }
        assert_eq!(control.armed_len(), 0);

        let outbound = control.take_outbound();
        let ids: Vec<u64> = outbound.iter().map(|(id, _)| id.as_u64()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        for (i, (_, payload)) in outbound.iter().enumerate() {
            let value: Value = serde_json::from_str(payload).unwrap();
            assert_eq!(value["args"]["command"], json!([format!("cmd{}", i)]));
        }
        assert_eq!(control.armed_len(), 5);
        assert!(control.take_outbound().is_empty());
    }

    #[tokio::test]
    async fn test_ids_strictly_increase() {
        let mut control = ControlChannel::new(Duration::from_secs(5), 16);
        let a = control.submit(&ControlRequest::GetPayload, ()).unwrap();
        control.take_outbound();
        control.resolve(&reply(a.as_u64()));
        control.fail_all();
        let b = control.submit(&ControlRequest::GetPayload, ()).unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_resolve_cancels_watchdog_once() {
        let mut control = ControlChannel::new(Duration::from_secs(5), 16);
        let id = control.submit(&ControlRequest::Mark, "mark").unwrap();
        control.take_outbound();
        assert_eq!(control.armed_len(), 1);

        assert_eq!(control.resolve(&reply(id.as_u64())), Some("mark"));
        assert_eq!(control.armed_len(), 0);
        assert_eq!(control.resolve(&reply(id.as_u64())), None);
    }

    #[tokio::test]
    async fn test_acks_match_by_id_in_any_order() {
        let mut control = ControlChannel::new(Duration::from_secs(5), 16);
        for name in ["a", "b", "c"] {
            control.submit(&ControlRequest::GetPayload, name).unwrap();
        }
        control.take_outbound();

        assert_eq!(control.resolve(&reply(2)), Some("c"));
        assert_eq!(control.resolve(&reply(0)), Some("a"));
        assert_eq!(control.resolve(&reply(1)), Some("b"));
        assert_eq!(control.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_fires_after_timeout() {
        let mut control = ControlChannel::new(Duration::from_millis(500), 16);
        let id = control.submit(&ControlRequest::GetPayload, 7u8).unwrap();
        control.take_outbound();

        let start = tokio::time::Instant::now();
        let (expired, handler) = control.next_expired().await;
        assert_eq!(expired, id);
        assert_eq!(handler, 7);
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert_eq!(control.pending_len(), 0);
        assert_eq!(control.armed_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsent_messages_have_no_watchdog() {
        let mut control = ControlChannel::new(Duration::from_millis(100), 16);
        control.submit(&ControlRequest::GetPayload, ()).unwrap();

        let fired = tokio::time::timeout(Duration::from_secs(1), control.next_expired()).await;
        assert!(fired.is_err());
        assert_eq!(control.queued_len(), 1);
    }

    #[tokio::test]
    async fn test_queue_capacity() {
        let mut control = ControlChannel::new(Duration::from_secs(5), 2);
        control.submit(&ControlRequest::GetPayload, 1).unwrap();
        control.submit(&ControlRequest::GetPayload, 2).unwrap();
        let rejected = control.submit(&ControlRequest::GetPayload, 3).unwrap_err();
        assert_eq!(rejected.handler, 3);
        assert!(matches!(rejected.error, SessionError::QueueFull));
        assert_eq!(control.pending_len(), 2);
    }

    #[tokio::test]
    async fn test_fail_in_flight_keeps_queued() {
        let mut control = ControlChannel::new(Duration::from_secs(5), 16);
        let sent = control.submit(&ControlRequest::GetPayload, "sent").unwrap();
        control.take_outbound();
        let queued = control.submit(&ControlRequest::GetPayload, "queued").unwrap();
        assert!(!control.is_queued(sent));
        assert!(control.is_queued(queued));

        assert_eq!(control.fail_in_flight(), vec!["sent"]);
        assert_eq!(control.armed_len(), 0);
        assert_eq!(control.queued_len(), 1);
        assert_eq!(control.fail_all(), vec!["queued"]);
        assert_eq!(control.queued_len(), 0);
    }
}
