use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use conductor_core::events::{EventPayload, IdentityKey, RunEvent};
use conductor_core::ids::RunId;
use conductor_telemetry::MetricsRecorder;

/// Result of a successful `publish`.
#[derive(Clone, Debug, PartialEq)]
pub enum Published {
    /// The event was stamped and handed to every current subscriber.
    Delivered(RunEvent),
    /// An event with the same identity key was already published. Nobody was notified.
    Duplicate(IdentityKey),
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("event stream closed")]
    Closed,
}

struct Inner {
    last_seq: u64,
    seen: HashSet<IdentityKey>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<RunEvent>>,
    next_subscriber: u64,
    closed: bool,
}

/// Per-run sequencing, deduplication and fan-out.
///
/// Sequence assignment, the dedup check-and-insert and the sends to every
/// subscriber all happen under one lock, so each subscriber receives events in
/// sequence order. Subscriber queues are unbounded: a slow observer never
/// blocks the run and never misses an event.
pub struct EventStream {
    run_id: RunId,
    inner: Arc<Mutex<Inner>>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl EventStream {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            inner: Arc::new(Mutex::new(Inner {
                last_seq: 0,
                seen: HashSet::new(),
                subscribers: HashMap::new(),
                next_subscriber: 0,
                closed: false,
            })),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn publish(&self, payload: EventPayload) -> Result<Published, StreamError> {
        let key = payload.identity();
        let published = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(StreamError::Closed);
            }
            if !inner.seen.insert(key) {
                None
            } else {
                inner.last_seq += 1;
                let event = RunEvent::new(self.run_id.clone(), inner.last_seq, payload);
                inner
                    .subscribers
                    .retain(|_, tx| tx.send(event.clone()).is_ok());
                Some(event)
            }
        };

        match published {
            Some(event) => {
                trace!(run_id = %self.run_id, seq = event.seq, key = %key, "event published");
                if let Some(metrics) = &self.metrics {
                    metrics.counter_inc("events.published", &[("type", event.event_type())], 1);
                }
                Ok(Published::Delivered(event))
            }
            None => {
                debug!(run_id = %self.run_id, key = %key, "duplicate event suppressed");
                if let Some(metrics) = &self.metrics {
                    metrics.counter_inc("events.duplicate", &[], 1);
                }
                Ok(Published::Duplicate(key))
            }
        }
    }

    /// Attach an observer. It receives every event published from now on.
    /// Subscribing to a closed stream yields a subscription that ends immediately.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        if !inner.closed {
            inner.subscribers.insert(id, tx);
        }
        Subscription {
            id,
            rx,
            stream: Arc::downgrade(&self.inner),
        }
    }

    /// End every subscription once it has drained what is already queued.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if !inner.closed {
            inner.closed = true;
            inner.subscribers.clear();
            debug!(run_id = %self.run_id, last_seq = inner.last_seq, "event stream closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    pub fn last_seq(&self) -> u64 {
        self.inner.lock().last_seq
    }
}

/// Observer handle. Dropping it detaches from the stream; the run is unaffected.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<RunEvent>,
    stream: Weak<Mutex<Inner>>,
}

impl Subscription {
    /// Next event, or `None` once the stream is closed and drained.
    pub async fn recv(&mut self) -> Option<RunEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<RunEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = RunEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<RunEvent>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.stream.upgrade() {
            inner.lock().subscribers.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::plan::{AgentResult, Plan, Task};
    use futures::StreamExt;

    fn plan_ready(round: u32) -> EventPayload {
        EventPayload::PlanReady {
            plan: Plan {
                round,
                agents: 1,
                tasks: vec![Task {
                    agent: 1,
                    desc: "edit file A".into(),
                }],
            },
        }
    }

    fn agent_done(round: u32, agent: u32) -> EventPayload {
        EventPayload::AgentDone {
            result: AgentResult::completed(round, agent, format!("agent {agent} done"), vec![]),
        }
    }

    fn done() -> EventPayload {
        EventPayload::OrchestratorDone {
            reply: "finished".into(),
            tool_runs: vec![],
        }
    }

    #[test]
    fn sequence_starts_at_one_and_increments() {
        let stream = EventStream::new(RunId::new());
        let Published::Delivered(first) = stream.publish(plan_ready(1)).unwrap() else {
            panic!("expected delivery");
        };
        let Published::Delivered(second) = stream.publish(agent_done(1, 1)).unwrap() else {
            panic!("expected delivery");
        };
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert_eq!(second.key, "agent:1:1");
        assert_eq!(stream.last_seq(), 2);
    }

    #[tokio::test]
    async fn duplicate_identity_delivers_once() {
        let stream = EventStream::new(RunId::new());
        let mut sub = stream.subscribe();

        assert!(matches!(stream.publish(agent_done(1, 2)).unwrap(), Published::Delivered(_)));
        assert_eq!(
            stream.publish(agent_done(1, 2)).unwrap(),
            Published::Duplicate(IdentityKey::Agent { round: 1, agent: 2 })
        );
        stream.close();

        let events: Vec<RunEvent> = (&mut sub).collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(stream.last_seq(), 1);
    }

    #[test]
    fn only_one_terminal_event() {
        let stream = EventStream::new(RunId::new());
        stream.publish(done()).unwrap();
        let second = stream
            .publish(EventPayload::RunError {
                reason: "late".into(),
                kind: "internal".into(),
            })
            .unwrap();
        assert_eq!(second, Published::Duplicate(IdentityKey::Terminal));
    }

    #[tokio::test]
    async fn no_replay_for_late_subscribers() {
        let stream = EventStream::new(RunId::new());
        stream.publish(plan_ready(1)).unwrap();

        let mut late = stream.subscribe();
        stream.publish(agent_done(1, 1)).unwrap();
        stream.close();

        let first = late.recv().await.unwrap();
        assert_eq!(first.seq, 2);
        assert!(late.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let stream = EventStream::new(RunId::new());
        let mut sub = stream.subscribe();
        stream.publish(plan_ready(1)).unwrap();
        stream.publish(done()).unwrap();
        stream.close();

        assert_eq!(sub.recv().await.unwrap().seq, 1);
        assert_eq!(sub.recv().await.unwrap().seq, 2);
        assert!(sub.recv().await.is_none());

        assert_eq!(stream.publish(plan_ready(2)), Err(StreamError::Closed));
        let mut after = stream.subscribe();
        assert!(after.recv().await.is_none());
    }

    #[test]
    fn dropping_subscription_detaches() {
        let stream = EventStream::new(RunId::new());
        let a = stream.subscribe();
        let b = stream.subscribe();
        assert_eq!(stream.subscriber_count(), 2);
        drop(a);
        assert_eq!(stream.subscriber_count(), 1);
        stream.publish(plan_ready(1)).unwrap();
        drop(b);
        assert_eq!(stream.subscriber_count(), 0);
        assert!(stream.publish(plan_ready(2)).is_ok());
    }

    #[test]
    fn subscription_outliving_stream_is_harmless() {
        let stream = EventStream::new(RunId::new());
        let sub = stream.subscribe();
        drop(stream);
        drop(sub);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_publishers_give_gapless_order_to_every_subscriber() {
        let stream = Arc::new(EventStream::new(RunId::new()));
        let subs: Vec<Subscription> = (0..3).map(|_| stream.subscribe()).collect();

        let mut handles = Vec::new();
        for round in 1..=8u32 {
            let stream = Arc::clone(&stream);
            handles.push(tokio::spawn(async move {
                for agent in 1..=25u32 {
                    stream.publish(agent_done(round, agent)).unwrap();
                    // Every key is published twice; only the first counts.
                    stream.publish(agent_done(round, agent)).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        stream.close();

        for sub in subs {
            let seqs: Vec<u64> = sub.map(|e| e.seq).collect().await;
            assert_eq!(seqs, (1..=200).collect::<Vec<u64>>());
        }
    }

    #[tokio::test]
    async fn metrics_count_published_and_duplicates() {
        let metrics = Arc::new(MetricsRecorder::in_memory());
        let stream = EventStream::new(RunId::new()).with_metrics(Arc::clone(&metrics));
        stream.publish(plan_ready(1)).unwrap();
        stream.publish(plan_ready(1)).unwrap();
        assert_eq!(metrics.counter_get("events.published", &[("type", "plan_ready")]), 1);
        assert_eq!(metrics.counter_get("events.duplicate", &[]), 1);
    }
}
