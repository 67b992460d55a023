//! The progress bus: a typed pub/sub hub keyed by session id.
//!
//! Late subscribers receive the retained (most recent) progress
//! event and everything after it with no gaps. Per subscriber
//! queues are bounded: log entries drop oldest-first, progress
//! events are never dropped — a subscriber that cannot keep up
//! with them is disconnected as a slow consumer.

use std::{
  collections::{HashMap, VecDeque},
  sync::{Arc, Mutex},
  time::{Duration, Instant},
};

use rsgo_client::entities::{
  health::HealthSummary,
  progress::{LogEntry, ProgressEvent},
};
use tokio::sync::{Notify, broadcast};

#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
  Progress(ProgressEvent),
  Log(LogEntry),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
  /// The subscriber's queue filled with undroppable progress
  /// events.
  SlowConsumer,
}

pub struct ProgressBus {
  sessions: Mutex<HashMap<String, Arc<Session>>>,
  health_topics:
    Mutex<HashMap<String, broadcast::Sender<HealthSummary>>>,
  queue_capacity: usize,
  retention: Duration,
}

impl ProgressBus {
  pub fn new(
    queue_capacity: usize,
    retention: Duration,
  ) -> ProgressBus {
    ProgressBus {
      sessions: Default::default(),
      health_topics: Default::default(),
      queue_capacity,
      retention,
    }
  }

  fn session(&self, session_id: &str) -> Arc<Session> {
    let mut sessions =
      self.sessions.lock().expect("sessions lock poisoned");
    sessions
      .entry(session_id.to_string())
      .or_insert_with(|| Arc::new(Session::default()))
      .clone()
  }

  /// Publish a progress event on its session. Percent is clamped
  /// to never decrease; events after the terminal one are dropped.
  pub fn publish(&self, mut event: ProgressEvent) {
    let session = self.session(&event.session_id);
    let mut inner =
      session.inner.lock().expect("session lock poisoned");
    if inner.terminated_at.is_some() {
      warn!(
        "dropping progress event published after terminal | session {}",
        event.session_id
      );
      return;
    }
    event.percent_complete =
      event.percent_complete.min(100).max(inner.max_percent);
    inner.max_percent = event.percent_complete;
    if event.is_complete {
      inner.terminated_at = Some(Instant::now());
    }
    inner.last_progress = Some(event.clone());
    inner.fan_out(BusEvent::Progress(event), self.queue_capacity);
  }

  /// Publish one init container log line on its session.
  pub fn publish_log(&self, entry: LogEntry) {
    let session = self.session(&entry.session_id);
    let mut inner =
      session.inner.lock().expect("session lock poisoned");
    if inner.terminated_at.is_some() {
      return;
    }
    inner.fan_out(BusEvent::Log(entry), self.queue_capacity);
  }

  /// Subscribe to a session. The most recent retained progress
  /// event (if any) is delivered first.
  pub fn subscribe(&self, session_id: &str) -> ProgressReceiver {
    let session = self.session(session_id);
    let mut inner =
      session.inner.lock().expect("session lock poisoned");
    let queue = Arc::new(SubscriberQueue::new(self.queue_capacity));
    if let Some(last) = inner.last_progress.clone() {
      queue.push(BusEvent::Progress(last), self.queue_capacity);
    }
    inner.subscribers.push(queue.clone());
    ProgressReceiver { queue }
  }

  /// The retained progress event for a session, if any.
  pub fn retained(&self, session_id: &str) -> Option<ProgressEvent> {
    let sessions =
      self.sessions.lock().expect("sessions lock poisoned");
    let session = sessions.get(session_id)?;
    let inner =
      session.inner.lock().expect("session lock poisoned");
    inner.last_progress.clone()
  }

  /// Publish a health summary on the `env:<id>` and
  /// `deployment:<id>` topics.
  pub fn publish_health(&self, summary: HealthSummary) {
    let topics = [
      format!("env:{}", summary.environment_id),
      format!("deployment:{}", summary.deployment_id),
    ];
    let mut health_topics = self
      .health_topics
      .lock()
      .expect("health topics lock poisoned");
    for topic in topics {
      if let Some(sender) = health_topics.get(&topic) {
        if sender.send(summary.clone()).is_err() {
          // No live receivers left.
          health_topics.remove(&topic);
        }
      }
    }
  }

  pub fn subscribe_environment_health(
    &self,
    environment_id: &str,
  ) -> broadcast::Receiver<HealthSummary> {
    self.subscribe_health_topic(&format!("env:{environment_id}"))
  }

  pub fn subscribe_deployment_health(
    &self,
    deployment_id: &str,
  ) -> broadcast::Receiver<HealthSummary> {
    self
      .subscribe_health_topic(&format!("deployment:{deployment_id}"))
  }

  fn subscribe_health_topic(
    &self,
    topic: &str,
  ) -> broadcast::Receiver<HealthSummary> {
    let mut health_topics = self
      .health_topics
      .lock()
      .expect("health topics lock poisoned");
    health_topics
      .entry(topic.to_string())
      .or_insert_with(|| broadcast::channel(64).0)
      .subscribe()
  }

  /// Drop sessions whose terminal event has outlived retention.
  pub fn sweep(&self) {
    let retention = self.retention;
    let mut sessions =
      self.sessions.lock().expect("sessions lock poisoned");
    sessions.retain(|_, session| {
      let inner =
        session.inner.lock().expect("session lock poisoned");
      match inner.terminated_at {
        Some(at) => at.elapsed() < retention,
        None => true,
      }
    });
  }

  /// Background task deleting expired sessions.
  pub fn spawn_retention_sweep(self: &Arc<Self>) {
    let bus = self.clone();
    tokio::spawn(async move {
      let mut interval =
        tokio::time::interval(Duration::from_secs(30));
      loop {
        interval.tick().await;
        bus.sweep();
      }
    });
  }
}

#[derive(Default)]
struct Session {
  inner: Mutex<SessionInner>,
}

#[derive(Default)]
struct SessionInner {
  last_progress: Option<ProgressEvent>,
  terminated_at: Option<Instant>,
  max_percent: u8,
  subscribers: Vec<Arc<SubscriberQueue>>,
}

impl SessionInner {
  fn fan_out(&mut self, event: BusEvent, capacity: usize) {
    self
      .subscribers
      .retain(|queue| queue.push(event.clone(), capacity));
  }
}

struct SubscriberQueue {
  state: Mutex<QueueState>,
  notify: Notify,
}

#[derive(Default)]
struct QueueState {
  buf: VecDeque<BusEvent>,
  disconnected: Option<Disconnect>,
}

impl SubscriberQueue {
  fn new(capacity: usize) -> SubscriberQueue {
    SubscriberQueue {
      state: Mutex::new(QueueState {
        buf: VecDeque::with_capacity(capacity),
        disconnected: None,
      }),
      notify: Notify::new(),
    }
  }

  /// Returns false when the subscriber got disconnected and
  /// should be dropped from the session.
  fn push(&self, event: BusEvent, capacity: usize) -> bool {
    let mut state =
      self.state.lock().expect("subscriber queue poisoned");
    if state.disconnected.is_some() {
      return false;
    }
    if state.buf.len() >= capacity {
      // Make room by sacrificing the oldest log line.
      let oldest_log = state
        .buf
        .iter()
        .position(|e| matches!(e, BusEvent::Log(_)));
      match (oldest_log, &event) {
        (Some(at), _) => {
          state.buf.remove(at);
        }
        (None, BusEvent::Log(_)) => {
          // Queue is all progress events; the incoming log is
          // the droppable one.
          return true;
        }
        (None, BusEvent::Progress(_)) => {
          state.disconnected = Some(Disconnect::SlowConsumer);
          self.notify.notify_one();
          return false;
        }
      }
    }
    state.buf.push_back(event);
    drop(state);
    self.notify.notify_one();
    true
  }
}

/// Receiving side of one session subscription.
pub struct ProgressReceiver {
  queue: Arc<SubscriberQueue>,
}

impl ProgressReceiver {
  /// Next event in publish order. `None` once the subscriber has
  /// been disconnected ([Self::disconnect_reason]).
  pub async fn recv(&mut self) -> Option<BusEvent> {
    loop {
      {
        let mut state = self
          .queue
          .state
          .lock()
          .expect("subscriber queue poisoned");
        if let Some(event) = state.buf.pop_front() {
          return Some(event);
        }
        if state.disconnected.is_some() {
          return None;
        }
      }
      self.queue.notify.notified().await;
    }
  }

  /// Try to take the next event without waiting.
  pub fn try_recv(&mut self) -> Option<BusEvent> {
    self
      .queue
      .state
      .lock()
      .expect("subscriber queue poisoned")
      .buf
      .pop_front()
  }

  pub fn disconnect_reason(&self) -> Option<Disconnect> {
    self
      .queue
      .state
      .lock()
      .expect("subscriber queue poisoned")
      .disconnected
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn progress(
    session: &str,
    percent: u8,
    complete: bool,
  ) -> ProgressEvent {
    ProgressEvent {
      session_id: session.to_string(),
      percent_complete: percent,
      is_complete: complete,
      ..Default::default()
    }
  }

  fn log(session: &str, line: &str) -> LogEntry {
    LogEntry {
      session_id: session.to_string(),
      log_line: line.to_string(),
      ..Default::default()
    }
  }

  fn bus() -> ProgressBus {
    ProgressBus::new(8, Duration::from_secs(300))
  }

  #[tokio::test]
  async fn late_subscriber_gets_retained_event_then_stream() {
    let bus = bus();
    bus.publish(progress("s1", 10, false));
    bus.publish(progress("s1", 40, false));
    bus.publish(progress("s1", 70, false));

    let mut receiver = bus.subscribe("s1");
    bus.publish(progress("s1", 90, false));
    bus.publish(progress("s1", 100, true));

    let mut percents = Vec::new();
    while let Some(event) = receiver.try_recv() {
      if let BusEvent::Progress(p) = event {
        percents.push(p.percent_complete);
      }
    }
    assert_eq!(percents, vec![70, 90, 100]);
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
  }

  #[tokio::test]
  async fn percent_never_decreases() {
    let bus = bus();
    let mut receiver = bus.subscribe("s1");
    bus.publish(progress("s1", 50, false));
    bus.publish(progress("s1", 30, false));

    let BusEvent::Progress(first) = receiver.recv().await.unwrap()
    else {
      panic!("expected progress")
    };
    let BusEvent::Progress(second) = receiver.recv().await.unwrap()
    else {
      panic!("expected progress")
    };
    assert_eq!(first.percent_complete, 50);
    assert_eq!(second.percent_complete, 50);
  }

  #[tokio::test]
  async fn events_after_terminal_are_dropped() {
    let bus = bus();
    bus.publish(progress("s1", 100, true));
    bus.publish(progress("s1", 100, false));
    let mut receiver = bus.subscribe("s1");
    let BusEvent::Progress(event) = receiver.recv().await.unwrap()
    else {
      panic!("expected progress")
    };
    assert!(event.is_complete);
    assert!(receiver.try_recv().is_none());
  }

  #[tokio::test]
  async fn full_queue_drops_oldest_logs_only() {
    let bus = ProgressBus::new(3, Duration::from_secs(300));
    let mut receiver = bus.subscribe("s1");
    bus.publish_log(log("s1", "one"));
    bus.publish_log(log("s1", "two"));
    bus.publish(progress("s1", 10, false));
    // Queue now full; this log evicts "one".
    bus.publish_log(log("s1", "three"));

    let mut lines = Vec::new();
    let mut percents = Vec::new();
    while let Some(event) = receiver.try_recv() {
      match event {
        BusEvent::Log(l) => lines.push(l.log_line),
        BusEvent::Progress(p) => {
          percents.push(p.percent_complete)
        }
      }
    }
    assert_eq!(lines, vec!["two", "three"]);
    assert_eq!(percents, vec![10]);
    assert!(receiver.disconnect_reason().is_none());
  }

  #[tokio::test]
  async fn progress_overflow_disconnects_slow_consumer() {
    let bus = ProgressBus::new(2, Duration::from_secs(300));
    let mut receiver = bus.subscribe("s1");
    bus.publish(progress("s1", 10, false));
    bus.publish(progress("s1", 20, false));
    bus.publish(progress("s1", 30, false));

    // The queued events are still delivered, then the
    // disconnect surfaces.
    assert!(receiver.recv().await.is_some());
    assert!(receiver.recv().await.is_some());
    assert!(receiver.recv().await.is_none());
    assert_eq!(
      receiver.disconnect_reason(),
      Some(Disconnect::SlowConsumer)
    );

    // Fresh subscribers are unaffected and see the retained
    // (clamped) latest event.
    let mut fresh = bus.subscribe("s1");
    let BusEvent::Progress(event) = fresh.recv().await.unwrap()
    else {
      panic!("expected progress")
    };
    assert_eq!(event.percent_complete, 30);
  }

  #[tokio::test]
  async fn sweep_retains_recent_terminals() {
    let bus = ProgressBus::new(8, Duration::from_secs(300));
    bus.publish(progress("s1", 100, true));
    bus.sweep();
    assert!(bus.retained("s1").is_some());

    let expired = ProgressBus::new(8, Duration::from_millis(0));
    expired.publish(progress("s2", 100, true));
    expired.sweep();
    assert!(expired.retained("s2").is_none());
  }

  #[tokio::test]
  async fn health_topics_fan_out_by_environment() {
    let bus = bus();
    let mut env_rx = bus.subscribe_environment_health("env1");
    let mut dep_rx = bus.subscribe_deployment_health("dep1");
    bus.publish_health(HealthSummary {
      deployment_id: "dep1".into(),
      environment_id: "env1".into(),
      ..Default::default()
    });
    assert_eq!(
      env_rx.recv().await.unwrap().deployment_id,
      "dep1"
    );
    assert_eq!(
      dep_rx.recv().await.unwrap().environment_id,
      "env1"
    );
  }
}
