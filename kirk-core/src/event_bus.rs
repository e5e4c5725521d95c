//! Named multi-subscriber pub-sub bus decoupling the engine from reporters/UI.
//!
//! `fire` never awaits subscribers directly: it pushes onto an internal FIFO and a single
//! consumer task drains it, fanning each item out to its subscribers either concurrently or
//! in registration order depending on how the event name was first registered. A subscriber
//! that returns an error has that error reflected onto the built-in `internal_error` event
//! instead of aborting the consumer loop.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::data::{Suite, Test};
use crate::results::{SuiteResult, TestResult};

type BoxFuture<'a> = Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>>;
type Callback = Arc<dyn Fn(KirkEvent) -> BoxFuture<'static> + Send + Sync>;

/// The catalog of events fired by the engine. UI/monitor/exporter subscribers match on
/// `kind_name()` (implicitly, through registration) or on the variant itself inside their
/// callback.
#[derive(Clone, Debug)]
pub enum KirkEvent {
    SessionStarted { tmpdir: String },
    SessionRestore { path: String },
    SessionWarning { message: String },
    SessionCompleted { results: Vec<SuiteResult> },
    SessionStopped,
    SessionError { message: String },

    SutStart { name: String },
    SutStop { name: String },
    SutStdout { name: String, data: String },
    SutRestart { name: String },
    SutNotResponding,

    TestStarted { test: Test },
    TestStdout { test_name: String, data: String },
    TestCompleted { result: TestResult },

    SuiteStarted { suite: Suite },
    SuiteCompleted { result: SuiteResult, exec_time: f64 },
    SuiteTimeout { suite_name: String, timeout_secs: f64 },

    KernelPanic,
    KernelTainted { messages: Vec<String> },

    RunCmdStart { command: String },
    RunCmdStdout { data: String },
    RunCmdStop { command: String, stdout: String, return_code: i32 },

    InternalError { message: String, callback_name: String },
}

impl KirkEvent {
    /// Stable name used as the subscription-table key. Every variant must appear here; the
    /// compiler enforces that via the exhaustive match.
    pub fn kind_name(&self) -> &'static str {
        match self {
            KirkEvent::SessionStarted { .. } => "session_started",
            KirkEvent::SessionRestore { .. } => "session_restore",
            KirkEvent::SessionWarning { .. } => "session_warning",
            KirkEvent::SessionCompleted { .. } => "session_completed",
            KirkEvent::SessionStopped => "session_stopped",
            KirkEvent::SessionError { .. } => "session_error",
            KirkEvent::SutStart { .. } => "sut_start",
            KirkEvent::SutStop { .. } => "sut_stop",
            KirkEvent::SutStdout { .. } => "sut_stdout",
            KirkEvent::SutRestart { .. } => "sut_restart",
            KirkEvent::SutNotResponding => "sut_not_responding",
            KirkEvent::TestStarted { .. } => "test_started",
            KirkEvent::TestStdout { .. } => "test_stdout",
            KirkEvent::TestCompleted { .. } => "test_completed",
            KirkEvent::SuiteStarted { .. } => "suite_started",
            KirkEvent::SuiteCompleted { .. } => "suite_completed",
            KirkEvent::SuiteTimeout { .. } => "suite_timeout",
            KirkEvent::KernelPanic => "kernel_panic",
            KirkEvent::KernelTainted { .. } => "kernel_tainted",
            KirkEvent::RunCmdStart { .. } => "run_cmd_start",
            KirkEvent::RunCmdStdout { .. } => "run_cmd_stdout",
            KirkEvent::RunCmdStop { .. } => "run_cmd_stop",
            KirkEvent::InternalError { .. } => "internal_error",
        }
    }
}

/// Opaque handle returned by [`EventBus::register`], used to [`EventBus::unregister`] a
/// single subscriber later.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(usize);

struct Subscription {
    id: SubscriptionId,
    name: String,
    callback: Callback,
}

struct EventSubscribers {
    ordered: bool,
    subs: Vec<Subscription>,
}

enum Job {
    Fire(KirkEvent),
    Stop,
}

struct Inner {
    subscribers: StdMutex<HashMap<&'static str, EventSubscribers>>,
    tx: mpsc::UnboundedSender<Job>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Job>>,
    next_id: AtomicUsize,
}

/// A process-wide (or test-isolated) event bus.
///
/// Cloning an `EventBus` is cheap and shares the same queue and subscriber table: it is a
/// thin handle over an `Arc<Inner>`. Tests should construct their own bus with [`EventBus::new`]
/// rather than relying on a global so that subscribers don't leak across cases.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                subscribers: StdMutex::new(HashMap::new()),
                tx,
                rx: AsyncMutex::new(rx),
                next_id: AtomicUsize::new(0),
            }),
        }
    }

    /// Registers `callback` under `event`. `ordered` only takes effect the first time this
    /// event name is registered; subsequent registrations for the same name inherit whatever
    /// ordering mode was established first.
    pub fn register<F, Fut>(&self, event: &'static str, name: impl Into<String>, ordered: bool, callback: F) -> SubscriptionId
    where
        F: Fn(KirkEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let callback: Callback = Arc::new(move |ev| Box::pin(callback(ev)));

        let mut subs = self.inner.subscribers.lock().unwrap();
        let entry = subs.entry(event).or_insert_with(|| EventSubscribers {
            ordered,
            subs: Vec::new(),
        });
        entry.subs.push(Subscription {
            id,
            name: name.into(),
            callback,
        });

        id
    }

    /// Unregisters a single subscriber previously returned by [`EventBus::register`].
    pub fn unregister(&self, event: &str, id: SubscriptionId) {
        let mut subs = self.inner.subscribers.lock().unwrap();
        if let Some(entry) = subs.get_mut(event) {
            entry.subs.retain(|s| s.id != id);
        }
    }

    /// Clears every registration, including the built-in plumbing for `internal_error`.
    pub fn reset(&self) {
        self.inner.subscribers.lock().unwrap().clear();
    }

    /// Enqueues `event`; never awaits subscribers, so it never blocks on a slow one.
    pub fn fire(&self, event: KirkEvent) {
        let _ = self.inner.tx.send(Job::Fire(event));
    }

    /// Runs the consumer loop until [`EventBus::stop`] is called. Only one `start()` can be
    /// active at a time: concurrent callers block on the receiver mutex until the first
    /// returns.
    pub async fn start(&self) {
        let mut rx = self.inner.rx.lock().await;
        loop {
            match rx.recv().await {
                Some(Job::Fire(event)) => self.process(event).await,
                Some(Job::Stop) | None => break,
            }
        }
    }

    /// Signals the consumer loop to exit, waits for it to actually stop, then drains whatever
    /// is left in the queue (covers the case `start()` was never called).
    pub async fn stop(&self) {
        let _ = self.inner.tx.send(Job::Stop);

        let mut rx = self.inner.rx.lock().await;
        while let Ok(job) = rx.try_recv() {
            match job {
                Job::Stop => break,
                Job::Fire(event) => self.process(event).await,
            }
        }
    }

    async fn process(&self, event: KirkEvent) {
        let kind = event.kind_name();
        let is_internal_error = kind == "internal_error";

        let (ordered, callbacks): (bool, Vec<(String, Callback)>) = {
            let subs = self.inner.subscribers.lock().unwrap();
            match subs.get(kind) {
                Some(entry) => (
                    entry.ordered,
                    entry
                        .subs
                        .iter()
                        .map(|s| (s.name.clone(), s.callback.clone()))
                        .collect(),
                ),
                None => return,
            }
        };

        if ordered {
            for (name, cb) in callbacks {
                if let Err(message) = cb(event.clone()).await {
                    self.reflect_error(is_internal_error, name, message);
                }
            }
        } else {
            let futures = callbacks.into_iter().map(|(name, cb)| {
                let event = event.clone();
                async move { (name, cb(event).await) }
            });
            for (name, result) in futures::future::join_all(futures).await {
                if let Err(message) = result {
                    self.reflect_error(is_internal_error, name, message);
                }
            }
        }
    }

    fn reflect_error(&self, is_internal_error: bool, callback_name: String, message: String) {
        if is_internal_error {
            // A failure inside an internal_error handler is swallowed, never re-fired.
            tracing::warn!(callback = %callback_name, %message, "internal_error handler failed");
            return;
        }

        tracing::error!(callback = %callback_name, %message, "subscriber failed");
        self.fire(KirkEvent::InternalError {
            message,
            callback_name,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn ordered_subscribers_fire_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(StdMutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            bus.register("suite_started", format!("sub{i}"), true, move |_ev| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(i);
                    Ok(())
                }
            });
        }

        let consumer = tokio::spawn({
            let bus = bus.clone();
            async move { bus.start().await }
        });

        bus.fire(KirkEvent::SuiteStarted {
            suite: Suite::new("s", vec![]),
        });
        bus.stop().await;
        consumer.await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn register_then_unregister_is_indistinguishable_from_never_registering() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicU32::new(0));

        let calls_clone = calls.clone();
        let id = bus.register("kernel_panic", "sub", false, move |_ev| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        bus.unregister("kernel_panic", id);

        let consumer = tokio::spawn({
            let bus = bus.clone();
            async move { bus.start().await }
        });
        bus.fire(KirkEvent::KernelPanic);
        bus.stop().await;
        consumer.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn subscriber_error_is_reflected_on_internal_error() {
        let bus = EventBus::new();
        let seen = Arc::new(StdMutex::new(None));

        bus.register("kernel_panic", "failing", false, |_ev| async move {
            Err("boom".to_string())
        });

        let seen_clone = seen.clone();
        bus.register("internal_error", "observer", false, move |ev| {
            let seen = seen_clone.clone();
            async move {
                if let KirkEvent::InternalError { message, callback_name } = ev {
                    *seen.lock().unwrap() = Some((message, callback_name));
                }
                Ok(())
            }
        });

        let consumer = tokio::spawn({
            let bus = bus.clone();
            async move { bus.start().await }
        });
        bus.fire(KirkEvent::KernelPanic);
        bus.stop().await;
        consumer.await.unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen, Some(("boom".to_string(), "failing".to_string())));
    }

    #[tokio::test]
    async fn stop_twice_is_a_noop_after_the_first() {
        let bus = EventBus::new();
        let consumer = tokio::spawn({
            let bus = bus.clone();
            async move { bus.start().await }
        });
        bus.stop().await;
        consumer.await.unwrap();

        // A second stop with no active consumer must not hang or panic.
        bus.stop().await;
    }
}
