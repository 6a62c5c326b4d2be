use crate::domain::Value;
use crate::engine::cancel::CancelToken;
use crate::engine::context::Context;
use crate::engine::error::ResolveError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Long-lived observer registered in the run context by name.
///
/// Snapshots are copies; readers only contend with the background writer
/// for the buffer lock.
pub trait Listener: Send + Sync {
    fn events(&self) -> Vec<Value>;
    fn events_count(&self) -> usize;
    fn clear(&self);
    /// Idempotent; releases the background reader.
    fn stop(&self);
}

/// Builds a listener the first time a `listen` capture runs for a name.
pub type ListenerFactory =
    Arc<dyn Fn(&Context) -> Result<Arc<dyn Listener>, ResolveError> + Send + Sync>;

/// Bounded event buffer. When full the oldest event is dropped.
#[derive(Clone, Debug)]
pub struct EventBuffer {
    events: Arc<Mutex<VecDeque<Value>>>,
    capacity: usize,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
        }
    }

    pub fn push(&self, event: Value) {
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn snapshot(&self) -> Vec<Value> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

/// Listeners in registration order.
#[derive(Default)]
pub struct ListenerRegistry {
    entries: Vec<(String, Arc<dyn Listener>)>,
}

impl ListenerRegistry {
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Listener>> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, listener)| listener)
    }

    pub fn insert(&mut self, name: impl Into<String>, listener: Arc<dyn Listener>) {
        self.entries.push((name.into(), listener));
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stop and forget every listener, last registered first.
    pub fn stop_all(&mut self) -> Vec<String> {
        let mut stopped = Vec::with_capacity(self.entries.len());
        while let Some((name, listener)) = self.entries.pop() {
            listener.stop();
            stopped.push(name);
        }
        stopped
    }
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<Value>>>;

/// Adapts an mpsc receiver into a listener. Subscription and watch clients
/// plug in by forwarding their records into the sender half.
pub struct ChannelListener {
    buffer: EventBuffer,
    stop: CancelToken,
}

impl ChannelListener {
    /// Spawn the reader. It ends when stopped, when the run is cancelled or
    /// when every sender is dropped.
    pub fn spawn(receiver: mpsc::Receiver<Value>, capacity: usize, run: CancelToken) -> Arc<Self> {
        Self::attach(Arc::new(tokio::sync::Mutex::new(receiver)), false, capacity, run)
    }

    /// Start a reader on a receiver that outlives it. The reader holds the
    /// receiver until it finishes, so a later reader waits for an earlier
    /// one to let go. With `discard_pending`, events queued while no reader
    /// was attached are dropped.
    fn attach(receiver: SharedReceiver, discard_pending: bool, capacity: usize, run: CancelToken) -> Arc<Self> {
        let buffer = EventBuffer::new(capacity);
        let stop = CancelToken::new();

        let writer = buffer.clone();
        let stopped = stop.clone();
        tokio::spawn(async move {
            let mut receiver = tokio::select! {
                _ = stopped.cancelled() => return,
                _ = run.cancelled() => return,
                receiver = receiver.lock_owned() => receiver,
            };
            if discard_pending {
                while receiver.try_recv().is_ok() {}
            }
            loop {
                tokio::select! {
                    _ = stopped.cancelled() => break,
                    _ = run.cancelled() => break,
                    next = receiver.recv() => match next {
                        Some(event) => writer.push(event),
                        None => break,
                    },
                }
            }
            tracing::debug!("channel listener reader finished");
        });

        Arc::new(Self { buffer, stop })
    }

    /// Factory for the `listen` capture. Every registration (one per repeat
    /// of a run) attaches a fresh reader to the same receiver; events sent
    /// between two registrations are not carried over.
    pub fn factory(receiver: mpsc::Receiver<Value>) -> ListenerFactory {
        let receiver: SharedReceiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let attached = Arc::new(AtomicBool::new(false));
        Arc::new(move |ctx: &Context| {
            let discard_pending = attached.swap(true, Ordering::SeqCst);
            let listener: Arc<dyn Listener> = ChannelListener::attach(
                receiver.clone(),
                discard_pending,
                ctx.listener_buffer(),
                ctx.cancel_token(),
            );
            Ok(listener)
        })
    }
}

impl Listener for ChannelListener {
    fn events(&self) -> Vec<Value> {
        self.buffer.snapshot()
    }

    fn events_count(&self) -> usize {
        self.buffer.len()
    }

    fn clear(&self) {
        self.buffer.clear();
    }

    fn stop(&self) {
        self.stop.cancel();
    }
}
