// PyroVision — Event Bus
//
// Process-wide publish/subscribe. `post` copies the event into a bounded
// queue; a single dispatcher (the "evt_loop" thread, or whoever calls
// `dispatch_pending`) hands each event to every matching handler in post
// order. Handlers run on the dispatcher, so they only copy data and set task
// event bits; the heavy work happens in the owning task's loop.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::config::STACK_EVENT_LOOP;
use crate::events::{Event, EventBase};

/// How long `post` may wait for room in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Drop immediately if the queue is full.
    None,
    /// Best-effort: give up after the bound.
    For(Duration),
    /// Lifecycle events that must not be lost. Never use from inside a handler.
    Forever,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("event queue full, event dropped")]
    QueueFull,
    #[error("event bus closed")]
    Closed,
}

pub type HandlerId = u32;

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct Registration {
    id: HandlerId,
    base: Option<EventBase>,
    handler: Handler,
}

struct Inner {
    queue: Mutex<VecDeque<Event>>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
    handlers: Mutex<Vec<Registration>>,
    next_id: AtomicU32,
    closed: AtomicBool,
    dropped: AtomicU32,
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity: capacity.max(1),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
                handlers: Mutex::new(Vec::new()),
                next_id: AtomicU32::new(1),
                closed: AtomicBool::new(false),
                dropped: AtomicU32::new(0),
            }),
        }
    }

    /// Register `handler` for every event of `base`, or for all events when
    /// `base` is `None`.
    pub fn subscribe<F>(&self, base: Option<EventBase>, handler: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.lock().push(Registration {
            id,
            base,
            handler: Arc::new(handler),
        });
        id
    }

    /// Like `subscribe`, but the handler is removed when the returned guard
    /// is dropped. Tasks hold one per registration so a failed init or a
    /// finished run unregisters automatically.
    pub fn subscribe_scoped<F>(&self, base: Option<EventBase>, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        Subscription {
            bus: self.clone(),
            id: self.subscribe(base, handler),
        }
    }

    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        let mut handlers = self.inner.handlers.lock();
        let before = handlers.len();
        handlers.retain(|r| r.id != id);
        handlers.len() != before
    }

    /// Queue a copy of `event`. The caller keeps ownership of its value.
    pub fn post(&self, event: &Event, wait: Wait) -> Result<(), BusError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }

        let mut queue = self.inner.queue.lock();
        if queue.len() >= self.inner.capacity {
            match wait {
                Wait::None => return Err(self.drop_event(event)),
                Wait::For(timeout) => {
                    let deadline = Instant::now() + timeout;
                    while queue.len() >= self.inner.capacity {
                        if self.inner.closed.load(Ordering::Acquire) {
                            return Err(BusError::Closed);
                        }
                        if self.inner.not_full.wait_until(&mut queue, deadline).timed_out()
                            && queue.len() >= self.inner.capacity
                        {
                            return Err(self.drop_event(event));
                        }
                    }
                }
                Wait::Forever => {
                    while queue.len() >= self.inner.capacity {
                        if self.inner.closed.load(Ordering::Acquire) {
                            return Err(BusError::Closed);
                        }
                        self.inner.not_full.wait(&mut queue);
                    }
                }
            }
        }

        queue.push_back(event.clone());
        drop(queue);
        self.inner.not_empty.notify_one();
        Ok(())
    }

    /// `post` for callers that can only log a failure.
    pub fn post_or_warn(&self, event: &Event, wait: Wait) {
        if let Err(e) = self.post(event, wait) {
            log::warn!("Failed to post {:?} event: {}", event.base(), e);
        }
    }

    fn drop_event(&self, event: &Event) -> BusError {
        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        log::warn!("Event bus full, dropping {:?} event", event.base());
        BusError::QueueFull
    }

    /// Deliver everything currently queued on the caller's thread.
    pub fn dispatch_pending(&self) -> usize {
        let mut delivered = 0;
        while let Some(event) = self.pop() {
            self.dispatch(&event);
            delivered += 1;
        }
        delivered
    }

    fn pop(&self) -> Option<Event> {
        let event = self.inner.queue.lock().pop_front();
        if event.is_some() {
            self.inner.not_full.notify_one();
        }
        event
    }

    fn dispatch(&self, event: &Event) {
        let base = event.base();
        // Snapshot so a handler may (un)subscribe without deadlocking.
        let handlers: Vec<Handler> = self
            .inner
            .handlers
            .lock()
            .iter()
            .filter(|r| r.base.map_or(true, |b| b == base))
            .map(|r| Arc::clone(&r.handler))
            .collect();

        for handler in handlers {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                log::error!("Event handler panicked on {:?} event", base);
            }
        }
    }

    /// Spawn the dispatcher thread. It exits once the bus is closed and the
    /// queue has drained.
    pub fn spawn_dispatcher(&self) -> std::io::Result<JoinHandle<()>> {
        let bus = self.clone();
        thread::Builder::new()
            .name("evt_loop".into())
            .stack_size(STACK_EVENT_LOOP)
            .spawn(move || bus.run_dispatcher())
    }

    fn run_dispatcher(&self) {
        log::info!("Event loop started");
        loop {
            let event = {
                let mut queue = self.inner.queue.lock();
                loop {
                    if let Some(event) = queue.pop_front() {
                        break Some(event);
                    }
                    if self.inner.closed.load(Ordering::Acquire) {
                        break None;
                    }
                    self.inner
                        .not_empty
                        .wait_for(&mut queue, Duration::from_millis(100));
                }
            };

            match event {
                Some(event) => {
                    self.inner.not_full.notify_one();
                    self.dispatch(&event);
                }
                None => break,
            }
        }
        log::info!("Event loop stopped");
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.not_empty.notify_all();
        self.inner.not_full.notify_all();
    }

    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn dropped(&self) -> u32 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

#[must_use = "dropping the subscription unregisters the handler"]
pub struct Subscription {
    bus: EventBus,
    id: HandlerId,
}

impl Subscription {
    pub fn id(&self) -> HandlerId {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{DevicesEvent, NetworkEvent};

    fn recorder(bus: &EventBus, base: Option<EventBase>) -> Arc<Mutex<Vec<Event>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(base, move |e| sink.lock().push(e.clone()));
        seen
    }

    #[test]
    fn posted_payload_is_copied() {
        let bus = EventBus::new(8);
        let seen = recorder(&bus, None);

        let mut ssid = String::from("original");
        let event = Event::Network(NetworkEvent::CredentialsUpdated { ssid: ssid.clone() });
        bus.post(&event, Wait::None).unwrap();

        // Poster reuses and mutates its own buffer after posting.
        ssid.push_str("-mutated");
        let mut event = event;
        if let Event::Network(NetworkEvent::CredentialsUpdated { ssid: s }) = &mut event {
            *s = ssid.clone();
        }

        bus.dispatch_pending();
        let seen = seen.lock();
        assert_eq!(
            seen[0],
            Event::Network(NetworkEvent::CredentialsUpdated {
                ssid: "original".into()
            })
        );
    }

    #[test]
    fn delivery_preserves_post_order_per_handler() {
        let bus = EventBus::new(16);
        let seen = recorder(&bus, Some(EventBase::Network));

        for fd in 0..10 {
            bus.post(&Event::Network(NetworkEvent::WsClientConnected { fd }), Wait::None)
                .unwrap();
        }
        bus.dispatch_pending();

        let fds: Vec<i32> = seen
            .lock()
            .iter()
            .map(|e| match e {
                Event::Network(NetworkEvent::WsClientConnected { fd }) => *fd,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(fds, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn handlers_only_see_their_base() {
        let bus = EventBus::new(8);
        let network = recorder(&bus, Some(EventBase::Network));
        let devices = recorder(&bus, Some(EventBase::Devices));
        let all = recorder(&bus, None);

        bus.post(&Event::Network(NetworkEvent::ServerStarted), Wait::None).unwrap();
        bus.post(&Event::Devices(DevicesEvent::Charging(true)), Wait::None).unwrap();
        bus.dispatch_pending();

        assert_eq!(network.lock().len(), 1);
        assert_eq!(devices.lock().len(), 1);
        assert_eq!(all.lock().len(), 2);
    }

    #[test]
    fn full_queue_drops_without_touching_queued_events() {
        let bus = EventBus::new(2);
        let seen = recorder(&bus, None);

        bus.post(&Event::Network(NetworkEvent::ProvStarted), Wait::None).unwrap();
        bus.post(&Event::Network(NetworkEvent::ProvStopped), Wait::None).unwrap();
        assert_eq!(
            bus.post(&Event::Network(NetworkEvent::ProvTimeout), Wait::None),
            Err(BusError::QueueFull)
        );
        assert_eq!(bus.dropped(), 1);

        bus.dispatch_pending();
        assert_eq!(
            *seen.lock(),
            vec![
                Event::Network(NetworkEvent::ProvStarted),
                Event::Network(NetworkEvent::ProvStopped)
            ]
        );
    }

    #[test]
    fn bounded_wait_gives_up_after_timeout() {
        let bus = EventBus::new(1);
        bus.post(&Event::Network(NetworkEvent::ProvStarted), Wait::None).unwrap();

        let start = Instant::now();
        let result = bus.post(
            &Event::Network(NetworkEvent::ProvStopped),
            Wait::For(Duration::from_millis(30)),
        );
        assert_eq!(result, Err(BusError::QueueFull));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn bounded_wait_succeeds_when_room_appears() {
        let bus = EventBus::new(1);
        bus.post(&Event::Network(NetworkEvent::ProvStarted), Wait::None).unwrap();

        let drainer = bus.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drainer.dispatch_pending();
        });

        let result = bus.post(
            &Event::Network(NetworkEvent::ProvStopped),
            Wait::For(Duration::from_secs(2)),
        );
        t.join().unwrap();
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn panicking_handler_does_not_starve_others() {
        let bus = EventBus::new(4);
        bus.subscribe(None, |_| panic!("boom"));
        let seen = recorder(&bus, None);

        bus.post(&Event::Network(NetworkEvent::ServerError), Wait::None).unwrap();
        bus.dispatch_pending();
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new(4);
        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        let id = bus.subscribe(None, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.post(&Event::Network(NetworkEvent::ServerStarted), Wait::None).unwrap();
        bus.dispatch_pending();
        assert!(bus.unsubscribe(id));
        bus.post(&Event::Network(NetworkEvent::ServerStarted), Wait::None).unwrap();
        bus.dispatch_pending();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(!bus.unsubscribe(id));
    }

    #[test]
    fn scoped_subscription_unregisters_on_drop() {
        let bus = EventBus::new(4);
        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        let sub = bus.subscribe_scoped(None, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(sub);

        bus.post(&Event::Network(NetworkEvent::ServerStarted), Wait::None).unwrap();
        bus.dispatch_pending();
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dispatcher_thread_delivers_and_stops_on_close() {
        let bus = EventBus::new(8);
        let seen = recorder(&bus, None);
        let handle = bus.spawn_dispatcher().unwrap();

        bus.post(&Event::Network(NetworkEvent::ServerStarted), Wait::Forever).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while seen.lock().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        bus.close();
        handle.join().unwrap();
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(
            bus.post(&Event::Network(NetworkEvent::ServerStarted), Wait::None),
            Err(BusError::Closed)
        );
    }
}
