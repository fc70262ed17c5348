//! Upstream frame sources and the hub that binds them to capture endpoints.
//!
//! A provider registers a [`FrameSource`] under a stable name; a capture
//! session binds a [`FrameReceiver`] to the same name. Either side may come
//! first. The hub forwards registration changes to the bound receiver as
//! [`SourceEvent`]s, always outside its own lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, info};

use crate::capture::frame::{Frame, FrameMetadata};
use crate::error::{CaptureError, Result};

/// Single-slot, non-blocking supplier of the current frame.
pub trait FrameSource: Send + Sync {
    /// Metadata of the current frame, if any, without taking it.
    fn peek(&self) -> Option<FrameMetadata>;

    /// Take the current frame. `Busy` when the slot is empty.
    fn get(&self) -> Result<Frame>;

    /// Hand a frame back once the consumer is done with it.
    fn put(&self, frame: Frame);
}

/// Receiving end of a binding; answers upstream notifications.
pub trait FrameReceiver: Send + Sync {
    fn on_event(&self, event: SourceEvent) -> EventReply;
}

#[derive(Clone)]
pub enum SourceEvent {
    Registered(Arc<dyn FrameSource>),
    Unregistered,
    QueryActive,
    FrameRateHint { duration_us: u32 },
    FrameRateHintEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventReply {
    Ack,
    Active,
    Inactive,
    Ignored,
}

impl fmt::Debug for SourceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceEvent::Registered(_) => f.write_str("Registered"),
            SourceEvent::Unregistered => f.write_str("Unregistered"),
            SourceEvent::QueryActive => f.write_str("QueryActive"),
            SourceEvent::FrameRateHint { duration_us } => f
                .debug_struct("FrameRateHint")
                .field("duration_us", duration_us)
                .finish(),
            SourceEvent::FrameRateHintEnd => f.write_str("FrameRateHintEnd"),
        }
    }
}

#[derive(Default)]
struct Link {
    source: Option<Arc<dyn FrameSource>>,
    receiver: Option<Weak<dyn FrameReceiver>>,
}

/// Shared upstream pool: named provider slots, each with at most one receiver.
#[derive(Default)]
pub struct SourceHub {
    links: Mutex<HashMap<String, Link>>,
}

impl SourceHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn links(&self) -> MutexGuard<'_, HashMap<String, Link>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish a provider under `name`, replacing any previous one.
    pub fn register(&self, name: &str, source: Arc<dyn FrameSource>) {
        let receiver = {
            let mut links = self.links();
            let link = links.entry(name.to_owned()).or_default();
            link.source = Some(source.clone());
            link.receiver.as_ref().and_then(Weak::upgrade)
        };
        info!("Frame source registered: {}", name);
        if let Some(receiver) = receiver {
            receiver.on_event(SourceEvent::Registered(source));
        }
    }

    pub fn unregister(&self, name: &str) {
        let receiver = {
            let mut links = self.links();
            let Some(link) = links.get_mut(name) else {
                return;
            };
            link.source = None;
            let receiver = link.receiver.as_ref().and_then(Weak::upgrade);
            if link.receiver.is_none() {
                links.remove(name);
            }
            receiver
        };
        info!("Frame source unregistered: {}", name);
        if let Some(receiver) = receiver {
            receiver.on_event(SourceEvent::Unregistered);
        }
    }

    /// Attach `receiver` to `name`. Fails with `Busy` if another receiver
    /// still holds the binding.
    pub fn bind(&self, name: &str, receiver: Weak<dyn FrameReceiver>) -> Result<()> {
        let (live, source) = {
            let mut links = self.links();
            let link = links.entry(name.to_owned()).or_default();
            if link.receiver.as_ref().is_some_and(|r| r.strong_count() > 0) {
                return Err(CaptureError::Busy("frame source already bound"));
            }
            link.receiver = Some(receiver.clone());
            (receiver.upgrade(), link.source.clone())
        };
        debug!("Receiver bound to {}", name);
        if let (Some(receiver), Some(source)) = (live, source) {
            receiver.on_event(SourceEvent::Registered(source));
        }
        Ok(())
    }

    pub fn unbind(&self, name: &str) {
        let mut links = self.links();
        if let Some(link) = links.get_mut(name) {
            link.receiver = None;
            if link.source.is_none() {
                links.remove(name);
            }
        }
        debug!("Receiver unbound from {}", name);
    }

    /// Deliver a provider-side event to the receiver bound to `name`.
    pub fn notify(&self, name: &str, event: SourceEvent) -> Option<EventReply> {
        let receiver = self
            .links()
            .get(name)
            .and_then(|link| link.receiver.as_ref())
            .and_then(Weak::upgrade)?;
        Some(receiver.on_event(event))
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.links()
            .get(name)
            .and_then(|link| link.receiver.as_ref())
            .is_some_and(|r| r.strong_count() > 0)
    }
}

/// In-memory single-slot source; a newer frame replaces one not yet taken.
#[derive(Default)]
pub struct SlotSource {
    slot: Mutex<Option<Frame>>,
    returned: AtomicU64,
    replaced: AtomicU64,
}

impl SlotSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<Frame>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Offer a frame. Returns `true` if an unconsumed frame was replaced.
    pub fn post(&self, frame: Frame) -> bool {
        let replaced = self.slot().replace(frame).is_some();
        if replaced {
            self.replaced.fetch_add(1, Ordering::Relaxed);
        }
        replaced
    }

    /// Frames handed back through [`FrameSource::put`].
    pub fn returned(&self) -> u64 {
        self.returned.load(Ordering::Relaxed)
    }

    pub fn replaced(&self) -> u64 {
        self.replaced.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.slot().is_none()
    }
}

impl FrameSource for SlotSource {
    fn peek(&self) -> Option<FrameMetadata> {
        self.slot().as_ref().map(|frame| frame.meta)
    }

    fn get(&self) -> Result<Frame> {
        self.slot()
            .take()
            .ok_or(CaptureError::Busy("no frame in source slot"))
    }

    fn put(&self, _frame: Frame) {
        self.returned.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl FrameReceiver for Recorder {
        fn on_event(&self, event: SourceEvent) -> EventReply {
            self.events.lock().unwrap().push(format!("{event:?}"));
            match event {
                SourceEvent::QueryActive => EventReply::Active,
                _ => EventReply::Ack,
            }
        }
    }

    fn frame(seq: u64) -> Frame {
        Frame::new(
            Bytes::from_static(b"px"),
            FrameMetadata::progressive(seq, 640, 480, seq * 1000, 1000),
        )
    }

    #[test]
    fn slot_source_take_and_return() {
        let source = SlotSource::new();
        assert!(source.peek().is_none());
        assert!(matches!(source.get(), Err(CaptureError::Busy(_))));

        assert!(!source.post(frame(1)));
        assert!(source.post(frame(2)));
        assert_eq!(source.replaced(), 1);
        assert_eq!(source.peek().map(|m| m.sequence), Some(2));

        let taken = source.get().unwrap();
        assert!(source.is_empty());
        source.put(taken);
        assert_eq!(source.returned(), 1);
    }

    #[test]
    fn bind_is_exclusive_and_replays_registration() {
        let hub = SourceHub::new();
        hub.register("vcapture.0", Arc::new(SlotSource::new()));

        let first: Arc<dyn FrameReceiver> = Arc::new(Recorder::default());
        hub.bind("vcapture.0", Arc::downgrade(&first)).unwrap();
        assert!(hub.is_bound("vcapture.0"));

        let second: Arc<dyn FrameReceiver> = Arc::new(Recorder::default());
        assert!(matches!(
            hub.bind("vcapture.0", Arc::downgrade(&second)),
            Err(CaptureError::Busy(_))
        ));

        hub.unbind("vcapture.0");
        hub.bind("vcapture.0", Arc::downgrade(&second)).unwrap();
    }

    #[test]
    fn events_reach_bound_receiver() {
        let hub = SourceHub::new();
        let recorder = Arc::new(Recorder::default());
        let receiver: Arc<dyn FrameReceiver> = recorder.clone();
        hub.bind("cam", Arc::downgrade(&receiver)).unwrap();

        hub.register("cam", Arc::new(SlotSource::new()));
        assert_eq!(hub.notify("cam", SourceEvent::QueryActive), Some(EventReply::Active));
        hub.unregister("cam");

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events, vec!["Registered", "QueryActive", "Unregistered"]);
        assert_eq!(hub.notify("other", SourceEvent::QueryActive), None);
    }

    #[test]
    fn dropped_receiver_frees_binding() {
        let hub = SourceHub::new();
        let receiver: Arc<dyn FrameReceiver> = Arc::new(Recorder::default());
        hub.bind("cam", Arc::downgrade(&receiver)).unwrap();
        drop(receiver);
        assert!(!hub.is_bound("cam"));

        let next: Arc<dyn FrameReceiver> = Arc::new(Recorder::default());
        assert!(hub.bind("cam", Arc::downgrade(&next)).is_ok());
    }
}
