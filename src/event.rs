//! Session event notifications.
//!
//! A closed set of event kinds with per-kind subscriber lists, owned by
//! the session. Notifications are fire-and-forget: subscribers are
//! invoked synchronously from whichever thread publishes, must not
//! block, and get no way to acknowledge or veto anything.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::peer::ConnectionState;
use crate::signaling::SignalingMessage;

/// Audio-block lifecycle notifications.
#[derive(Debug, Clone)]
pub enum AudioEvent {
    /// A captured block was accepted by the outbound pipeline.
    BlockProcessed {
        frames: usize,
        channels: u16,
        timestamp: u64,
    },
    /// An encoded frame was packetized and handed to the transport.
    BlockSent {
        sequence: u16,
        timestamp: u32,
        bytes: usize,
    },
    /// Raw media was received from the transport.
    BlockReceived { payload: Bytes, received_at_ms: u64 },
    /// A received payload was decoded and queued for rendering.
    BlockDecoded {
        samples_per_channel: usize,
        channels: u16,
    },
}

/// Signaling channel lifecycle notifications. These never tear down the
/// peer connection by themselves.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Opened,
    Closed,
    Error(String),
}

type Subscriber<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct SubscriberList<T> {
    subscribers: Mutex<Vec<Subscriber<T>>>,
}

impl<T> SubscriberList<T> {
    fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn subscribe(&self, subscriber: Subscriber<T>) {
        self.subscribers.lock().push(subscriber);
    }

    fn publish(&self, value: &T) {
        // Clone the list out of the lock so subscribers may themselves
        // subscribe without deadlocking.
        let subscribers: Vec<Subscriber<T>> = self.subscribers.lock().clone();
        for subscriber in subscribers {
            subscriber(value);
        }
    }
}

/// Publish/subscribe registry for session notifications.
///
/// One instance per session; components receive an `Arc<EventBus>` at
/// construction.
pub struct EventBus {
    state: SubscriberList<ConnectionState>,
    messages: SubscriberList<SignalingMessage>,
    audio: SubscriberList<AudioEvent>,
    channel: SubscriberList<ChannelEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            state: SubscriberList::new(),
            messages: SubscriberList::new(),
            audio: SubscriberList::new(),
            channel: SubscriberList::new(),
        }
    }

    /// Subscribe to connectivity-state changes.
    pub fn on_state_change<F>(&self, f: F)
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.state.subscribe(Arc::new(f));
    }

    /// Subscribe to signaling message receipt.
    pub fn on_signaling_message<F>(&self, f: F)
    where
        F: Fn(&SignalingMessage) + Send + Sync + 'static,
    {
        self.messages.subscribe(Arc::new(f));
    }

    /// Subscribe to audio-block lifecycle events.
    pub fn on_audio_event<F>(&self, f: F)
    where
        F: Fn(&AudioEvent) + Send + Sync + 'static,
    {
        self.audio.subscribe(Arc::new(f));
    }

    /// Subscribe to signaling channel lifecycle events.
    pub fn on_channel_event<F>(&self, f: F)
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.channel.subscribe(Arc::new(f));
    }

    pub(crate) fn publish_state(&self, state: ConnectionState) {
        self.state.publish(&state);
    }

    pub(crate) fn publish_message(&self, message: &SignalingMessage) {
        self.messages.publish(message);
    }

    pub(crate) fn publish_audio(&self, event: AudioEvent) {
        self.audio.publish(&event);
    }

    pub(crate) fn publish_channel(&self, event: ChannelEvent) {
        self.channel.publish(&event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_state_subscriber_called() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = calls.clone();
        bus.on_state_change(move |state| {
            assert_eq!(*state, ConnectionState::Connected);
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish_state(ConnectionState::Connected);
        bus.publish_state(ConnectionState::Connected);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_audio_subscribers_all_called() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls_clone = calls.clone();
            bus.on_audio_event(move |_| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            });
        }

        bus.publish_audio(AudioEvent::BlockDecoded {
            samples_per_channel: 960,
            channels: 2,
        });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish_channel(ChannelEvent::Opened);
        bus.publish_audio(AudioEvent::BlockSent {
            sequence: 0,
            timestamp: 0,
            bytes: 0,
        });
    }

    #[test]
    fn test_subscriber_may_subscribe_reentrantly() {
        let bus = Arc::new(EventBus::new());
        let bus_clone = bus.clone();
        bus.on_channel_event(move |_| {
            bus_clone.on_channel_event(|_| {});
        });
        bus.publish_channel(ChannelEvent::Closed);
    }
}
