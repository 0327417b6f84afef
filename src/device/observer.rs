use std::sync::{Arc, Mutex};
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use log::debug;

use crate::device::types::{ControllerEvent, ErrorKind, SubscriptionHandle};

#[derive(Default)]
struct ObserverPortInner {
    next_handle: u64,
    senders: Vec<(SubscriptionHandle, UnboundedSender<ControllerEvent>)>,
}

/// Fans controller events out to every registered channel, in emission order.
///
/// Sending never blocks, so events may be emitted while the controller holds its state lock.
/// Channels whose receiver was dropped are forgotten on the next emit.
#[derive(Clone, Default)]
pub struct ObserverPort {
    inner: Arc<Mutex<ObserverPortInner>>,
}

impl ObserverPort {
    pub fn new() -> Self {
        ObserverPort::default()
    }

    pub fn subscribe(&self, sender: UnboundedSender<ControllerEvent>) -> SubscriptionHandle {
        let mut inner = self.inner.lock().expect("Failed to lock ObserverPort inner");
        inner.next_handle += 1;
        let handle = SubscriptionHandle(inner.next_handle);
        inner.senders.push((handle, sender));
        handle
    }

    pub fn channel(&self) -> (SubscriptionHandle, UnboundedReceiver<ControllerEvent>) {
        let (tx, rx) = unbounded();
        (self.subscribe(tx), rx)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut inner = self.inner.lock().expect("Failed to lock ObserverPort inner");
        let before = inner.senders.len();
        inner.senders.retain(|(h, _)| *h != handle);
        inner.senders.len() != before
    }

    pub fn emit(&self, event: ControllerEvent) {
        let mut inner = self.inner.lock().expect("Failed to lock ObserverPort inner");
        inner.senders.retain(|(handle, sender)| {
            if sender.unbounded_send(event.clone()).is_err() {
                debug!("Dropping observer {:?}, its receiver is gone", handle);
                return false;
            }
            true
        });
    }

    pub fn report(&self, kind: ErrorKind, message: impl Into<String>) {
        self.emit(ControllerEvent::Error { kind, message: message.into() });
    }
}
