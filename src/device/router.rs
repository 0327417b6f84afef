use std::collections::VecDeque;
use std::error::Error;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use futures::StreamExt;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use log::{debug, warn};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::device::observer::ObserverPort;
use crate::device::types::{ErrorKind, NotificationEvent, SubscriptionHandle};
use crate::error::readable_thread_panic_error;

pub type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

type Handler = Box<dyn FnMut(&NotificationEvent) -> HandlerResult + Send>;

enum RouterMessage {
    Data(NotificationEvent),
    Subscribe(SubscriptionHandle, Handler),
    Unsubscribe(SubscriptionHandle),
}

struct Producer {
    next_ordinal: u64,
    history: VecDeque<NotificationEvent>,
}

/// Moves notification payloads off the transport's callback thread and hands them to handlers
/// one event at a time.
///
/// `on_data` only stamps and enqueues; delivery happens on the router task. Every handler sees
/// an event before any handler sees the next one, and handlers run in registration order.
#[derive(Clone)]
pub struct NotificationRouter {
    queue: UnboundedSender<RouterMessage>,
    producer: Arc<Mutex<Producer>>,
    next_handle: Arc<AtomicU64>,
    retention: usize,
}

impl NotificationRouter {
    /// Returns the ordinal assigned to this payload.
    pub fn on_data(&self, raw: Vec<u8>) -> u64 {
        // ordinal assignment and enqueueing happen under one lock so that the queue order always
        // matches the ordinal order, even with several producers
        let mut producer = self.producer.lock().expect("Failed to lock NotificationRouter producer");
        producer.next_ordinal += 1;
        let event = NotificationEvent { ordinal: producer.next_ordinal, payload: raw };

        if self.retention > 0 {
            if producer.history.len() == self.retention {
                producer.history.pop_front();
            }
            producer.history.push_back(event.clone());
        }

        let ordinal = event.ordinal;
        if self.queue.unbounded_send(RouterMessage::Data(event)).is_err() {
            debug!("Notification {} dropped, the router has stopped", ordinal);
        }
        ordinal
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: FnMut(&NotificationEvent) -> HandlerResult + Send + 'static,
    {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        if self.queue.unbounded_send(RouterMessage::Subscribe(handle, Box::new(handler))).is_err() {
            debug!("Subscription {:?} ignored, the router has stopped", handle);
        }
        handle
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        let _ = self.queue.unbounded_send(RouterMessage::Unsubscribe(handle));
    }

    /// The most recent events, oldest first, at most `retention` of them.
    pub fn history(&self) -> Vec<NotificationEvent> {
        let producer = self.producer.lock().expect("Failed to lock NotificationRouter producer");
        producer.history.iter().cloned().collect()
    }
}

fn deliver(handlers: &mut Vec<(SubscriptionHandle, Handler)>, event: &NotificationEvent, faults: &ObserverPort) {
    for (handle, handler) in handlers.iter_mut() {
        let message = match catch_unwind(AssertUnwindSafe(|| handler(event))) {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => format!("Notification handler {:?} failed on event {}: {}", handle, event.ordinal, err),
            Err(panic) => format!(
                "Notification handler {:?} panicked on event {}: {}",
                handle,
                event.ordinal,
                readable_thread_panic_error(&panic),
            ),
        };

        warn!("{}", message);
        faults.report(ErrorKind::ObserverFault, message);
    }
}

pub fn notification_router(cancel: CancellationToken, faults: ObserverPort, retention: usize) -> (NotificationRouter, JoinHandle<()>) {
    let (tx, mut rx) = unbounded::<RouterMessage>();

    let router = NotificationRouter {
        queue: tx,
        producer: Arc::new(Mutex::new(Producer { next_ordinal: 0, history: VecDeque::with_capacity(retention) })),
        next_handle: Arc::new(AtomicU64::new(0)),
        retention,
    };

    let handle = spawn(async move {
        let mut handlers: Vec<(SubscriptionHandle, Handler)> = Vec::new();

        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                message = rx.next() => match message {
                    None => break 'mainloop,
                    Some(RouterMessage::Data(event)) => deliver(&mut handlers, &event, &faults),
                    Some(RouterMessage::Subscribe(handle, handler)) => handlers.push((handle, handler)),
                    Some(RouterMessage::Unsubscribe(handle)) => handlers.retain(|(h, _)| *h != handle),
                },
            }
        }

        debug!("Notification router stopped");
    });

    return (router, handle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use futures::channel::mpsc::UnboundedReceiver;
    use tokio::time::timeout;
    use crate::device::types::ControllerEvent;

    fn forwarding(router: &NotificationRouter) -> (SubscriptionHandle, UnboundedReceiver<NotificationEvent>) {
        let (tx, rx) = unbounded();
        let handle = router.subscribe(move |event| {
            tx.unbounded_send(event.clone())?;
            Ok(())
        });
        (handle, rx)
    }

    async fn take(rx: &mut UnboundedReceiver<NotificationEvent>, count: usize) -> Vec<NotificationEvent> {
        let mut events = Vec::with_capacity(count);
        for _ in 0..count {
            let event = timeout(Duration::from_secs(5), rx.next()).await
                .expect("timed out waiting for a notification")
                .expect("router closed the channel");
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn ordinals_increase_with_arrival() {
        let (router, _task) = notification_router(CancellationToken::new(), ObserverPort::new(), 16);
        let (_, mut rx) = forwarding(&router);

        assert_eq!(router.on_data(vec![1]), 1);
        assert_eq!(router.on_data(vec![2]), 2);

        let events = take(&mut rx, 2).await;
        assert_eq!(events[0], NotificationEvent { ordinal: 1, payload: vec![1] });
        assert_eq!(events[1], NotificationEvent { ordinal: 2, payload: vec![2] });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_producers_are_seen_in_the_same_order_by_every_handler() {
        let (router, _task) = notification_router(CancellationToken::new(), ObserverPort::new(), 0);
        let (_, mut first) = forwarding(&router);
        let (_, mut second) = forwarding(&router);

        let producers: Vec<_> = (0..4u8)
            .map(|producer| {
                let router = router.clone();
                tokio::spawn(async move {
                    for i in 0..50u8 {
                        router.on_data(vec![producer, i]);
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.await.unwrap();
        }

        let first = take(&mut first, 200).await;
        let second = take(&mut second, 200).await;
        assert_eq!(first, second);
        assert!(first.windows(2).all(|pair| pair[0].ordinal < pair[1].ordinal));
    }

    #[tokio::test]
    async fn failing_handlers_do_not_stop_the_stream() {
        let faults = ObserverPort::new();
        let (_, mut fault_rx) = faults.channel();
        let (router, _task) = notification_router(CancellationToken::new(), faults, 16);

        router.subscribe(|event| {
            if event.ordinal == 1 {
                return Err("cannot parse payload".into());
            }
            Ok(())
        });
        router.subscribe(|event| {
            if event.ordinal == 2 {
                panic!("handler exploded");
            }
            Ok(())
        });
        let (_, mut rx) = forwarding(&router);

        router.on_data(vec![0xA]);
        router.on_data(vec![0xB]);
        router.on_data(vec![0xC]);

        let payloads: Vec<Vec<u8>> = take(&mut rx, 3).await.into_iter().map(|e| e.payload).collect();
        assert_eq!(payloads, vec![vec![0xA], vec![0xB], vec![0xC]]);

        for expected in ["cannot parse payload", "handler exploded"] {
            match timeout(Duration::from_secs(5), fault_rx.next()).await.unwrap() {
                Some(ControllerEvent::Error { kind: ErrorKind::ObserverFault, message }) => {
                    assert!(message.contains(expected), "{}", message)
                },
                other => panic!("unexpected fault event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn unsubscribed_handlers_receive_nothing_further() {
        let (router, _task) = notification_router(CancellationToken::new(), ObserverPort::new(), 16);
        let (handle, mut dropped) = forwarding(&router);
        let (_, mut kept) = forwarding(&router);

        router.on_data(vec![1]);
        router.unsubscribe(handle);
        router.on_data(vec![2]);

        assert_eq!(take(&mut kept, 2).await.len(), 2);
        assert_eq!(take(&mut dropped, 1).await[0].payload, vec![1]);
        // the handler (and with it the sender) is gone once the unsubscribe was processed
        assert_eq!(timeout(Duration::from_secs(5), dropped.next()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn history_is_bounded_by_retention() {
        let (router, _task) = notification_router(CancellationToken::new(), ObserverPort::new(), 3);

        for i in 0..5u8 {
            router.on_data(vec![i]);
        }

        let ordinals: Vec<u64> = router.history().into_iter().map(|e| e.ordinal).collect();
        assert_eq!(ordinals, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn zero_retention_keeps_no_history() {
        let (router, _task) = notification_router(CancellationToken::new(), ObserverPort::new(), 0);
        router.on_data(vec![1]);
        assert!(router.history().is_empty());
    }
}
