use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use futures::{FutureExt, StreamExt};
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::future::BoxFuture;
use log::{debug, info, warn};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::types::Config;
use crate::device::constants::{discovery_deadline, CANCEL_GRACE, TEARDOWN_DEADLINE};
use crate::device::observer::ObserverPort;
use crate::device::registry::DeviceRegistry;
use crate::device::router::{notification_router, NotificationRouter};
use crate::device::transport::{ConnectionHandle, LinkCallback, LinkEvent, TransportAdapter};
use crate::device::types::{
    Command, ConnectionState, ControllerEvent, DeviceDescriptor, ErrorKind, SubscriptionHandle,
};
use crate::error::{CommandError, TransportError};

#[derive(Debug, Clone, Copy)]
enum OperationKind {
    Discover,
    Connect,
    Subscribe,
    Teardown,
}

#[derive(Debug)]
struct Operation {
    id: u64,
    kind: OperationKind,
    cancel: CancellationToken,
}

#[derive(Debug)]
enum TeardownReason {
    Requested,
    // a link came up although the connect had already been cancelled
    Cancelled,
    Failed(TransportError),
    Reconnect {
        target: DeviceDescriptor,
        error: TransportError,
    },
}

#[derive(Debug)]
enum Completion {
    Discovered {
        op: u64,
        result: Result<Vec<DeviceDescriptor>, TransportError>,
    },
    Connected {
        op: u64,
        target: DeviceDescriptor,
        result: Result<ConnectionHandle, TransportError>,
    },
    Subscribed {
        op: u64,
        result: Result<(), TransportError>,
    },
    TornDown {
        op: u64,
        reason: TeardownReason,
        result: Result<(), TransportError>,
    },
    Cancelled {
        op: u64,
    },
    LinkLost {
        link: u64,
        error: TransportError,
    },
}

struct Shared {
    state: ConnectionState,
    registry: DeviceRegistry,
    selection: Option<DeviceDescriptor>,
    link: Option<ConnectionHandle>,
    // at most one transport operation is in flight
    operation: Option<Operation>,
    next_operation: u64,
    reconnect_attempted: bool,
    // the failure that triggered the reconnect currently in progress
    pending_reconnect: Option<TransportError>,
    // a Disconnect arrived while already tearing down; a pending reconnect must not happen
    disconnect_requested: bool,
    // transport tasks started under the lock, spawned once it is released
    spawns: Vec<BoxFuture<'static, ()>>,
}

fn reject(command: &Command, state: &ConnectionState, reason: &'static str) -> CommandError {
    CommandError::Rejected {
        command: command.to_string(),
        state: state.name().to_string(),
        reason,
    }
}

async fn teardown(transport: &dyn TransportAdapter, handle: &ConnectionHandle, unsubscribe: bool, characteristic: Uuid) -> Result<(), TransportError> {
    let deadline = Duration::from_millis(TEARDOWN_DEADLINE);

    if unsubscribe {
        match timeout(deadline, transport.unsubscribe(handle, characteristic)).await {
            Ok(Ok(())) => {},
            Ok(Err(err)) => warn!("Unsubscribing from link {} failed: {}", handle.id, err),
            Err(_) => warn!("Unsubscribing from link {} took too long", handle.id),
        }
    }

    timeout(deadline, transport.disconnect(handle)).await
        .unwrap_or_else(|_| Err(TransportError::DisconnectTimeout(deadline)))
}

/// Owns the one logical connection: its state, the devices found by the last scan, and the
/// transport operation in flight.
///
/// Commands are validated and applied synchronously under the state lock. Transport work runs on
/// spawned tasks which post their outcome back to the driver task started by
/// `connection_controller`; the driver applies those under the same lock, so the state is never
/// mutated from two places at once. Everything observers learn arrives as `ControllerEvent`s.
#[derive(Clone)]
pub struct ConnectionController {
    shared: Arc<Mutex<Shared>>,
    transport: Arc<dyn TransportAdapter>,
    config: Arc<Config>,
    observers: ObserverPort,
    router: NotificationRouter,
    completions: UnboundedSender<Completion>,
    cancel: CancellationToken,
    runtime: Handle,
}

impl ConnectionController {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().expect("Failed to lock ConnectionController state")
    }

    // Releases the state lock, then starts the transport tasks queued while it was held.
    fn unlock(&self, mut shared: MutexGuard<'_, Shared>) {
        let spawns = std::mem::take(&mut shared.spawns);
        drop(shared);

        for task in spawns {
            self.runtime.spawn(task);
        }
    }

    fn defer<F>(shared: &mut Shared, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        shared.spawns.push(task.boxed());
    }

    /// Accepts or rejects `command` right away; the outcome of accepted commands is reported
    /// through the event stream. May be called from any thread, inside the runtime or not.
    pub fn issue_command(&self, command: Command) -> Result<(), CommandError> {
        if self.cancel.is_cancelled() {
            return Err(CommandError::ShutDown);
        }

        let mut shared = self.lock();
        let result = self.apply_command(&mut shared, &command);
        self.unlock(shared);

        match &result {
            Ok(()) => debug!("Accepted {}", command),
            Err(err) => {
                warn!("{}", err);
                self.observers.report(ErrorKind::CommandRejected, err.to_string());
            },
        }
        result
    }

    pub fn current_state(&self) -> ConnectionState {
        self.lock().state.clone()
    }

    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        self.lock().registry.list()
    }

    pub fn selected_device(&self) -> Option<DeviceDescriptor> {
        self.lock().selection.clone()
    }

    pub fn subscribe(&self, observer: UnboundedSender<ControllerEvent>) -> SubscriptionHandle {
        self.observers.subscribe(observer)
    }

    pub fn events(&self) -> (SubscriptionHandle, UnboundedReceiver<ControllerEvent>) {
        self.observers.channel()
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.observers.unsubscribe(handle)
    }

    /// Handlers registered here receive the notification stream directly, without going through
    /// the event channel.
    pub fn notifications(&self) -> &NotificationRouter {
        &self.router
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stops the driver and the notification router. In-flight transport calls are dropped; an
    /// open link is not torn down, issue `Disconnect` first for that.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn apply_command(&self, shared: &mut Shared, command: &Command) -> Result<(), CommandError> {
        match command {
            Command::Scan => match shared.state {
                ConnectionState::Idle | ConnectionState::DeviceListReady => {
                    shared.disconnect_requested = false;
                    self.start_discovery(shared);
                    Ok(())
                },
                _ => Err(reject(command, &shared.state, "another operation is in progress")),
            },
            Command::SelectDevice(address) => match shared.state {
                ConnectionState::Idle | ConnectionState::DeviceListReady => match shared.registry.lookup(address) {
                    Some(device) => {
                        info!("Selected {}", device);
                        shared.selection = Some(device);
                        Ok(())
                    },
                    None => Err(reject(command, &shared.state, "the device was not found by the last scan")),
                },
                _ => Err(reject(command, &shared.state, "a device can only be selected while disconnected")),
            },
            Command::Connect => match shared.state {
                ConnectionState::Idle | ConnectionState::DeviceListReady => match shared.selection.clone() {
                    Some(target) => {
                        shared.reconnect_attempted = false;
                        shared.pending_reconnect = None;
                        shared.disconnect_requested = false;
                        self.start_connect(shared, target);
                        Ok(())
                    },
                    None => Err(reject(command, &shared.state, "no device has been selected")),
                },
                _ => Err(reject(command, &shared.state, "another operation is in progress")),
            },
            Command::ToggleConnect => {
                let resolved = match shared.state {
                    ConnectionState::Idle | ConnectionState::DeviceListReady => {
                        if shared.selection.is_some() { Command::Connect } else { Command::Scan }
                    },
                    _ => Command::Disconnect,
                };
                debug!("ToggleConnect resolved to {}", resolved);
                self.apply_command(shared, &resolved)
            },
            Command::Disconnect => self.apply_disconnect(shared, command),
        }
    }

    fn apply_disconnect(&self, shared: &mut Shared, command: &Command) -> Result<(), CommandError> {
        match shared.state {
            ConnectionState::Idle => Err(reject(command, &shared.state, "there is nothing to disconnect")),
            ConnectionState::Disconnecting => {
                debug!("Already disconnecting");
                shared.disconnect_requested = true;
                Ok(())
            },
            ConnectionState::DeviceListReady => {
                self.transition(shared, ConnectionState::Idle);
                self.observers.emit(ControllerEvent::Cancelled);
                Ok(())
            },
            ConnectionState::Scanning | ConnectionState::Connecting { .. } => {
                // the operation settles on its own task and reports back as cancelled
                if let Some(operation) = &shared.operation {
                    info!("Cancelling {:?} operation {}", operation.kind, operation.id);
                    operation.cancel.cancel();
                }
                self.transition(shared, ConnectionState::Disconnecting);
                Ok(())
            },
            ConnectionState::Connected { .. } => {
                self.start_teardown(shared, TeardownReason::Requested);
                Ok(())
            },
        }
    }

    fn transition(&self, shared: &mut Shared, next: ConnectionState) {
        if shared.state == next {
            return;
        }

        info!("{} -> {}", shared.state, next);
        shared.state = next.clone();
        self.observers.emit(ControllerEvent::StateChanged(next));
    }

    fn begin(&self, shared: &mut Shared, kind: OperationKind) -> (u64, CancellationToken) {
        if let Some(previous) = shared.operation.take() {
            debug!("{:?} operation {} superseded", previous.kind, previous.id);
            previous.cancel.cancel();
        }

        shared.next_operation += 1;
        let id = shared.next_operation;
        let cancel = self.cancel.child_token();
        shared.operation = Some(Operation { id, kind, cancel: cancel.clone() });
        debug!("{:?} operation {} started", kind, id);

        (id, cancel)
    }

    // Takes the in-flight operation if `op` still refers to it.
    fn finish(&self, shared: &mut Shared, op: u64) -> Option<Operation> {
        match &shared.operation {
            Some(operation) if operation.id == op => shared.operation.take(),
            _ => {
                debug!("Ignoring outcome of stale operation {}", op);
                None
            },
        }
    }

    fn post(completions: &UnboundedSender<Completion>, completion: Completion) {
        if completions.unbounded_send(completion).is_err() {
            debug!("Controller stopped before an operation completed");
        }
    }

    fn start_discovery(&self, shared: &mut Shared) {
        shared.registry.clear();
        shared.selection = None;

        let (op, cancel) = self.begin(shared, OperationKind::Discover);
        self.transition(shared, ConnectionState::Scanning);

        let transport = self.transport.clone();
        let completions = self.completions.clone();
        let scan_for = self.config.discovery_timeout();

        ConnectionController::defer(shared, async move {
            let completion = tokio::select! {
                _ = cancel.cancelled() => Completion::Cancelled { op },
                result = timeout(discovery_deadline(scan_for), transport.discover(scan_for)) => {
                    let result = result.unwrap_or_else(|_| Err(TransportError::DiscoveryTimeout(scan_for)));
                    Completion::Discovered { op, result }
                },
            };
            ConnectionController::post(&completions, completion);
        });
    }

    fn start_connect(&self, shared: &mut Shared, target: DeviceDescriptor) {
        let (op, cancel) = self.begin(shared, OperationKind::Connect);
        self.transition(shared, ConnectionState::Connecting { target: target.clone() });

        let transport = self.transport.clone();
        let completions = self.completions.clone();
        let connect_timeout = self.config.connect_timeout();

        ConnectionController::defer(shared, async move {
            let device = target.clone();
            let connect = timeout(connect_timeout, transport.connect(&device));
            tokio::pin!(connect);

            let settled = tokio::select! {
                result = &mut connect => Some(result),
                _ = cancel.cancelled() => {
                    // a link that still comes up is reported, so that it gets disconnected
                    timeout(Duration::from_millis(CANCEL_GRACE), &mut connect).await.ok()
                },
            };

            let completion = match settled {
                Some(result) => {
                    let result = result.unwrap_or_else(|_| Err(TransportError::ConnectTimeout(connect_timeout)));
                    Completion::Connected { op, target, result }
                },
                None => {
                    debug!("Connect to {} did not settle after cancelling, abandoning it", target);
                    Completion::Cancelled { op }
                },
            };
            ConnectionController::post(&completions, completion);
        });
    }

    fn link_callback(&self, link: u64) -> LinkCallback {
        let router = self.router.clone();
        let completions = self.completions.clone();

        Box::new(move |event| match event {
            LinkEvent::Data(payload) => {
                router.on_data(payload);
            },
            LinkEvent::Lost(error) => {
                ConnectionController::post(&completions, Completion::LinkLost { link, error });
            },
        })
    }

    fn start_subscribe(&self, shared: &mut Shared, handle: ConnectionHandle) {
        let (op, cancel) = self.begin(shared, OperationKind::Subscribe);

        let transport = self.transport.clone();
        let completions = self.completions.clone();
        let characteristic = self.config.target_characteristic_id;
        let callback = self.link_callback(handle.id);

        ConnectionController::defer(shared, async move {
            let completion = tokio::select! {
                _ = cancel.cancelled() => Completion::Cancelled { op },
                result = transport.subscribe(&handle, characteristic, callback) => Completion::Subscribed { op, result },
            };
            ConnectionController::post(&completions, completion);
        });
    }

    fn start_teardown(&self, shared: &mut Shared, reason: TeardownReason) {
        let handle = shared.link.clone();
        let unsubscribe = matches!(shared.state, ConnectionState::Connected { subscription_active: true, .. });

        // teardown is the cancellation path itself, so its token is never cancelled by a command
        let (op, _) = self.begin(shared, OperationKind::Teardown);
        self.transition(shared, ConnectionState::Disconnecting);

        let transport = self.transport.clone();
        let completions = self.completions.clone();
        let characteristic = self.config.target_characteristic_id;

        ConnectionController::defer(shared, async move {
            let result = match handle {
                None => Ok(()),
                Some(handle) => teardown(transport.as_ref(), &handle, unsubscribe, characteristic).await,
            };
            ConnectionController::post(&completions, Completion::TornDown { op, reason, result });
        });
    }

    fn link_failed(&self, shared: &mut Shared, error: TransportError) {
        let target = match &shared.state {
            ConnectionState::Connected { target, .. } => target.clone(),
            _ => return,
        };
        warn!("Link to {} failed: {}", target, error);

        if self.config.auto_reconnect && !shared.reconnect_attempted {
            shared.reconnect_attempted = true;
            self.start_teardown(shared, TeardownReason::Reconnect { target, error });
        } else {
            self.start_teardown(shared, TeardownReason::Failed(error));
        }
    }

    fn failure_message(shared: &mut Shared, error: &TransportError) -> String {
        match shared.pending_reconnect.take() {
            Some(original) => format!("{} (reconnect failed: {})", original, error),
            None => error.to_string(),
        }
    }

    fn settle_cancelled(&self, shared: &mut Shared) {
        self.transition(shared, ConnectionState::Idle);
        self.observers.emit(ControllerEvent::Cancelled);
    }

    fn apply_completion(&self, completion: Completion) {
        let mut shared = self.lock();
        self.complete(&mut shared, completion);
        self.unlock(shared);
    }

    fn complete(&self, shared: &mut Shared, completion: Completion) {
        match completion {
            Completion::Discovered { op, result } => {
                let Some(operation) = self.finish(shared, op) else { return };
                if operation.cancel.is_cancelled() {
                    self.settle_cancelled(shared);
                    return;
                }

                match result {
                    Ok(devices) if devices.is_empty() => {
                        let message = format!("No devices advertising {} were found", self.config.target_service_id);
                        warn!("{}", message);
                        self.observers.report(ErrorKind::NoDevicesFound, message);
                        self.transition(shared, ConnectionState::Idle);
                    },
                    Ok(devices) => {
                        info!("Discovered {} device(s)", devices.len());
                        shared.registry.replace(devices);
                        self.transition(shared, ConnectionState::DeviceListReady);
                    },
                    Err(err) => {
                        warn!("Discovery failed: {}", err);
                        self.observers.report(ErrorKind::Transport, err.to_string());
                        self.transition(shared, ConnectionState::Idle);
                    },
                }
            },
            Completion::Connected { op, target, result } => {
                let Some(operation) = self.finish(shared, op) else { return };

                match result {
                    Ok(handle) if operation.cancel.is_cancelled() => {
                        info!("Link {} came up after the connect was cancelled, releasing it", handle.id);
                        shared.link = Some(handle);
                        self.start_teardown(shared, TeardownReason::Cancelled);
                    },
                    Err(err) if operation.cancel.is_cancelled() => {
                        debug!("Cancelled connect failed anyway: {}", err);
                        self.settle_cancelled(shared);
                    },
                    Ok(handle) => {
                        info!("Connected to {} (link {})", target, handle.id);
                        shared.link = Some(handle.clone());
                        self.transition(shared, ConnectionState::Connected { target, subscription_active: false });
                        self.observers.emit(ControllerEvent::ServicesDiscovered(handle.services.clone()));
                        self.start_subscribe(shared, handle);
                    },
                    Err(err) => {
                        warn!("Connecting to {} failed: {}", target, err);
                        let message = ConnectionController::failure_message(shared, &err);
                        self.observers.report(ErrorKind::Transport, message);
                        self.transition(shared, ConnectionState::DeviceListReady);
                    },
                }
            },
            Completion::Subscribed { op, result } => {
                if self.finish(shared, op).is_none() {
                    return;
                }

                match result {
                    Ok(()) => {
                        if let ConnectionState::Connected { target, .. } = &shared.state {
                            let target = target.clone();
                            if shared.pending_reconnect.take().is_some() {
                                info!("Reconnected to {}", target);
                            }
                            shared.reconnect_attempted = false;
                            self.transition(shared, ConnectionState::Connected { target, subscription_active: true });
                        }
                    },
                    Err(err) => self.link_failed(shared, err),
                }
            },
            Completion::TornDown { op, reason, result } => {
                if self.finish(shared, op).is_none() {
                    return;
                }
                shared.link = None;

                let reason = match reason {
                    TeardownReason::Reconnect { target, error } if shared.disconnect_requested => {
                        info!("Not reconnecting to {}, a disconnect was requested", target);
                        TeardownReason::Failed(error)
                    },
                    other => other,
                };

                match reason {
                    TeardownReason::Requested => {
                        if let Err(err) = result {
                            warn!("Disconnecting failed: {}", err);
                            self.observers.report(ErrorKind::Transport, err.to_string());
                        }
                        self.transition(shared, ConnectionState::Idle);
                        self.observers.emit(ControllerEvent::Disconnected);
                    },
                    TeardownReason::Cancelled => {
                        if let Err(err) = result {
                            warn!("Releasing a cancelled link failed: {}", err);
                        }
                        self.settle_cancelled(shared);
                    },
                    TeardownReason::Failed(error) => {
                        if let Err(err) = result {
                            debug!("Teardown after a link failure also failed: {}", err);
                        }
                        let message = ConnectionController::failure_message(shared, &error);
                        self.observers.report(ErrorKind::Transport, message);
                        self.transition(shared, ConnectionState::Idle);
                        self.observers.emit(ControllerEvent::Disconnected);
                    },
                    TeardownReason::Reconnect { target, error } => {
                        if let Err(err) = result {
                            debug!("Teardown before reconnecting failed: {}", err);
                        }
                        warn!("Reconnecting to {} after: {}", target, error);
                        shared.pending_reconnect = Some(error);
                        self.start_connect(shared, target);
                    },
                }
            },
            Completion::Cancelled { op } => {
                if self.finish(shared, op).is_none() {
                    return;
                }
                self.settle_cancelled(shared);
            },
            Completion::LinkLost { link, error } => {
                let current = shared.link.as_ref().map(|handle| handle.id);
                if current != Some(link) || !shared.state.is_connected() {
                    debug!("Ignoring loss of stale link {}", link);
                    return;
                }
                self.link_failed(shared, error);
            },
        }
    }
}

/// Starts a controller for `transport`, together with its driver task. The driver (and the
/// notification router it owns) stop when `cancel` is cancelled.
///
/// Must be called from within a tokio runtime; every task of the controller runs on that runtime.
pub fn connection_controller(transport: Arc<dyn TransportAdapter>, config: Config, cancel: CancellationToken) -> (ConnectionController, JoinHandle<()>) {
    let runtime = Handle::current();
    let observers = ObserverPort::new();
    let (router, router_handle) = notification_router(cancel.clone(), observers.clone(), config.notification_retention);

    let data_observers = observers.clone();
    router.subscribe(move |event| {
        data_observers.emit(ControllerEvent::DataReceived(event.clone()));
        Ok(())
    });

    let (completions, mut completion_rx) = unbounded::<Completion>();

    let controller = ConnectionController {
        shared: Arc::new(Mutex::new(Shared {
            state: ConnectionState::Idle,
            registry: DeviceRegistry::new(),
            selection: None,
            link: None,
            operation: None,
            next_operation: 0,
            reconnect_attempted: false,
            pending_reconnect: None,
            disconnect_requested: false,
            spawns: Vec::new(),
        })),
        transport,
        config: Arc::new(config),
        observers,
        router,
        completions,
        cancel: cancel.clone(),
        runtime: runtime.clone(),
    };

    let driver = controller.clone();
    let handle = runtime.spawn(async move {
        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                Some(completion) = completion_rx.next() => {
                    driver.apply_completion(completion);
                },
            }
        }

        if let Err(err) = router_handle.await {
            warn!("Notification router task failed: {:?}", err);
        }
        info!("Connection controller stopped");
    });

    return (controller, handle);
}
