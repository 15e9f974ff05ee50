//! Connection controller for one peripheral.
//!
//! Sequences connect → service discovery → characteristic read/write over a
//! gateway that allows a single outstanding GATT operation. All state lives
//! in one actor task; commands and gateway callbacks both funnel into it,
//! and every change is published as a [`ConnectionSnapshot`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::connection_config::{ConnectionConfig, PendingPolicy};
use crate::core::bluetooth::error::{BluetoothError, Result};
use crate::core::bluetooth::gateway::{GattEvent, RadioGateway};
use crate::core::bluetooth::types::{
    ConnectionSnapshot, ConnectionState, FailureReason, OperationFailure, OperationKind,
    PendingOperation, PeripheralIdentity, ServiceTree,
};

/// A GATT request as submitted by the consumer
#[derive(Debug, Clone)]
enum GattRequest {
    DiscoverServices,
    Read(Uuid),
    Write(Uuid, Vec<u8>),
}

impl GattRequest {
    fn operation(&self) -> PendingOperation {
        match self {
            Self::DiscoverServices => PendingOperation {
                kind: OperationKind::DiscoverServices,
                characteristic: None,
            },
            Self::Read(uuid) => PendingOperation {
                kind: OperationKind::Read,
                characteristic: Some(*uuid),
            },
            Self::Write(uuid, _) => PendingOperation {
                kind: OperationKind::Write,
                characteristic: Some(*uuid),
            },
        }
    }
}

#[derive(Debug)]
enum ControllerCommand {
    Connect,
    Disconnect,
    Submit(GattRequest),
}

struct CommandEnvelope {
    command: ControllerCommand,
    reply: oneshot::Sender<Result<()>>,
}

/// Handle to the actor driving one peripheral's GATT session.
///
/// Commands return once the request has been issued (or rejected); outcomes
/// are observed through [`subscribe`](Self::subscribe). Dropping the handle
/// stops the actor, which disconnects the peripheral if needed.
pub struct ConnectionController {
    peripheral: PeripheralIdentity,
    commands: mpsc::UnboundedSender<CommandEnvelope>,
    snapshot: watch::Receiver<ConnectionSnapshot>,
    password_characteristic: Uuid,
    name_characteristic: Uuid,
    cancel_token: CancellationToken,
    task_handle: Option<JoinHandle<()>>,
}

impl ConnectionController {
    /// Must be called from within a tokio runtime.
    pub fn new(
        peripheral: PeripheralIdentity,
        gateway: Arc<dyn RadioGateway>,
        config: &ConnectionConfig,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state, snapshot) = watch::channel(ConnectionSnapshot::default());
        let cancel_token = CancellationToken::new();

        let task = ControllerTask {
            peripheral: peripheral.clone(),
            gateway,
            policy: config.pending_policy,
            operation_timeout: config.operation_timeout(),
            attempt_events: None,
            model: ConnectionSnapshot::default(),
            in_flight: None,
            queue: VecDeque::new(),
            state,
        };
        let handle = tokio::spawn(task.run(command_rx, cancel_token.clone()));

        Self {
            peripheral,
            commands,
            snapshot,
            password_characteristic: config.password_characteristic,
            name_characteristic: config.name_characteristic,
            cancel_token,
            task_handle: Some(handle),
        }
    }

    pub fn peripheral(&self) -> &PeripheralIdentity {
        &self.peripheral
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot.clone()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    pub fn is_connected(&self) -> bool {
        self.snapshot.borrow().is_connected()
    }

    /// Starts connecting. A no-op unless currently disconnected.
    pub async fn connect(&self) -> Result<()> {
        self.send(ControllerCommand::Connect).await
    }

    /// Starts disconnecting and drops interest in any pending operation.
    /// A no-op when already disconnected or disconnecting.
    pub async fn disconnect(&self) -> Result<()> {
        self.send(ControllerCommand::Disconnect).await
    }

    pub async fn discover_services(&self) -> Result<()> {
        self.send(ControllerCommand::Submit(GattRequest::DiscoverServices))
            .await
    }

    pub async fn read_characteristic(&self, characteristic: Uuid) -> Result<()> {
        self.send(ControllerCommand::Submit(GattRequest::Read(characteristic)))
            .await
    }

    pub async fn write_characteristic(
        &self,
        characteristic: Uuid,
        value: impl Into<Vec<u8>>,
    ) -> Result<()> {
        self.send(ControllerCommand::Submit(GattRequest::Write(
            characteristic,
            value.into(),
        )))
        .await
    }

    /// Reads the configured password characteristic
    pub async fn read_password(&self) -> Result<()> {
        self.read_characteristic(self.password_characteristic).await
    }

    /// Writes `name` to the configured name characteristic
    pub async fn write_name(&self, name: &str) -> Result<()> {
        self.write_characteristic(self.name_characteristic, name.as_bytes())
            .await
    }

    /// Stops the actor and waits for it to release the peripheral.
    pub async fn shutdown(mut self) {
        self.cancel_token.cancel();
        if let Some(handle) = self.task_handle.take() {
            if let Err(e) = handle.await {
                warn!("Connection task for {} ended abnormally: {:?}", self.peripheral.address, e);
            }
        }
    }

    async fn send(&self, command: ControllerCommand) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(CommandEnvelope { command, reply })
            .map_err(|_| BluetoothError::ControllerClosed)?;
        response.await.map_err(|_| BluetoothError::ControllerClosed)?
    }
}

impl Drop for ConnectionController {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

struct InFlight {
    operation: PendingOperation,
    deadline: Option<Instant>,
}

struct ControllerTask {
    peripheral: PeripheralIdentity,
    gateway: Arc<dyn RadioGateway>,
    policy: PendingPolicy,
    operation_timeout: Option<Duration>,
    /// Receiver for the connect attempt just issued, picked up by `run`
    attempt_events: Option<mpsc::UnboundedReceiver<GattEvent>>,
    model: ConnectionSnapshot,
    in_flight: Option<InFlight>,
    queue: VecDeque<GattRequest>,
    state: watch::Sender<ConnectionSnapshot>,
}

impl ControllerTask {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<CommandEnvelope>,
        cancel_token: CancellationToken,
    ) {
        // closed until the first connect attempt
        let (_, mut events) = mpsc::unbounded_channel::<GattEvent>();

        loop {
            let deadline = self.in_flight.as_ref().and_then(|f| f.deadline);
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                command = commands.recv() => {
                    let Some(CommandEnvelope { command, reply }) = command else {
                        break;
                    };
                    let result = self.handle_command(command).await;
                    if let Some(attempt_events) = self.attempt_events.take() {
                        events = attempt_events;
                    }
                    self.publish();
                    let _ = reply.send(result);
                }
                Some(event) = events.recv() => {
                    self.handle_event(event).await;
                    self.publish();
                }
                _ = wait_for_deadline(deadline) => {
                    self.handle_timeout().await;
                    self.publish();
                }
            }
        }

        self.release().await;
        self.publish();
        debug!("Connection task for {} finished.", self.peripheral.address);
    }

    async fn handle_command(&mut self, command: ControllerCommand) -> Result<()> {
        match command {
            ControllerCommand::Connect => {
                self.connect().await;
                Ok(())
            }
            ControllerCommand::Disconnect => {
                self.disconnect().await;
                Ok(())
            }
            ControllerCommand::Submit(request) => self.submit(request).await,
        }
    }

    async fn connect(&mut self) {
        if self.model.state != ConnectionState::Disconnected {
            debug!(
                "Ignoring connect request for {}: already {}",
                self.peripheral.address, self.model.state
            );
            return;
        }

        info!("Initiating connection to {}...", self.peripheral.address);
        self.model.state = ConnectionState::Connecting;

        // One channel per attempt. Outcomes of earlier attempts are dropped
        // together with their receiver.
        let (callback, events) = mpsc::unbounded_channel();
        self.attempt_events = Some(events);
        if let Err(e) = self.gateway.connect(&self.peripheral, callback).await {
            warn!("Could not start connecting to {}: {}", self.peripheral.address, e);
            self.enter_disconnected();
        }
    }

    async fn disconnect(&mut self) {
        match self.model.state {
            ConnectionState::Disconnected | ConnectionState::Disconnecting => {
                debug!("Device {} not connected", self.peripheral.address);
                return;
            }
            ConnectionState::Connecting | ConnectionState::Connected => {}
        }

        info!("Disconnecting from device {}", self.peripheral.address);
        self.model.state = ConnectionState::Disconnecting;
        self.abandon_operations("disconnect requested");
        if let Err(e) = self.gateway.disconnect(&self.peripheral).await {
            warn!("Could not request disconnect from {}: {}", self.peripheral.address, e);
            self.enter_disconnected();
        }
    }

    async fn submit(&mut self, request: GattRequest) -> Result<()> {
        self.check_preconditions(&request)?;

        if let Some(in_flight) = &self.in_flight {
            match self.policy {
                PendingPolicy::Reject => {
                    return Err(BluetoothError::Busy(in_flight.operation.kind));
                }
                PendingPolicy::Queue => {
                    debug!(
                        "Queueing {} behind pending {}",
                        request.operation().kind,
                        in_flight.operation.kind
                    );
                    self.queue.push_back(request);
                    return Ok(());
                }
            }
        }

        self.queue.push_back(request);
        self.issue_next().await;
        Ok(())
    }

    fn check_preconditions(&self, request: &GattRequest) -> Result<()> {
        if self.model.state != ConnectionState::Connected {
            return Err(BluetoothError::NotConnected(self.model.state));
        }
        if let Some(uuid) = request.operation().characteristic {
            if !self.model.services.contains_characteristic(uuid) {
                return Err(BluetoothError::UnknownCharacteristic(uuid));
            }
        }
        Ok(())
    }

    /// Issues queued requests until one is in flight or the queue is empty
    async fn issue_next(&mut self) {
        while self.in_flight.is_none() {
            let Some(request) = self.queue.pop_front() else {
                break;
            };
            let operation = request.operation();

            if let Err(e) = self.check_preconditions(&request) {
                warn!("Dropping queued {}: {}", operation.kind, e);
                self.record_failure(operation, FailureReason::Dropped(e.to_string()));
                continue;
            }

            debug!("Issuing {} {:?}", operation.kind, operation.characteristic);
            self.in_flight = Some(InFlight {
                operation: operation.clone(),
                deadline: self.operation_timeout.map(|timeout| Instant::now() + timeout),
            });

            let issued = match request {
                GattRequest::DiscoverServices => {
                    self.gateway.discover_services(&self.peripheral).await
                }
                GattRequest::Read(uuid) => {
                    self.gateway.read_characteristic(&self.peripheral, uuid).await
                }
                GattRequest::Write(uuid, value) => {
                    self.gateway
                        .write_characteristic(&self.peripheral, uuid, value)
                        .await
                }
            };

            if let Err(e) = issued {
                warn!("Could not issue {}: {}", operation.kind, e);
                self.in_flight = None;
                self.record_failure(operation, FailureReason::Rejected(e.to_string()));
            }
        }
    }

    async fn handle_event(&mut self, event: GattEvent) {
        match event {
            GattEvent::Connected => match self.model.state {
                ConnectionState::Connecting => {
                    info!("Connected to {}", self.peripheral.address);
                    self.model.state = ConnectionState::Connected;
                }
                other => debug!("Ignoring connected callback while {}", other),
            },
            GattEvent::ConnectFailed(reason) => match self.model.state {
                ConnectionState::Connecting | ConnectionState::Disconnecting => {
                    warn!("Connection to {} failed: {}", self.peripheral.address, reason);
                    self.enter_disconnected();
                }
                other => debug!("Ignoring connect failure while {}", other),
            },
            GattEvent::Disconnected => match self.model.state {
                ConnectionState::Disconnected => {
                    debug!("Ignoring duplicate disconnected callback");
                }
                ConnectionState::Disconnecting => {
                    info!("Successfully disconnected from {}", self.peripheral.address);
                    self.enter_disconnected();
                }
                other => {
                    warn!(
                        "Device {} lost connection while {}",
                        self.peripheral.address, other
                    );
                    self.enter_disconnected();
                }
            },
            GattEvent::ServicesDiscovered(tree) => {
                if self
                    .take_matching(OperationKind::DiscoverServices, None)
                    .is_some()
                {
                    info!(
                        "Discovered {} services on {}",
                        tree.services().len(),
                        self.peripheral.address
                    );
                    self.model.services = tree;
                    self.issue_next().await;
                }
            }
            GattEvent::DiscoveryFailed(reason) => {
                if let Some(operation) = self.take_matching(OperationKind::DiscoverServices, None) {
                    warn!("Service discovery failed: {}", reason);
                    self.record_failure(operation, FailureReason::Rejected(reason));
                    self.issue_next().await;
                }
            }
            GattEvent::CharacteristicRead {
                characteristic,
                result,
            } => {
                if let Some(operation) = self.take_matching(OperationKind::Read, Some(characteristic)) {
                    match result {
                        Ok(value) => {
                            debug!("Read {} bytes from {}", value.len(), characteristic);
                            self.model.last_read_value =
                                Some(String::from_utf8_lossy(&value).into_owned());
                        }
                        Err(reason) => {
                            warn!("Read of {} failed: {}", characteristic, reason);
                            self.record_failure(operation, FailureReason::Rejected(reason));
                        }
                    }
                    self.issue_next().await;
                }
            }
            GattEvent::CharacteristicWritten {
                characteristic,
                result,
            } => {
                if let Some(operation) = self.take_matching(OperationKind::Write, Some(characteristic)) {
                    match result {
                        Ok(()) => {
                            self.model.successful_write_count =
                                self.model.successful_write_count.saturating_add(1);
                            debug!(
                                "Write to {} acknowledged ({} so far)",
                                characteristic, self.model.successful_write_count
                            );
                        }
                        Err(reason) => {
                            warn!("Write to {} failed: {}", characteristic, reason);
                            self.record_failure(operation, FailureReason::Rejected(reason));
                        }
                    }
                    self.issue_next().await;
                }
            }
        }
    }

    async fn handle_timeout(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            warn!(
                "{} {:?} timed out on {}",
                in_flight.operation.kind, in_flight.operation.characteristic, self.peripheral.address
            );
            self.record_failure(in_flight.operation, FailureReason::TimedOut);
            self.issue_next().await;
        }
    }

    /// Clears the pending slot if the callback belongs to it. Anything else is
    /// a stale callback and is dropped.
    fn take_matching(
        &mut self,
        kind: OperationKind,
        characteristic: Option<Uuid>,
    ) -> Option<PendingOperation> {
        match &self.in_flight {
            Some(in_flight)
                if in_flight.operation.kind == kind
                    && in_flight.operation.characteristic == characteristic =>
            {
                self.in_flight.take().map(|in_flight| in_flight.operation)
            }
            _ => {
                debug!("Discarding stale {} callback for {:?}", kind, characteristic);
                None
            }
        }
    }

    fn record_failure(&mut self, operation: PendingOperation, reason: FailureReason) {
        self.model.last_failure = Some(OperationFailure {
            kind: operation.kind,
            characteristic: operation.characteristic,
            reason,
        });
    }

    /// Accepted requests never vanish: each one left over is recorded as dropped.
    fn abandon_operations(&mut self, reason: &str) {
        if let Some(in_flight) = self.in_flight.take() {
            debug!("Abandoning pending {}: {}", in_flight.operation.kind, reason);
            self.record_failure(in_flight.operation, FailureReason::Dropped(reason.to_string()));
        }
        while let Some(request) = self.queue.pop_front() {
            let operation = request.operation();
            warn!("Dropping queued {}: {}", operation.kind, reason);
            self.record_failure(operation, FailureReason::Dropped(reason.to_string()));
        }
    }

    /// The remote GATT table is not assumed stable across sessions, so the tree goes too.
    /// Read value and write count stay.
    fn enter_disconnected(&mut self) {
        self.model.state = ConnectionState::Disconnected;
        self.model.services = ServiceTree::default();
        self.abandon_operations("disconnected");
    }

    async fn release(&mut self) {
        if matches!(
            self.model.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            info!("Releasing {}", self.peripheral.address);
            if let Err(e) = self.gateway.disconnect(&self.peripheral).await {
                warn!("Could not disconnect {} on release: {}", self.peripheral.address, e);
            }
        }
        self.enter_disconnected();
    }

    fn publish(&mut self) {
        self.model.pending = self.in_flight.as_ref().map(|f| f.operation.clone());
        self.model.queued = self.queue.len();
        let model = &self.model;
        self.state.send_if_modified(|current| {
            if current == model {
                false
            } else {
                *current = model.clone();
                true
            }
        });
    }
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
