use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::scan_config::ScanConfig;
use crate::core::bluetooth::gateway::{RadioGateway, ScanCallback, ScanEvent};
use crate::core::bluetooth::types::{PeripheralIdentity, ScanResult, ScanSession};

/// Turns the gateway's raw scan callbacks into a deduplicated, observable
/// device list.
///
/// `start` and `stop` never fail: a scan that could not start, or that the
/// adapter aborted, is reported by `active` dropping back to `false`.
pub struct BluetoothScanner {
    gateway: Arc<dyn RadioGateway>,
    session: Arc<watch::Sender<ScanSession>>,
    callback: ScanCallback,
    cancel_token: CancellationToken,
    pump_task_handle: Option<JoinHandle<()>>,
}

impl BluetoothScanner {
    /// Must be called from within a tokio runtime.
    pub fn new(gateway: Arc<dyn RadioGateway>, config: ScanConfig) -> Self {
        let (session, _) = watch::channel(ScanSession::default());
        let session = Arc::new(session);
        let (callback, events) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();

        let handle = tokio::spawn(Self::pump_scan_events(
            events,
            session.clone(),
            config,
            cancel_token.clone(),
        ));

        Self {
            gateway,
            session,
            callback,
            cancel_token,
            pump_task_handle: Some(handle),
        }
    }

    pub async fn start(&self) {
        let started = self.session.send_if_modified(|session| {
            if session.active {
                false
            } else {
                session.active = true;
                true
            }
        });
        if !started {
            debug!("Scan already active, ignoring start request.");
            return;
        }

        info!("Starting bluetooth scan");
        if let Err(e) = self.gateway.start_scan(self.callback.clone()).await {
            error!("Failed to start scan: {}", e);
            self.session
                .send_if_modified(|session| std::mem::replace(&mut session.active, false));
        }
    }

    pub async fn stop(&self) {
        let stopped = self
            .session
            .send_if_modified(|session| std::mem::replace(&mut session.active, false));
        if !stopped {
            debug!("No active scan to stop.");
            return;
        }

        info!("Stopping Bluetooth scan.");
        if let Err(e) = self.gateway.stop_scan().await {
            error!("Failed to stop scan: {}", e);
        }
    }

    /// Forgets every discovered peripheral. The only way results are removed.
    pub fn clear_results(&self) {
        self.session.send_if_modified(|session| {
            let had_results = !session.discovered.is_empty();
            session.discovered.clear();
            had_results
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<ScanSession> {
        self.session.subscribe()
    }

    pub fn session(&self) -> ScanSession {
        self.session.borrow().clone()
    }

    pub fn is_scanning(&self) -> bool {
        self.session.borrow().active
    }

    pub fn discovered(&self) -> Vec<PeripheralIdentity> {
        self.session.borrow().discovered.clone()
    }

    async fn pump_scan_events(
        mut events: mpsc::UnboundedReceiver<ScanEvent>,
        session: Arc<watch::Sender<ScanSession>>,
        config: ScanConfig,
        cancel_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(ScanEvent::Discovered(result)) => {
                            Self::record_results(&session, &config, [result]);
                        }
                        Some(ScanEvent::Batch(results)) => {
                            Self::record_results(&session, &config, results);
                        }
                        Some(ScanEvent::Failed(reason)) => {
                            warn!("Bluetooth scan failed: {}", reason);
                            session.send_if_modified(|session| {
                                std::mem::replace(&mut session.active, false)
                            });
                        }
                        None => break,
                    }
                }
                _ = cancel_token.cancelled() => break,
            }
        }
        debug!("Scan event pump finished.");
    }

    /// Appends results whose address has not been seen yet, in arrival order
    fn record_results(
        session: &watch::Sender<ScanSession>,
        config: &ScanConfig,
        results: impl IntoIterator<Item = ScanResult>,
    ) {
        session.send_if_modified(|session| {
            let mut changed = false;
            for result in results {
                if !config.accepts(&result) {
                    continue;
                }
                if session.discovered.contains(&result.peripheral) {
                    continue;
                }
                info!(
                    "Found device - Address: {}, Name: {}, RSSI: {:?}",
                    result.peripheral.address,
                    result.peripheral.display_name(),
                    result.rssi
                );
                session.discovered.push(result.peripheral);
                changed = true;
            }
            changed
        });
    }
}

impl Drop for BluetoothScanner {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        if let Some(handle) = self.pump_task_handle.take() {
            handle.abort();
        }
    }
}
