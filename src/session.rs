//! Session: owns every piece of per-connection state and the worker
//! lifecycle. `connect` brings capture, sender, receiver, sweep and the
//! playout clock up together; `disconnect` tears them down in bounded time.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use cpal::traits::StreamTrait;
use parking_lot::Mutex as PlMutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{SEND_QUEUE_CAPACITY, WORKER_JOIN_TIMEOUT};
use crate::error::{Result, SessionError};
use crate::receiver::SenderMap;
use crate::stats::{Stats, StatsSnapshot};
use crate::wire::{registration_packet, ClientId};
use crate::{capture, mixer, receiver, sender};

/// Narrow observer interface so a UI or test harness can watch session
/// lifecycle events without the session depending on any particular UI
/// toolkit.
pub trait StatusSink: Send + Sync {
    fn on_status(&self, message: &str) {
        let _ = message;
    }
    fn on_connection_state(&self, connected: bool) {
        let _ = connected;
    }
    fn on_transmission_state(&self, transmitting: bool) {
        let _ = transmitting;
    }
}

/// A `StatusSink` that only writes to the tracing log, used when the
/// caller doesn't need lifecycle callbacks.
pub struct LoggingSink;

impl StatusSink for LoggingSink {
    fn on_status(&self, message: &str) {
        info!("{message}");
    }
    fn on_connection_state(&self, connected: bool) {
        info!("connection state: {}", if connected { "up" } else { "down" });
    }
    fn on_transmission_state(&self, transmitting: bool) {
        info!("transmission: {}", if transmitting { "on" } else { "off" });
    }
}

struct Workers {
    capture_stream: cpal::Stream,
    output_stream: cpal::Stream,
    playout_thread: std::thread::JoinHandle<()>,
    sender_task: JoinHandle<()>,
    keep_alive_task: JoinHandle<()>,
    receiver_task: JoinHandle<()>,
    sweep_task: JoinHandle<()>,
}

pub struct Session {
    client_id: ClientId,
    is_running: Arc<AtomicBool>,
    is_transmitting: Arc<AtomicBool>,
    tx_seq: Arc<AtomicU32>,
    senders: SenderMap,
    stats: Arc<Stats>,
    sink: Arc<dyn StatusSink>,
    workers: PlMutex<Option<Workers>>,
}

impl Session {
    pub fn new(sink: Arc<dyn StatusSink>) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            is_running: Arc::new(AtomicBool::new(false)),
            is_transmitting: Arc::new(AtomicBool::new(false)),
            tx_seq: Arc::new(AtomicU32::new(0)),
            senders: Arc::new(PlMutex::new(HashMap::new())),
            stats: Arc::new(Stats::new()),
            sink,
            workers: PlMutex::new(None),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_connected(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    /// Brings the session up: binds a socket, registers with the
    /// reflector, starts every worker, and opens the audio streams.
    pub async fn connect(&self, server: &str, local_port: u16, transmit_on_start: bool) -> Result<()> {
        if self.is_running.load(Ordering::Relaxed) {
            return Err(SessionError::AlreadyConnected);
        }

        let server_addr: SocketAddr = tokio::net::lookup_host(server)
            .await
            .map_err(|_| SessionError::AddressResolution(server.to_string()))?
            .next()
            .ok_or_else(|| SessionError::AddressResolution(server.to_string()))?;

        let bind_addr: SocketAddr = format!("0.0.0.0:{local_port}").parse().expect("valid socket addr");
        let socket = UdpSocket::bind(bind_addr).await.map_err(SessionError::SocketBind)?;
        socket.connect(server_addr).await.map_err(SessionError::SocketBind)?;
        let socket = Arc::new(socket);

        let reg = registration_packet(self.client_id);
        socket.send(&reg).await.map_err(SessionError::Registration)?;
        self.sink.on_status(&format!("registered with {server_addr} as {}", self.client_id));

        self.is_running.store(true, Ordering::Relaxed);
        self.is_transmitting.store(transmit_on_start, Ordering::Relaxed);

        let (queue_tx, queue_rx) = async_channel::bounded(SEND_QUEUE_CAPACITY);

        let host = capture::default_host();
        let (in_device, in_config, in_format) = capture::input_device_and_config(&host)?;
        let (out_device, out_config, out_format) = mixer::output_device_and_config(&host)?;

        let encoder = Arc::new(PlMutex::new(capture::new_encoder()?));

        let capture_stream = capture::build_input_stream(
            &in_device,
            &in_config,
            in_format,
            self.client_id,
            encoder,
            self.tx_seq.clone(),
            self.is_transmitting.clone(),
            queue_tx,
            self.stats.clone(),
        )?;
        capture_stream.play().map_err(SessionError::PlayStream)?;

        let (producer, consumer) = mixer::build_output_ring();
        let output_stream = mixer::build_output_stream(&out_device, &out_config, out_format, consumer)?;
        output_stream.play().map_err(SessionError::PlayStream)?;

        let senders = self.senders.clone();
        let stats = self.stats.clone();
        let is_running = self.is_running.clone();
        let playout_thread = std::thread::spawn(move || {
            mixer::run_playout_clock(senders, stats, producer, is_running);
        });

        let sender_task = tokio::spawn(sender::run(socket.clone(), queue_rx, self.is_running.clone()));
        let keep_alive_task = tokio::spawn(sender::run_keep_alive(socket.clone(), self.is_running.clone()));
        let receiver_task = tokio::spawn(receiver::run(
            socket.clone(),
            self.client_id,
            self.senders.clone(),
            self.stats.clone(),
            self.is_running.clone(),
        ));
        let sweep_task = tokio::spawn(receiver::run_sweep(self.senders.clone(), self.is_running.clone()));

        *self.workers.lock() = Some(Workers {
            capture_stream,
            output_stream,
            playout_thread,
            sender_task,
            keep_alive_task,
            receiver_task,
            sweep_task,
        });

        self.sink.on_connection_state(true);
        Ok(())
    }

    /// Tears everything down. Idempotent: calling it on an already
    /// disconnected session is a no-op.
    pub async fn disconnect(&self) {
        if !self.is_running.swap(false, Ordering::Relaxed) {
            return;
        }

        let workers = self.workers.lock().take();
        if let Some(w) = workers {
            w.capture_stream.pause().ok();
            w.output_stream.pause().ok();

            for (name, handle) in [
                ("sender", w.sender_task),
                ("keep_alive", w.keep_alive_task),
                ("receiver", w.receiver_task),
                ("sweep", w.sweep_task),
            ] {
                if tokio::time::timeout(WORKER_JOIN_TIMEOUT, handle).await.is_err() {
                    warn!("{name} task did not finish within the join timeout");
                }
            }
            if w.playout_thread.join().is_err() {
                warn!("playout clock thread panicked");
            }
        }

        self.senders.lock().clear();
        self.sink.on_connection_state(false);
    }

    /// Flips the microphone gate. Non-blocking: the capture callback reads
    /// this flag on every frame rather than being reconfigured.
    pub fn set_transmitting(&self, transmitting: bool) {
        self.is_transmitting.store(transmitting, Ordering::Relaxed);
        self.sink.on_transmission_state(transmitting);
    }

    pub fn is_transmitting(&self) -> bool {
        self.is_transmitting.load(Ordering::Relaxed)
    }
}
