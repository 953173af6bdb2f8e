//! Receiver: pulls datagrams off the UDP socket, classifies them, and feeds
//! data packets into the addressed sender's jitter buffer. A separate sweep
//! task prunes senders that have gone quiet.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use opus::{Channels, Decoder as OpusDecoder};
use parking_lot::Mutex as PlMutex;
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::config::{RECEIVER_TIMEOUT, RECV_POLL_TIMEOUT, SAMPLE_RATE, SWEEP_INTERVAL};
use crate::jitter::JitterBuffer;
use crate::stats::Stats;
use crate::wire::{classify, ClientId, Dropped};

/// Per-remote-sender decode state, created lazily on first packet.
pub struct SenderState {
    pub decoder: OpusDecoder,
    pub jitter_buffer: JitterBuffer,
    pub last_activity: Instant,
    pub plc_streak: u32,
}

impl SenderState {
    fn new() -> opus::Result<Self> {
        Ok(Self {
            decoder: OpusDecoder::new(SAMPLE_RATE, Channels::Mono)?,
            jitter_buffer: JitterBuffer::new(),
            last_activity: Instant::now(),
            plc_streak: 0,
        })
    }
}

pub type SenderMap = Arc<PlMutex<HashMap<ClientId, SenderState>>>;

/// Receives datagrams until `is_running` is cleared. Uses a short recv
/// timeout purely so the loop can observe the shutdown flag promptly; a
/// real timeout elapsing is not an error.
pub async fn run(
    socket: Arc<UdpSocket>,
    local_id: ClientId,
    senders: SenderMap,
    stats: Arc<Stats>,
    is_running: Arc<AtomicBool>,
) {
    let mut buf = [0u8; crate::config::MAX_OPUS_PACKET + 64];
    while is_running.load(Ordering::Relaxed) {
        let recv = tokio::time::timeout(RECV_POLL_TIMEOUT, socket.recv(&mut buf)).await;
        let n = match recv {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                warn!("receive error: {e}");
                continue;
            }
            Err(_) => continue,
        };

        match classify(&buf[..n], local_id) {
            Ok(inbound) => {
                let now = Instant::now();
                let mut map = senders.lock();
                let state = match map.entry(inbound.sender) {
                    std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                    std::collections::hash_map::Entry::Vacant(e) => match SenderState::new() {
                        Ok(s) => e.insert(s),
                        Err(err) => {
                            warn!("failed to create decoder for new sender: {err}");
                            continue;
                        }
                    },
                };
                state.last_activity = now;
                let was_duplicate = state.jitter_buffer.put(inbound.seq, inbound.opus, now);
                if was_duplicate {
                    stats.record_duplicate();
                }
            }
            Err(Dropped::TooShort) => trace!("dropped too-short datagram ({n} bytes)"),
            Err(Dropped::SelfEcho) => trace!("dropped self-echoed datagram"),
        }
    }
    debug!("receiver task exiting");
}

/// Periodically removes senders that haven't sent anything in
/// `RECEIVER_TIMEOUT`.
pub async fn run_sweep(senders: SenderMap, is_running: Arc<AtomicBool>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    while is_running.load(Ordering::Relaxed) {
        ticker.tick().await;
        if !is_running.load(Ordering::Relaxed) {
            break;
        }
        let now = Instant::now();
        let mut map = senders.lock();
        map.retain(|id, state| {
            let keep = now.duration_since(state.last_activity) < RECEIVER_TIMEOUT;
            if !keep {
                debug!("pruning inactive sender {id}");
            }
            keep
        });
    }
    debug!("sweep task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    #[tokio::test]
    async fn receiver_buffers_data_packets_by_sender() {
        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let sock = Arc::new(UdpSocket::bind(local).await.unwrap());
        let peer = UdpSocket::bind(local).await.unwrap();
        peer.connect(sock.local_addr().unwrap()).await.unwrap();

        let my_id = ClientId::from_bytes([1u8; 16]);
        let other_id = ClientId::from_bytes([2u8; 16]);
        let senders: SenderMap = Arc::new(PlMutex::new(HashMap::new()));
        let stats = Arc::new(Stats::new());
        let running = Arc::new(AtomicBool::new(true));

        let running_clone = running.clone();
        let senders_clone = senders.clone();
        let sock_clone = sock.clone();
        let handle = tokio::spawn(async move {
            run(sock_clone, my_id, senders_clone, stats, running_clone).await
        });

        let packet = crate::wire::OutboundPacket {
            client_id: other_id,
            seq: 1,
            opus: bytes::Bytes::from_static(&[0xf8, 0xff, 0xfe]),
        };
        peer.send(&packet.encode()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        {
            let map = senders.lock();
            assert!(map.contains_key(&other_id));
            assert_eq!(map.get(&other_id).unwrap().jitter_buffer.len(), 1);
        }

        running.store(false, Ordering::Relaxed);
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }

    #[tokio::test]
    async fn sweep_prunes_inactive_senders_immediately_when_timeout_is_zero() {
        let senders: SenderMap = Arc::new(PlMutex::new(HashMap::new()));
        let id = ClientId::from_bytes([3u8; 16]);
        senders.lock().insert(
            id,
            SenderState {
                decoder: OpusDecoder::new(SAMPLE_RATE, Channels::Mono).unwrap(),
                jitter_buffer: JitterBuffer::new(),
                last_activity: Instant::now() - Duration::from_secs(3600),
                plc_streak: 0,
            },
        );
        let now = Instant::now();
        let mut map = senders.lock();
        map.retain(|_, state| now.duration_since(state.last_activity) < RECEIVER_TIMEOUT);
        assert!(map.is_empty());
    }
}
