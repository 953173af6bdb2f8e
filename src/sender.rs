//! Sender: drains the outbound packet queue onto the UDP socket, and keeps
//! a separate keep-alive ticking so the reflector's NAT mapping (and our
//! entry in its peer table) doesn't expire during silence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_channel::Receiver as QueueReceiver;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::config::{KEEP_ALIVE_INTERVAL, RECV_POLL_TIMEOUT};
use crate::wire::{OutboundPacket, KEEP_ALIVE_BYTE};

/// Pulls encoded packets off `queue` and writes them to `socket` until
/// `is_running` is cleared and the queue drains. Blocks on `queue.recv()`
/// with a short timeout, mirroring the receiver's socket-read timeout, so
/// shutdown is never held up by a recv that never resolves.
pub async fn run(
    socket: Arc<UdpSocket>,
    queue: QueueReceiver<OutboundPacket>,
    is_running: Arc<AtomicBool>,
) {
    while is_running.load(Ordering::Relaxed) {
        match tokio::time::timeout(RECV_POLL_TIMEOUT, queue.recv()).await {
            Ok(Ok(packet)) => {
                let bytes = packet.encode();
                if let Err(e) = socket.send(&bytes).await {
                    warn!("failed to send data packet: {e}");
                }
            }
            Ok(Err(_)) => break,
            Err(_) => continue,
        }
    }
    debug!("sender task exiting");
}

/// Emits a 1-byte keep-alive on a fixed cadence while the session is up.
pub async fn run_keep_alive(socket: Arc<UdpSocket>, is_running: Arc<AtomicBool>) {
    let mut ticker = tokio::time::interval(KEEP_ALIVE_INTERVAL);
    while is_running.load(Ordering::Relaxed) {
        ticker.tick().await;
        if !is_running.load(Ordering::Relaxed) {
            break;
        }
        if let Err(e) = socket.send(&[KEEP_ALIVE_BYTE]).await {
            warn!("failed to send keep-alive: {e}");
        }
    }
    debug!("keep-alive task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    #[tokio::test]
    async fn sender_forwards_queued_packets_to_socket() {
        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let sock = Arc::new(UdpSocket::bind(local).await.unwrap());
        let peer = Arc::new(UdpSocket::bind(local).await.unwrap());
        sock.connect(peer.local_addr().unwrap()).await.unwrap();

        let (tx, rx) = async_channel::unbounded();
        let running = Arc::new(AtomicBool::new(true));

        let id = crate::wire::ClientId::from_bytes([1u8; 16]);
        tx.send(crate::wire::OutboundPacket {
            client_id: id,
            seq: 1,
            opus: bytes::Bytes::from_static(b"abc"),
        })
        .await
        .unwrap();

        let running_clone = running.clone();
        let handle = tokio::spawn(async move { run(sock, rx, running_clone).await });

        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(std::time::Duration::from_secs(1), peer.recv_from(&mut buf))
            .await
            .expect("should receive forwarded packet")
            .unwrap();
        assert_eq!(len, 16 + 4 + 3);

        running.store(false, Ordering::Relaxed);
        tx.close();
        let _ = handle.await;
    }
}
