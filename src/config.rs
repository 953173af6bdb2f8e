//! Compile-time protocol constants shared by every module, and the
//! CLI-facing configuration supplied by the operator at launch (server
//! address, local port, log directory).

use std::time::Duration;

/// Opus/PCM sample rate. Fixed for the lifetime of a session.
pub const SAMPLE_RATE: u32 = 48_000;
/// Mono audio throughout: capture, encode, decode, mix, playback.
pub const CHANNELS: usize = 1;
/// Samples per 20 ms frame at 48 kHz.
pub const FRAME_SIZE: usize = 480;
/// Opus encoder target bitrate.
pub const BITRATE: i32 = 24_000;
/// Keep-alive cadence while connected.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(1);
/// Jitter buffer low/target/high watermarks, in packets.
pub const JITTER_MIN: usize = 3;
pub const JITTER_TARGET: usize = 6;
pub const JITTER_MAX: usize = 50;
/// Longest run of consecutive PLC substitutions before falling back to silence.
pub const PLC_MAX: u32 = 5;
/// A sender with no packets in this long is pruned from `senders`.
pub const RECEIVER_TIMEOUT: Duration = Duration::from_secs(60);
/// How often the receiver sweeps `senders` for inactive entries.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
/// Length of the client id prefix on every outbound/inbound data packet.
pub const CLIENT_ID_LEN: usize = 16;
/// Upper bound on an encoded Opus payload.
pub const MAX_OPUS_PACKET: usize = 4_000;
/// Mixer output ring buffer watermarks, in frames, used to decide whether the
/// playback side is falling behind (drop oldest) or running ahead (yield).
pub const MIN_QUEUE: usize = 5;
pub const MAX_QUEUE: usize = 25;
/// Bound on the outbound packet queue between Encode and Sender.
pub const SEND_QUEUE_CAPACITY: usize = 256;
/// How long `disconnect()` waits for each worker to finish before giving up.
pub const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
/// Socket recv timeout used by the Receiver so it can observe `is_running`
/// without blocking indefinitely.
pub const RECV_POLL_TIMEOUT: Duration = Duration::from_millis(5);

pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// CLI-level configuration: what the operator supplies at launch.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "groupvoice", about = "Group voice client over a UDP reflector")]
pub struct Args {
    /// Reflector server address, e.g. `voice.example.com:9000`.
    #[arg(short = 's', long)]
    pub server: String,

    /// UDP port to bind locally (0 = ephemeral, OS-assigned).
    #[arg(short = 'l', long, default_value_t = 0)]
    pub local_port: u16,

    /// Directory for the daily rolling log file.
    #[arg(long, default_value = "logs")]
    pub log_dir: String,

    /// Start with the microphone already enabled.
    #[arg(short = 't', long, default_value_t = false)]
    pub transmit: bool,
}
