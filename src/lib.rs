//! Group voice client library: capture and encode local audio, exchange
//! packets with a UDP reflector, and decode/jitter-buffer/mix what comes
//! back from every other participant for fixed-cadence playback.

pub mod capture;
pub mod config;
pub mod error;
pub mod jitter;
pub mod mixer;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod stats;
pub mod wire;

pub use error::{Result, SessionError};
pub use session::{LoggingSink, Session, StatusSink};
