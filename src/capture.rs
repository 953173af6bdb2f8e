//! Capture + Encode: pull 20 ms PCM frames from the input device and, when
//! transmission is enabled, Opus-encode and enqueue them for the sender.
//! Runs inside the cpal input stream callback; encoding is cheap enough to
//! share the capture thread rather than hop to another one.

use std::any::TypeId;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_channel::Sender as QueueSender;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::Sample;
use opus::{Application, Bitrate, Encoder as OpusEncoder, Signal};
use parking_lot::Mutex as PlMutex;
use tracing::{debug, error};

use crate::config::{BITRATE, CHANNELS, FRAME_SIZE, SAMPLE_RATE};
use crate::error::{Result, SessionError};
use crate::stats::Stats;
use crate::wire::{ClientId, OutboundPacket};

pub fn default_host() -> cpal::Host {
    cpal::default_host()
}

pub fn new_encoder() -> Result<OpusEncoder> {
    let mut encoder = OpusEncoder::new(SAMPLE_RATE, opus::Channels::Mono, Application::Voip)
        .map_err(SessionError::EncoderInit)?;
    encoder
        .set_bitrate(Bitrate::Bits(BITRATE))
        .map_err(SessionError::EncoderInit)?;
    encoder.set_vbr(true).map_err(SessionError::EncoderInit)?;
    encoder
        .set_complexity(5)
        .map_err(SessionError::EncoderInit)?;
    encoder
        .set_signal(Signal::Voice)
        .map_err(SessionError::EncoderInit)?;
    Ok(encoder)
}

/// Build the input stream that drives capture+encode+enqueue for every
/// complete `FRAME_SIZE` frame, in whatever sample format the device gives
/// us. `is_transmitting` gates whether a captured frame reaches the encoder
/// at all — when false, frames are silently discarded.
pub fn build_input_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    client_id: ClientId,
    encoder: Arc<PlMutex<OpusEncoder>>,
    tx_seq: Arc<AtomicU32>,
    is_transmitting: Arc<AtomicBool>,
    send_queue: QueueSender<OutboundPacket>,
    stats: Arc<Stats>,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_input::<f32>(
            device,
            config,
            client_id,
            encoder,
            tx_seq,
            is_transmitting,
            send_queue,
            stats,
        ),
        cpal::SampleFormat::I16 => build_input::<i16>(
            device,
            config,
            client_id,
            encoder,
            tx_seq,
            is_transmitting,
            send_queue,
            stats,
        ),
        cpal::SampleFormat::U16 => build_input::<u16>(
            device,
            config,
            client_id,
            encoder,
            tx_seq,
            is_transmitting,
            send_queue,
            stats,
        ),
        other => Err(SessionError::UnsupportedSampleFormat(other)),
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    client_id: ClientId,
    encoder: Arc<PlMutex<OpusEncoder>>,
    tx_seq: Arc<AtomicU32>,
    is_transmitting: Arc<AtomicBool>,
    send_queue: QueueSender<OutboundPacket>,
    stats: Arc<Stats>,
) -> Result<cpal::Stream>
where
    T: Sample + cpal::SizedSample + 'static,
{
    let err_fn = |e| error!("input stream error: {e}");
    let mut frame_buf: Vec<i16> = Vec::with_capacity(FRAME_SIZE * CHANNELS);
    let mut opus_out = [0u8; crate::config::MAX_OPUS_PACKET];

    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _| {
                for &sample in data {
                    frame_buf.push(sample_to_i16(sample));
                    if frame_buf.len() == FRAME_SIZE * CHANNELS {
                        if is_transmitting.load(Ordering::Relaxed) {
                            let mut enc = encoder.lock();
                            match enc.encode(&frame_buf, &mut opus_out) {
                                Ok(len) => {
                                    let seq = tx_seq.fetch_add(1, Ordering::Relaxed);
                                    let packet = OutboundPacket {
                                        client_id,
                                        seq,
                                        opus: Bytes::copy_from_slice(&opus_out[..len]),
                                    };
                                    let mut to_send = packet;
                                    loop {
                                        match send_queue.try_send(to_send) {
                                            Ok(()) => break,
                                            Err(async_channel::TrySendError::Full(pkt)) => {
                                                // Audio freshness over backlog: make room by
                                                // dropping the oldest queued packet, not this
                                                // one, then retry.
                                                if send_queue.try_recv().is_err() {
                                                    debug!("send queue full and unable to drain, dropping frame");
                                                    break;
                                                }
                                                stats.record_queue_drop();
                                                to_send = pkt;
                                            }
                                            Err(async_channel::TrySendError::Closed(_)) => break,
                                        }
                                    }
                                }
                                Err(e) => error!("opus encode error: {e}"),
                            }
                        }
                        frame_buf.clear();
                    }
                }
            },
            err_fn,
            None,
        )
        .map_err(SessionError::BuildStream)?;
    Ok(stream)
}

fn sample_to_i16<T: Sample + 'static>(s: T) -> i16 {
    if TypeId::of::<T>() == TypeId::of::<i16>() {
        unsafe { std::mem::transmute_copy(&s) }
    } else if TypeId::of::<T>() == TypeId::of::<u16>() {
        let s: u16 = unsafe { std::mem::transmute_copy(&s) };
        (s as i32 - i16::MAX as i32 - 1) as i16
    } else if TypeId::of::<T>() == TypeId::of::<f32>() {
        let s: f32 = unsafe { std::mem::transmute_copy(&s) };
        (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
    } else {
        panic!("unsupported sample type")
    }
}

pub fn input_device_and_config(
    host: &cpal::Host,
) -> Result<(cpal::Device, cpal::StreamConfig, cpal::SampleFormat)> {
    let device = host
        .default_input_device()
        .ok_or(SessionError::NoInputDevice)?;
    let supported = device
        .default_input_config()
        .map_err(SessionError::DeviceConfig)?;
    let sample_format = supported.sample_format();
    Ok((device, supported.into(), sample_format))
}
