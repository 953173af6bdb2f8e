//! Fixed-cadence playout clock plus the cpal output stream it feeds.
//!
//! A dedicated thread wakes every `FRAME_DURATION`, asks every active
//! sender's jitter buffer what to play, decodes (or conceals) each into PCM,
//! mixes the results down to one frame, and pushes that frame into a
//! lock-free ring buffer. The cpal output callback only ever drains that
//! ring buffer — it never touches the network, the senders map, or a
//! decoder, so it can't be blocked by any of them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::Sample;
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use spin_sleep::SpinSleeper;
use tracing::{debug, error, trace};

use crate::config::{CHANNELS, FRAME_DURATION, FRAME_SIZE, MAX_QUEUE, MIN_QUEUE, PLC_MAX};
use crate::error::{Result, SessionError};
use crate::jitter::Selected;
use crate::receiver::SenderMap;
use crate::stats::Stats;

const RING_CAPACITY_FRAMES: usize = MAX_QUEUE + 10;

pub fn build_output_ring() -> (HeapProducer<i16>, HeapConsumer<i16>) {
    HeapRb::<i16>::new(RING_CAPACITY_FRAMES * FRAME_SIZE * CHANNELS).split()
}

/// Runs on its own OS thread (spawned with `std::thread::spawn`, not
/// `tokio::spawn`) so a slow decode never competes with the async runtime
/// for a worker thread. Marches a fixed deadline forward every tick
/// regardless of how long the tick's work took, the same discipline a
/// real-time mixing loop needs to avoid drifting off cadence.
pub fn run_playout_clock(
    senders: SenderMap,
    stats: Arc<Stats>,
    mut producer: HeapProducer<i16>,
    is_running: Arc<AtomicBool>,
) {
    let sleeper = SpinSleeper::default();
    let mut deadline = Instant::now() + FRAME_DURATION;
    let mut mix_buf = vec![0i32; FRAME_SIZE * CHANNELS];
    let mut pcm_buf = vec![0i16; FRAME_SIZE * CHANNELS];
    let mut frame_out = vec![0i16; FRAME_SIZE * CHANNELS];

    while is_running.load(Ordering::Relaxed) {
        sleeper.sleep(deadline.saturating_duration_since(Instant::now()));
        deadline += FRAME_DURATION;

        let now = Instant::now();
        mix_buf.iter_mut().for_each(|s| *s = 0);
        let mut active = 0usize;

        {
            let mut map = senders.lock();
            for state in map.values_mut() {
                let (selected, skipped) = state.jitter_buffer.select(now);
                if skipped {
                    stats.record_missed();
                }
                let decoded = match selected {
                    Selected::Packet(opus) => match state.decoder.decode(&opus, &mut pcm_buf, false) {
                        Ok(n) => {
                            state.plc_streak = 0;
                            Ok(n)
                        }
                        Err(e) => {
                            error!("opus decode error, falling back to PLC: {e}");
                            stats.record_missed();
                            if state.plc_streak < PLC_MAX {
                                state.plc_streak += 1;
                                stats.record_plc();
                                state.decoder.decode(&[], &mut pcm_buf, false)
                            } else {
                                Err(e)
                            }
                        }
                    },
                    Selected::Stall if state.plc_streak < PLC_MAX => {
                        state.plc_streak += 1;
                        stats.record_plc();
                        state.decoder.decode(&[], &mut pcm_buf, false)
                    }
                    Selected::Stall | Selected::Empty => continue,
                };
                match decoded {
                    Ok(n) => {
                        active += 1;
                        for i in 0..n.min(pcm_buf.len()) {
                            mix_buf[i] += pcm_buf[i] as i32;
                        }
                    }
                    Err(e) => error!("opus decode error: {e}"),
                }
            }
        }

        if active == 0 {
            frame_out.iter_mut().for_each(|s| *s = 0);
        } else {
            for (out, &sum) in frame_out.iter_mut().zip(mix_buf.iter()) {
                let averaged = sum / active as i32;
                *out = averaged.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
            }
        }

        let backlog = producer.len() / (FRAME_SIZE * CHANNELS);
        if backlog >= MAX_QUEUE {
            // Playback is falling behind: the producer side can't reach past
            // the consumer to evict an old frame, so the equivalent move is
            // to withhold this freshly mixed one rather than grow the ring's
            // backlog further.
            stats.record_queue_drop();
            trace!("mixer ring buffer backlogged, dropping frame");
            continue;
        }
        let pushed = producer.push_slice(&frame_out);
        if pushed < frame_out.len() {
            trace!("mixer ring buffer full mid-frame");
        }
        if backlog < MIN_QUEUE {
            // Running ahead of playback: no sleep needed, the deadline
            // march above already paces us.
        }
    }
    debug!("playout clock exiting");
}

pub fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    consumer: HeapConsumer<i16>,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_output::<f32>(device, config, consumer),
        cpal::SampleFormat::I16 => build_output::<i16>(device, config, consumer),
        cpal::SampleFormat::U16 => build_output::<u16>(device, config, consumer),
        other => Err(SessionError::UnsupportedSampleFormat(other)),
    }
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut consumer: HeapConsumer<i16>,
) -> Result<cpal::Stream>
where
    T: Sample + cpal::FromSample<i16> + cpal::SizedSample + 'static,
{
    let err_fn = |e| error!("output stream error: {e}");
    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                for sample in data.iter_mut() {
                    let s = consumer.pop().unwrap_or(0);
                    *sample = T::from_sample(s);
                }
            },
            err_fn,
            None,
        )
        .map_err(SessionError::BuildStream)?;
    Ok(stream)
}

pub fn output_device_and_config(
    host: &cpal::Host,
) -> Result<(cpal::Device, cpal::StreamConfig, cpal::SampleFormat)> {
    let device = host
        .default_output_device()
        .ok_or(SessionError::NoOutputDevice)?;
    let supported = device
        .default_output_config()
        .map_err(SessionError::DeviceConfig)?;
    let sample_format = supported.sample_format();
    Ok((device, supported.into(), sample_format))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixing_averages_and_clips() {
        let a = [30000i16, -30000, 100];
        let b = [30000i16, -30000, -50];
        let mut mix = [0i32; 3];
        for (m, &s) in mix.iter_mut().zip(a.iter()) {
            *m += s as i32;
        }
        for (m, &s) in mix.iter_mut().zip(b.iter()) {
            *m += s as i32;
        }
        let active = 2i32;
        let out: Vec<i16> = mix
            .iter()
            .map(|&sum| (sum / active).clamp(i16::MIN as i32, i16::MAX as i32) as i16)
            .collect();
        assert_eq!(out, vec![30000, -30000, 25]);
    }

    #[test]
    fn no_active_sources_yields_silence() {
        let mix = [0i32; FRAME_SIZE];
        let active = 0usize;
        let out: Vec<i16> = if active == 0 {
            vec![0i16; FRAME_SIZE]
        } else {
            mix.iter().map(|&s| s as i16).collect()
        };
        assert!(out.iter().all(|&s| s == 0));
    }

    #[test]
    fn ring_buffer_round_trips_a_frame() {
        let (mut producer, mut consumer) = build_output_ring();
        let frame = vec![1i16, 2, 3, 4];
        producer.push_slice(&frame);
        let mut out = vec![0i16; 4];
        let n = consumer.pop_slice(&mut out);
        assert_eq!(n, 4);
        assert_eq!(out, frame);
    }
}
