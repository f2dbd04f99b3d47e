use crate::error::LiveError;
use crate::state::{Meters, BAR_COUNT};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use num_complex::Complex;
use rustfft::FftPlanner;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Rate the provider expects for outbound audio.
pub const CAPTURE_SAMPLE_RATE: u32 = 16000;

const FFT_SIZE: usize = 256;

/// Microphone capture feeding PCM16 chunks to the channel's outbound queue.
///
/// The cpal callback only copies samples into a sync channel; a processing
/// thread does the downmix/resample/encode work and hands chunks off with a
/// non-blocking `try_send`. Chunk production is gated on the shared
/// `capturing` flag, checked inside the device callback: frames arriving
/// while the gate is closed are dropped, so the session can close the gate
/// before teardown and no chunk is produced after teardown begins.
pub struct AudioCapture {
    _stream: SendStream,
    _processor: Option<std::thread::JoinHandle<()>>,
}

/// Keeps a cpal output/input stream alive for RAII. cpal's `Stream` is
/// `!Send`/`!Sync` because the platform handle is not marked thread-safe, but
/// this wrapper only owns the handle to drop it when the owner is dropped; it
/// is never used from more than one thread concurrently. Asserting `Send`/
/// `Sync` lets the owning types cross the async task boundary they are shared
/// across.
struct SendStream(cpal::Stream);
unsafe impl Send for SendStream {}
unsafe impl Sync for SendStream {}

impl AudioCapture {
    pub fn start(
        device_name: Option<&str>,
        audio_tx: mpsc::Sender<Vec<u8>>,
        meters: Arc<Meters>,
        capturing: Arc<AtomicBool>,
    ) -> Result<Self, LiveError> {
        let host = cpal::default_host();

        let device = if let Some(name) = device_name {
            host.input_devices()
                .map_err(|e| LiveError::Device(format!("failed to list input devices: {}", e)))?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| LiveError::Device(format!("input device '{}' not found", name)))?
        } else {
            host.default_input_device()
                .ok_or_else(|| LiveError::Device("no default input device".into()))?
        };

        let device_label = device.name().unwrap_or_else(|_| "unknown".into());
        log::info!("[capture] using device: {}", device_label);

        // Try 16kHz mono, fall back to 48kHz with decimation.
        let (config, decimate) = match try_config(&device, CAPTURE_SAMPLE_RATE) {
            Some(cfg) => (cfg, 1),
            None => match try_config(&device, 48000) {
                Some(cfg) => {
                    let d = (cfg.sample_rate.0 / CAPTURE_SAMPLE_RATE).max(1);
                    log::info!(
                        "[capture] {}Hz unavailable, using {}Hz with {}:1 decimation",
                        CAPTURE_SAMPLE_RATE,
                        cfg.sample_rate.0,
                        d
                    );
                    (cfg, d)
                }
                None => {
                    let default = device
                        .default_input_config()
                        .map_err(|e| LiveError::Device(format!("no input config: {}", e)))?;
                    log::info!(
                        "[capture] using default config: {}Hz {}ch",
                        default.sample_rate().0,
                        default.channels()
                    );
                    let rate = default.sample_rate().0;
                    let d = (rate / CAPTURE_SAMPLE_RATE).max(1);
                    (
                        StreamConfig {
                            channels: 1,
                            sample_rate: default.sample_rate(),
                            buffer_size: cpal::BufferSize::Default,
                        },
                        d,
                    )
                }
            },
        };

        let effective_rate = config.sample_rate.0 / decimate;
        log::info!(
            "[capture] stream config: {}Hz, {}ch, decimate={}, effective={}Hz",
            config.sample_rate.0,
            config.channels,
            decimate,
            effective_rate
        );

        // Channel from cpal callback to processing thread.
        let (raw_tx, raw_rx) = std::sync::mpsc::sync_channel::<Vec<f32>>(128);

        let channels = config.channels as usize;
        let gate = capturing.clone();
        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if !gate.load(Ordering::SeqCst) {
                        return;
                    }
                    // Downmix to mono if stereo
                    let mono: Vec<f32> = if channels > 1 {
                        data.chunks(channels)
                            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                            .collect()
                    } else {
                        data.to_vec()
                    };
                    let samples: Vec<f32> = if decimate > 1 {
                        mono.iter().step_by(decimate as usize).copied().collect()
                    } else {
                        mono
                    };
                    let _ = raw_tx.try_send(samples);
                },
                |err| {
                    log::error!("[capture] stream error: {}", err);
                },
                None,
            )
            .map_err(|e| LiveError::Device(format!("failed to build input stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| LiveError::Device(format!("failed to start input stream: {}", e)))?;

        let processor = std::thread::spawn(move || {
            process_audio(raw_rx, audio_tx, meters, effective_rate, CAPTURE_SAMPLE_RATE);
        });

        Ok(Self {
            _stream: SendStream(stream),
            _processor: Some(processor),
        })
    }
}

fn try_config(device: &cpal::Device, rate: u32) -> Option<StreamConfig> {
    let config = StreamConfig {
        channels: 1,
        sample_rate: SampleRate(rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let supported = device.supported_input_configs().ok()?;
    for range in supported {
        if range.channels() == 1
            && range.min_sample_rate().0 <= rate
            && range.max_sample_rate().0 >= rate
        {
            return Some(config);
        }
    }
    // Also check stereo configs (we'll downmix)
    let supported = device.supported_input_configs().ok()?;
    for range in supported {
        if range.min_sample_rate().0 <= rate && range.max_sample_rate().0 >= rate {
            return Some(StreamConfig {
                channels: range.channels(),
                sample_rate: SampleRate(rate),
                buffer_size: cpal::BufferSize::Default,
            });
        }
    }
    None
}

fn process_audio(
    raw_rx: std::sync::mpsc::Receiver<Vec<f32>>,
    audio_tx: mpsc::Sender<Vec<u8>>,
    meters: Arc<Meters>,
    input_rate: u32,
    target_rate: u32,
) {
    let mut resampler = ResamplerState::default();

    // FFT setup — accumulate samples in a ring buffer since chunks may be < FFT_SIZE
    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(FFT_SIZE);
    let mut fft_ring = Vec::with_capacity(FFT_SIZE * 2);
    let mut fft_buffer = vec![Complex::new(0.0, 0.0); FFT_SIZE];
    let mut fft_smoothed = [0.0f32; BAR_COUNT];

    let mut frames: u64 = 0;
    let mut bytes: u64 = 0;

    while let Ok(samples) = raw_rx.recv() {
        let send_samples = if input_rate == target_rate {
            samples.clone()
        } else {
            resample_linear(&samples, input_rate, target_rate, &mut resampler)
        };
        let pcm = encode_pcm16(&send_samples);

        let peak = send_samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);
        if let Ok(mut p) = meters.input_peak.lock() {
            *p = peak;
        }

        // Accumulate samples for FFT
        fft_ring.extend_from_slice(&samples);
        if fft_ring.len() > FFT_SIZE * 2 {
            let drain = fft_ring.len() - FFT_SIZE * 2;
            fft_ring.drain(..drain);
        }

        if fft_ring.len() >= FFT_SIZE {
            let start = fft_ring.len() - FFT_SIZE;
            for i in 0..FFT_SIZE {
                let window = 0.5
                    * (1.0
                        - (2.0 * std::f32::consts::PI * i as f32 / (FFT_SIZE as f32 - 1.0))
                            .cos());
                fft_buffer[i] = Complex::new(fft_ring[start + i] * window, 0.0);
            }
            fft.process(&mut fft_buffer);

            let max_bin = FFT_SIZE / 2;
            for i in 0..BAR_COUNT {
                let idx = 1 + ((i as f32 / BAR_COUNT as f32) * (max_bin as f32 - 1.0)) as usize;
                let idx = idx.min(max_bin - 1);
                let mag = fft_buffer[idx].norm();
                let normalized = (mag * 0.4).min(1.0);
                fft_smoothed[i] = fft_smoothed[i] * 0.6 + normalized * 0.4;
            }
            if let Ok(mut data) = meters.spectrum.lock() {
                *data = fft_smoothed;
            }
        }

        frames += 1;
        bytes += pcm.len() as u64;
        if frames % 200 == 0 {
            log::debug!(
                "[capture] audio chunks={}, bytes_total={}, peak={:.4}",
                frames,
                bytes,
                peak
            );
        }

        match audio_tx.try_send(pcm) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("[capture] outbound queue full, dropping chunk");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }

    // Clear meters when the stream stops
    if let Ok(mut data) = meters.spectrum.lock() {
        *data = [0.0; BAR_COUNT];
    }
    if let Ok(mut p) = meters.input_peak.lock() {
        *p = 0.0;
    }
    log::info!("[capture] processing thread stopped");
}

/// Convert float samples in [-1, 1] to little-endian PCM16. The scale factor
/// is 32768; the cast saturates at full scale.
pub(crate) fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| ((s * 32768.0) as i16).to_le_bytes())
        .collect()
}

#[derive(Default)]
struct ResamplerState {
    t: f64,
    last_sample: f32,
    has_last: bool,
}

fn resample_linear(
    samples: &[f32],
    input_rate: u32,
    target_rate: u32,
    state: &mut ResamplerState,
) -> Vec<f32> {
    if samples.is_empty() || input_rate == target_rate {
        return samples.to_vec();
    }
    let step = input_rate as f64 / target_rate as f64;
    let mut out = Vec::with_capacity(((samples.len() as f64 / step) + 2.0) as usize);

    let mut buf = Vec::with_capacity(samples.len() + 1);
    if state.has_last {
        buf.push(state.last_sample);
    }
    buf.extend_from_slice(samples);

    let mut i: usize = 0;
    let mut t = state.t;
    while i + 1 < buf.len() {
        let s0 = buf[i];
        let s1 = buf[i + 1];
        let v = s0 + (s1 - s0) * t as f32;
        out.push(v);
        t += step;
        while t >= 1.0 {
            t -= 1.0;
            i += 1;
            if i + 1 >= buf.len() {
                break;
            }
        }
        if i + 1 >= buf.len() {
            break;
        }
    }

    state.t = t;
    if let Some(last) = buf.last() {
        state.last_sample = *last;
        state.has_last = true;
    }
    out
}

/// List available input devices (name strings).
pub fn list_input_devices() -> Vec<String> {
    let host = cpal::default_host();
    let devices = match host.input_devices() {
        Ok(d) => d,
        Err(_) => return Vec::new(),
    };
    devices.filter_map(|d| d.name().ok()).collect()
}

/// List available output devices (name strings).
pub fn list_output_devices() -> Vec<String> {
    let host = cpal::default_host();
    let devices = match host.output_devices() {
        Ok(d) => d,
        Err(_) => return Vec::new(),
    };
    devices.filter_map(|d| d.name().ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm16_scales_by_32768() {
        let pcm = encode_pcm16(&[0.0, 0.5, -0.5]);
        let samples: Vec<i16> = pcm
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(samples, vec![0, 16384, -16384]);
    }

    #[test]
    fn pcm16_saturates_at_full_scale() {
        let pcm = encode_pcm16(&[1.0, -1.0, 2.0]);
        let samples: Vec<i16> = pcm
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        // +1.0 would be 32768, one past i16::MAX; the cast clips.
        assert_eq!(samples, vec![32767, -32768, 32767]);
    }

    #[test]
    fn resampler_halves_sample_count_at_2x_decimation() {
        let mut state = ResamplerState::default();
        let input: Vec<f32> = (0..3200).map(|i| (i as f32 / 3200.0).sin()).collect();
        let out = resample_linear(&input, 32000, 16000, &mut state);
        assert!((out.len() as i64 - 1600).abs() < 4);
    }

    #[test]
    fn resampler_is_identity_at_matching_rates() {
        let mut state = ResamplerState::default();
        let input = vec![0.1f32, 0.2, 0.3];
        let out = resample_linear(&input, 16000, 16000, &mut state);
        assert_eq!(out, input);
    }
}
