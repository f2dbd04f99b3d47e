use crate::error::LiveError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Nominal rate of inbound synthesized audio.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Handle for one scheduled buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSource {
    pub id: u64,
    pub start: f64,
    pub end: f64,
}

/// Gapless scheduling state, in seconds on the output stream's sample clock.
///
/// `schedule` places each buffer at `max(next_start, clock_now)` so a steady
/// inbound stream plays back-to-back. `interrupt` stops everything in flight
/// and resets `next_start` to 0, so the next buffer starts at the current
/// clock instead of a stale future offset.
pub struct PlaybackScheduler {
    next_start: f64,
    next_source_id: u64,
    /// Source id -> scheduled end time. A handle is present iff its audio has
    /// not finished playing and has not been stopped.
    active: BTreeMap<u64, f64>,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self {
            next_start: 0.0,
            next_source_id: 0,
            active: BTreeMap::new(),
        }
    }

    /// Schedule a buffer of `duration` seconds against the current clock.
    pub fn schedule(&mut self, duration: f64, clock_now: f64) -> ScheduledSource {
        self.reap(clock_now);
        let start = self.next_start.max(clock_now);
        let end = start + duration;
        self.next_start = end;
        let id = self.next_source_id;
        self.next_source_id += 1;
        self.active.insert(id, end);
        ScheduledSource { id, start, end }
    }

    /// Drop handles whose audio has finished playing.
    pub fn reap(&mut self, clock_now: f64) {
        self.active.retain(|_, end| *end > clock_now);
    }

    /// Stop every in-flight source. Returns the stopped ids.
    pub fn interrupt(&mut self) -> Vec<u64> {
        let stopped: Vec<u64> = self.active.keys().copied().collect();
        self.active.clear();
        self.next_start = 0.0;
        stopped
    }

    pub fn next_start(&self) -> f64 {
        self.next_start
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, id: u64) -> bool {
        self.active.contains_key(&id)
    }
}

impl Default for PlaybackScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// What the dispatcher needs from the output side: schedule decoded samples,
/// abort everything on barge-in.
pub trait PlaybackSink: Send + Sync {
    /// Schedule decoded samples; returns the buffer duration in seconds.
    fn enqueue(&self, samples: Vec<i16>, sample_rate: u32) -> f64;
    fn stop_all(&self);
    fn active_count(&self) -> usize;
}

struct ScheduledBuffer {
    start_frame: u64,
    samples: Vec<i16>,
}

struct PlaybackShared {
    /// Frames written by the output callback; this is the output clock.
    frames_played: AtomicU64,
    queue: Mutex<Vec<ScheduledBuffer>>,
}

/// Output device wrapper. The cpal callback mixes scheduled buffers by
/// absolute frame position and advances the frame counter that backs the
/// scheduler's clock.
pub struct AudioPlayback {
    _stream: SendStream,
    shared: Arc<PlaybackShared>,
    scheduler: Mutex<PlaybackScheduler>,
    stream_rate: u32,
}

/// Keeps the cpal output stream alive for RAII. cpal's `Stream` is `!Send`/
/// `!Sync` because the platform handle is not marked thread-safe, but this
/// wrapper only owns the handle to drop it when `AudioPlayback` is dropped; it
/// is never used from more than one thread concurrently. Asserting `Send`/
/// `Sync` lets `AudioPlayback` satisfy the `PlaybackSink: Send + Sync` bound
/// the dispatcher relies on.
struct SendStream(cpal::Stream);
unsafe impl Send for SendStream {}
unsafe impl Sync for SendStream {}

impl AudioPlayback {
    pub fn start(device_name: Option<&str>) -> Result<Self, LiveError> {
        let host = cpal::default_host();

        let device = if let Some(name) = device_name {
            host.output_devices()
                .map_err(|e| LiveError::Device(format!("failed to list output devices: {}", e)))?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| LiveError::Device(format!("output device '{}' not found", name)))?
        } else {
            host.default_output_device()
                .ok_or_else(|| LiveError::Device("no default output device".into()))?
        };

        let device_label = device.name().unwrap_or_else(|_| "unknown".into());
        log::info!("[playback] using device: {}", device_label);

        let config = match try_output_config(&device, PLAYBACK_SAMPLE_RATE) {
            Some(cfg) => cfg,
            None => {
                let default = device
                    .default_output_config()
                    .map_err(|e| LiveError::Device(format!("no output config: {}", e)))?;
                log::info!(
                    "[playback] {}Hz unavailable, using device default {}Hz {}ch",
                    PLAYBACK_SAMPLE_RATE,
                    default.sample_rate().0,
                    default.channels()
                );
                StreamConfig {
                    channels: default.channels(),
                    sample_rate: default.sample_rate(),
                    buffer_size: cpal::BufferSize::Default,
                }
            }
        };

        let stream_rate = config.sample_rate.0;
        let channels = config.channels as usize;
        log::info!(
            "[playback] stream config: {}Hz, {}ch",
            stream_rate,
            channels
        );

        let shared = Arc::new(PlaybackShared {
            frames_played: AtomicU64::new(0),
            queue: Mutex::new(Vec::new()),
        });

        let shared_cb = shared.clone();
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / channels;
                    let base = shared_cb.frames_played.load(Ordering::SeqCst);
                    let mut queue = match shared_cb.queue.lock() {
                        Ok(q) => q,
                        Err(_) => return,
                    };
                    for frame in 0..frames {
                        let pos = base + frame as u64;
                        let mut acc: i32 = 0;
                        for buf in queue.iter() {
                            if pos < buf.start_frame {
                                continue;
                            }
                            let idx = (pos - buf.start_frame) as usize;
                            if idx < buf.samples.len() {
                                acc += buf.samples[idx] as i32;
                            }
                        }
                        let sample = (acc.clamp(i16::MIN as i32, i16::MAX as i32) as f32) / 32768.0;
                        for ch in 0..channels {
                            data[frame * channels + ch] = sample;
                        }
                    }
                    let end = base + frames as u64;
                    queue.retain(|buf| buf.start_frame + buf.samples.len() as u64 > end);
                    shared_cb.frames_played.store(end, Ordering::SeqCst);
                },
                |err| {
                    log::error!("[playback] stream error: {}", err);
                },
                None,
            )
            .map_err(|e| LiveError::Device(format!("failed to build output stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| LiveError::Device(format!("failed to start output stream: {}", e)))?;

        Ok(Self {
            _stream: SendStream(stream),
            shared,
            scheduler: Mutex::new(PlaybackScheduler::new()),
            stream_rate,
        })
    }

    /// Current output clock, in seconds.
    pub fn clock_secs(&self) -> f64 {
        self.shared.frames_played.load(Ordering::SeqCst) as f64 / self.stream_rate as f64
    }

    /// Schedule decoded samples for gapless playback. Returns the buffer's
    /// duration in seconds.
    pub fn enqueue(&self, samples: Vec<i16>, sample_rate: u32) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let duration = samples.len() as f64 / sample_rate.max(1) as f64;
        let samples = if sample_rate == self.stream_rate {
            samples
        } else {
            resample_i16(&samples, sample_rate, self.stream_rate)
        };

        let clock_now = self.clock_secs();
        let source = match self.scheduler.lock() {
            Ok(mut sched) => sched.schedule(duration, clock_now),
            Err(_) => return duration,
        };
        let start_frame = (source.start * self.stream_rate as f64).round() as u64;
        if let Ok(mut queue) = self.shared.queue.lock() {
            queue.push(ScheduledBuffer {
                start_frame,
                samples,
            });
        }
        duration
    }

    /// Barge-in: stop everything in flight and reset the schedule.
    pub fn stop_all(&self) {
        if let Ok(mut sched) = self.scheduler.lock() {
            let stopped = sched.interrupt();
            if !stopped.is_empty() {
                log::info!("[playback] interrupted {} active source(s)", stopped.len());
            }
        }
        if let Ok(mut queue) = self.shared.queue.lock() {
            queue.clear();
        }
    }

    pub fn active_count(&self) -> usize {
        let clock_now = self.clock_secs();
        match self.scheduler.lock() {
            Ok(mut sched) => {
                sched.reap(clock_now);
                sched.active_count()
            }
            Err(_) => 0,
        }
    }
}

impl PlaybackSink for AudioPlayback {
    fn enqueue(&self, samples: Vec<i16>, sample_rate: u32) -> f64 {
        AudioPlayback::enqueue(self, samples, sample_rate)
    }

    fn stop_all(&self) {
        AudioPlayback::stop_all(self)
    }

    fn active_count(&self) -> usize {
        AudioPlayback::active_count(self)
    }
}

fn try_output_config(device: &cpal::Device, rate: u32) -> Option<StreamConfig> {
    let supported = device.supported_output_configs().ok()?;
    for range in supported {
        if range.channels() == 1
            && range.min_sample_rate().0 <= rate
            && range.max_sample_rate().0 >= rate
        {
            return Some(StreamConfig {
                channels: 1,
                sample_rate: SampleRate(rate),
                buffer_size: cpal::BufferSize::Default,
            });
        }
    }
    let supported = device.supported_output_configs().ok()?;
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

fn resample_i16(samples: &[i16], input_rate: u32, target_rate: u32) -> Vec<i16> {
    if samples.is_empty() || input_rate == target_rate {
        return samples.to_vec();
    }
    let step = input_rate as f64 / target_rate as f64;
    let out_len = ((samples.len() as f64 / step) as usize).max(1);
    let mut out = Vec::with_capacity(out_len);
    let mut t = 0.0f64;
    while (t as usize) + 1 < samples.len() {
        let i = t as usize;
        let frac = (t - i as f64) as f32;
        let s0 = samples[i] as f32;
        let s1 = samples[i + 1] as f32;
        out.push((s0 + (s1 - s0) * frac) as i16);
        t += step;
    }
    out
}
