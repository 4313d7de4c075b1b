use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::MIME_TYPE_PCMU;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::connection::PeerConnection;
use crate::error::{CallError, Result};

pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

const PCMU_RATE: u32 = 8000;
const FRAME_SAMPLES: usize = 160;
const FRAME_DURATION: Duration = Duration::from_millis(20);
const CAPTURE_QUEUE: usize = 64;

#[derive(Debug, Clone)]
pub struct MediaConstraints {
    pub audio: bool,
    /// Input device by name; the host default when unset
    pub input_device: Option<String>,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            input_device: None,
        }
    }
}

struct Capture {
    stop: std::sync::mpsc::Sender<()>,
    pump: tokio::task::JoinHandle<()>,
}

/// The call's capture tracks. Acquired once, shared read-only by every
/// peer link, released exactly once.
pub struct LocalMedia {
    tracks: RwLock<Option<Vec<LocalTrack>>>,
    capture: Mutex<Option<Capture>>,
    muted: Arc<AtomicBool>,
}

impl LocalMedia {
    /// Opens the capture device and starts feeding an outgoing PCMU track.
    pub async fn acquire(constraints: &MediaConstraints) -> Result<Self> {
        if !constraints.audio {
            info!("no capture requested, joining receive-only");
            return Ok(Self::from_tracks(Vec::new()));
        }

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_owned(),
                clock_rate: PCMU_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_owned(),
            "mesh-call".to_owned(),
        ));

        let (frames_tx, frames_rx) = mpsc::channel(CAPTURE_QUEUE);
        let (stop, sample_rate) = spawn_capture(constraints.input_device.clone(), frames_tx).await?;
        let muted = Arc::new(AtomicBool::new(false));
        let pump = tokio::spawn(pump_frames(frames_rx, sample_rate, track.clone(), muted.clone()));

        info!(sample_rate, "local audio acquired");
        Ok(Self {
            tracks: RwLock::new(Some(vec![track as LocalTrack])),
            capture: Mutex::new(Some(Capture { stop, pump })),
            muted,
        })
    }

    /// Wraps tracks fed by some other source.
    pub fn from_tracks(tracks: Vec<LocalTrack>) -> Self {
        Self {
            tracks: RwLock::new(Some(tracks)),
            capture: Mutex::new(None),
            muted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn tracks(&self) -> Option<Vec<LocalTrack>> {
        self.tracks.read().clone()
    }

    pub fn is_released(&self) -> bool {
        self.tracks.read().is_none()
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Adds every local track to `connection`. Must precede negotiation.
    pub async fn attach_to(&self, connection: &dyn PeerConnection) -> Result<()> {
        let tracks = self.tracks().ok_or(CallError::MediaNotAcquired)?;
        if tracks.is_empty() {
            return Ok(());
        }
        connection.add_tracks(&tracks).await
    }

    /// Stops capture and drops the tracks. Returns false if already released.
    pub fn release(&self) -> bool {
        let released = self.tracks.write().take().is_some();
        if let Some(capture) = self.capture.lock().take() {
            // Dropping the sender ends the capture thread.
            drop(capture.stop);
            capture.pump.abort();
        }
        if released {
            info!("local media released");
        }
        released
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.release();
    }
}

/// Runs the cpal stream on its own thread, since streams are not `Send`.
/// Resolves once the stream is playing, or fails with `MediaUnavailable`.
async fn spawn_capture(
    device_name: Option<String>,
    frames: mpsc::Sender<Vec<f32>>,
) -> Result<(std::sync::mpsc::Sender<()>, u32)> {
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<std::result::Result<u32, String>>();
    let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

    std::thread::Builder::new()
        .name("mesh-call-capture".into())
        .spawn(move || {
            let (stream, rate) = match open_input(device_name.as_deref(), frames) {
                Ok(opened) => opened,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(e.to_string()));
                return;
            }
            let _ = ready_tx.send(Ok(rate));
            // Blocks until the sender is dropped on release.
            let _ = stop_rx.recv();
            drop(stream);
            debug!("capture thread stopped");
        })
        .map_err(|e| CallError::MediaUnavailable(e.to_string()))?;

    let rate = tokio::task::spawn_blocking(move || ready_rx.recv())
        .await
        .map_err(|e| CallError::MediaUnavailable(e.to_string()))?
        .map_err(|_| CallError::MediaUnavailable("capture thread exited".into()))?
        .map_err(CallError::MediaUnavailable)?;
    Ok((stop_tx, rate))
}

fn open_input(
    device_name: Option<&str>,
    frames: mpsc::Sender<Vec<f32>>,
) -> std::result::Result<(cpal::Stream, u32), String> {
    let host = cpal::default_host();
    let device = match device_name {
        Some(name) => host
            .input_devices()
            .map_err(|e| e.to_string())?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| format!("no input device named {name}"))?,
        None => host
            .default_input_device()
            .ok_or_else(|| "No input device available".to_string())?,
    };

    let config = device.default_input_config().map_err(|e| e.to_string())?;
    let rate = config.sample_rate().0;
    let channels = config.channels() as usize;
    debug!(?config, "input config");

    let stream = match config.sample_format() {
        SampleFormat::F32 => build_input_stream::<f32>(&device, &config.into(), channels, frames),
        SampleFormat::I16 => build_input_stream::<i16>(&device, &config.into(), channels, frames),
        SampleFormat::U16 => build_input_stream::<u16>(&device, &config.into(), channels, frames),
        sample_format => return Err(format!("Unsupported sample format: {sample_format:?}")),
    }?;
    Ok((stream, rate))
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: usize,
    frames: mpsc::Sender<Vec<f32>>,
) -> std::result::Result<cpal::Stream, String>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let err_fn = |err| warn!("input stream error: {err}");
    let channels = channels.max(1);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mono: Vec<f32> = data
                    .chunks(channels)
                    .map(|frame| {
                        let sum: f32 = frame.iter().map(|s| <f32 as cpal::Sample>::from_sample(*s)).sum();
                        sum / frame.len() as f32
                    })
                    .collect();
                // A full queue means the pump is behind; drop rather than block the device.
                let _ = frames.try_send(mono);
            },
            err_fn,
            None,
        )
        .map_err(|e| e.to_string())
}

async fn pump_frames(
    mut frames: mpsc::Receiver<Vec<f32>>,
    sample_rate: u32,
    track: Arc<TrackLocalStaticSample>,
    muted: Arc<AtomicBool>,
) {
    let mut encoder = PcmuEncoder::new(sample_rate);
    while let Some(chunk) = frames.recv().await {
        for payload in encoder.push(&chunk) {
            if muted.load(Ordering::Relaxed) {
                continue;
            }
            let sample = Sample {
                data: payload,
                duration: FRAME_DURATION,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                warn!("failed to write audio sample: {e}");
            }
        }
    }
}

/// Downsamples mono float PCM to 8 kHz and packs it into 20 ms G.711
/// mu-law frames.
pub struct PcmuEncoder {
    input_rate: u32,
    phase: u32,
    acc: f32,
    acc_len: u32,
    pending: Vec<u8>,
}

impl PcmuEncoder {
    pub fn new(input_rate: u32) -> Self {
        Self {
            input_rate: input_rate.max(PCMU_RATE),
            phase: 0,
            acc: 0.0,
            acc_len: 0,
            pending: Vec::with_capacity(FRAME_SAMPLES),
        }
    }

    pub fn push(&mut self, samples: &[f32]) -> Vec<Bytes> {
        let mut out = Vec::new();
        for &sample in samples {
            self.acc += sample;
            self.acc_len += 1;
            self.phase += PCMU_RATE;
            if self.phase < self.input_rate {
                continue;
            }
            self.phase -= self.input_rate;
            let mean = self.acc / self.acc_len as f32;
            self.acc = 0.0;
            self.acc_len = 0;
            self.pending.push(linear_to_ulaw(to_i16(mean)));
            if self.pending.len() == FRAME_SAMPLES {
                out.push(Bytes::from(std::mem::replace(
                    &mut self.pending,
                    Vec::with_capacity(FRAME_SAMPLES),
                )));
            }
        }
        out
    }
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
}

pub fn linear_to_ulaw(sample: i16) -> u8 {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32635;

    let mut magnitude = i32::from(sample);
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0
    };
    let magnitude = magnitude.min(CLIP) + BIAS;
    let exponent = (31 - magnitude.leading_zeros() as i32 - 7).clamp(0, 7);
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    !(sign | (exponent << 4) | mantissa) as u8
}
