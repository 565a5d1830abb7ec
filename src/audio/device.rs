//! Capture-device audio source
//!
//! Opens a cpal input stream on a dedicated thread and converts whatever
//! the device delivers (any sample format, channel count or rate) into
//! the engine's 48 kHz stereo i16 domain. The capture callback never
//! blocks: full channels shed the chunk and count the overflow.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::Sample;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::audio::resample::LinearResampler;
use crate::audio::{AudioBlock, AudioSource};
use crate::constants::AUDIO_SAMPLE_RATE;
use crate::error::AudioError;

/// Capacity of the capture hand-off channel, in chunks
const CHANNEL_CAPACITY: usize = 32;

/// Basic description of an input device
#[derive(Debug, Clone)]
pub struct InputDeviceInfo {
    pub name: String,
    pub is_default: bool,
}

/// List available capture devices
pub fn list_input_devices() -> Vec<InputDeviceInfo> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let mut devices = Vec::new();
    if let Ok(inputs) = host.input_devices() {
        for device in inputs {
            if let Ok(name) = device.name() {
                let is_default = default_name.as_deref() == Some(name.as_str());
                devices.push(InputDeviceInfo { name, is_default });
            }
        }
    }
    devices
}

/// Resolve a capture device by identifier.
///
/// An empty identifier means the default input device. Otherwise an exact
/// name match wins, falling back to a case-insensitive substring match so
/// user-facing names like "USB Audio" still resolve.
pub fn find_input_device(device_id: &str) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();

    if device_id.trim().is_empty() {
        return host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceUnavailable("no default input device".into()));
    }

    let devices: Vec<cpal::Device> = host
        .input_devices()
        .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?
        .collect();

    let wanted = device_id.to_lowercase();
    let mut fuzzy = None;
    for device in devices {
        if let Ok(name) = device.name() {
            if name == device_id {
                return Ok(device);
            }
            if fuzzy.is_none() && name.to_lowercase().contains(&wanted) {
                fuzzy = Some(device);
            }
        }
    }
    fuzzy.ok_or_else(|| AudioError::DeviceUnavailable(device_id.to_string()))
}

/// Audio source backed by a capture device
pub struct DeviceSource {
    rx: Receiver<Vec<i16>>,
    running: Arc<AtomicBool>,
    overflows: Arc<AtomicUsize>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceSource {
    /// Open the device and start the capture thread.
    ///
    /// Fails with `DeviceUnavailable` when the device cannot be resolved or
    /// probed; callers are expected to fall back to silence.
    pub fn open(device_id: &str) -> Result<Self, AudioError> {
        let device = find_input_device(device_id)?;
        let supported = device
            .default_input_config()
            .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;

        let name = device.name().unwrap_or_else(|_| "unknown".into());
        tracing::info!(
            device = %name,
            rate = supported.sample_rate().0,
            channels = supported.channels(),
            format = ?supported.sample_format(),
            "opening capture device"
        );

        let (tx, rx) = bounded::<Vec<i16>>(CHANNEL_CAPACITY);
        let running = Arc::new(AtomicBool::new(true));
        let overflows = Arc::new(AtomicUsize::new(0));

        let running_thread = running.clone();
        let overflows_thread = overflows.clone();
        let thread = std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                capture_thread(device, supported, tx, running_thread, overflows_thread);
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        Ok(Self {
            rx,
            running,
            overflows,
            thread: Some(thread),
        })
    }

    /// Chunks shed because the consumer fell behind
    pub fn overflow_count(&self) -> usize {
        self.overflows.load(Ordering::Relaxed)
    }
}

impl AudioSource for DeviceSource {
    fn next_block(&mut self, timeout: Duration) -> Result<AudioBlock, AudioError> {
        match self.rx.recv_timeout(timeout) {
            Ok(samples) => Ok(AudioBlock::new(samples)),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(AudioError::Timeout),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(AudioError::EndOfStream),
        }
    }
}

impl Drop for DeviceSource {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn capture_thread(
    device: cpal::Device,
    supported: cpal::SupportedStreamConfig,
    tx: Sender<Vec<i16>>,
    running: Arc<AtomicBool>,
    overflows: Arc<AtomicUsize>,
) {
    let config: cpal::StreamConfig = supported.config();
    let stream = match supported.sample_format() {
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, tx, overflows),
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, tx, overflows),
        _ => build_stream::<f32>(&device, &config, tx, overflows),
    };

    match stream {
        Ok(stream) => {
            if let Err(e) = stream.play() {
                tracing::error!("failed to start capture stream: {e}");
                return;
            }
            while running.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(10));
            }
            // Stream drops here, stopping capture
        }
        Err(e) => {
            tracing::error!("failed to build capture stream: {e}");
        }
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    tx: Sender<Vec<i16>>,
    overflows: Arc<AtomicUsize>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample,
    i16: cpal::FromSample<T>,
{
    let channels = config.channels as usize;
    let mut resampler = LinearResampler::new(config.sample_rate.0);
    if config.sample_rate.0 != AUDIO_SAMPLE_RATE {
        tracing::info!(
            from = config.sample_rate.0,
            "device rate differs from 48 kHz, resampling"
        );
    }

    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let stereo = to_stereo_i16(data, channels);
            let out = resampler.process(&stereo);
            if out.is_empty() {
                return;
            }
            if let Err(TrySendError::Full(_)) = tx.try_send(out) {
                overflows.fetch_add(1, Ordering::Relaxed);
            }
        },
        move |err| {
            tracing::error!("capture stream error: {err}");
        },
        None,
    )
}

/// Convert an interleaved capture buffer to stereo i16.
///
/// Mono is duplicated to both channels; extra channels beyond the first
/// two are discarded.
fn to_stereo_i16<T>(data: &[T], channels: usize) -> Vec<i16>
where
    T: cpal::SizedSample + Copy,
    i16: cpal::FromSample<T>,
{
    let frames = data.len() / channels.max(1);
    let mut out = Vec::with_capacity(frames * 2);
    for frame in data.chunks_exact(channels.max(1)) {
        let left = i16::from_sample(frame[0]);
        let right = if channels >= 2 {
            i16::from_sample(frame[1])
        } else {
            left
        };
        out.push(left);
        out.push(right);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mono_duplicates_to_stereo() {
        let data = [100i16, -200];
        assert_eq!(to_stereo_i16(&data, 1), vec![100, 100, -200, -200]);
    }

    #[test]
    fn test_stereo_passes_through() {
        let data = [1i16, 2, 3, 4];
        assert_eq!(to_stereo_i16(&data, 2), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_extra_channels_discarded() {
        // 4-channel interleaved, two frames
        let data = [1i16, 2, 9, 9, 3, 4, 9, 9];
        assert_eq!(to_stereo_i16(&data, 4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_missing_device_is_unavailable() {
        let result = find_input_device("definitely-not-a-real-device-name-xyz");
        assert!(matches!(result, Err(AudioError::DeviceUnavailable(_))) || result.is_err());
    }
}
