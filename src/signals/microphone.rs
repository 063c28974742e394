// Microphone signal source
//
// Monitors ambient audio peak levels and emits a threshold crossing when
// the normalized RMS of a capture chunk reaches the configured level.
// Capture runs on its own OS thread feeding a bounded peak queue, and the
// poll drains that queue to the freshest value. Audio is privacy-sensitive:
// the source checks the microphone grant on every poll and never opens the
// device until the first granted poll. Hosts without a capture device stay
// running but silent.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::source::SignalSource;
use crate::config::{Permissions, SignalsConfig, PERM_MICROPHONE};
use crate::events::{EventDraft, EventType, SourceType};

const SAMPLE_RATE: u32 = 44100;
const CHUNK_SAMPLES: usize = 1024;
/// Peaks waiting to be drained by the poll loop
const PEAK_QUEUE_CAPACITY: usize = 64;

/// Narrow contract over the platform audio capture interface
pub trait AudioProbe: Send + 'static {
    /// Freshest normalized (0-1) RMS peak observed since the last call.
    /// `None` when no device is available or nothing was captured yet.
    fn latest_peak(&mut self) -> Option<f64>;
}

/// Normalized RMS of one chunk of signed 16-bit little-endian mono samples.
fn rms_of_chunk(data: &[u8]) -> f64 {
    let mut sum_squares = 0.0f64;
    let mut count = 0usize;
    for pair in data.chunks_exact(2) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]) as f64;
        sum_squares += sample * sample;
        count += 1;
    }
    if count == 0 {
        return 0.0;
    }
    (sum_squares / count as f64).sqrt() / 32768.0
}

/// Captures raw PCM from `arecord` on a dedicated thread. Like the other
/// subprocess probes, a missing binary or device just means the probe
/// reports nothing.
pub struct ArecordAudioProbe {
    rx: Option<Receiver<f64>>,
    started: bool,
}

impl ArecordAudioProbe {
    pub fn new() -> Self {
        Self {
            rx: None,
            started: false,
        }
    }

    fn start_capture(&mut self) {
        self.started = true;
        let child = Command::new("arecord")
            .args(["-q", "-f", "S16_LE", "-c", "1", "-t", "raw"])
            .arg("-r")
            .arg(SAMPLE_RATE.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(err) => {
                tracing::warn!(error = %err, "audio capture unavailable (arecord missing?)");
                return;
            }
        };
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            return;
        };

        let (tx, rx) = std::sync::mpsc::sync_channel(PEAK_QUEUE_CAPACITY);
        self.rx = Some(rx);
        std::thread::spawn(move || capture_loop(child, stdout, tx));
    }
}

impl Default for ArecordAudioProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads fixed-size chunks, pushes their RMS onto the queue, and exits
/// (killing the child) once the probe side hangs up.
fn capture_loop(mut child: Child, mut stdout: std::process::ChildStdout, tx: SyncSender<f64>) {
    let mut chunk = vec![0u8; CHUNK_SAMPLES * 2];
    loop {
        if let Err(err) = stdout.read_exact(&mut chunk) {
            tracing::warn!(error = %err, "audio capture stream ended");
            break;
        }
        match tx.try_send(rms_of_chunk(&chunk)) {
            Ok(()) => {}
            // A slow poll loop just misses this chunk's peak
            Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => break,
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

impl AudioProbe for ArecordAudioProbe {
    fn latest_peak(&mut self) -> Option<f64> {
        if !self.started {
            self.start_capture();
        }
        let rx = self.rx.as_ref()?;
        let mut latest = None;
        while let Ok(peak) = rx.try_recv() {
            latest = Some(peak);
        }
        latest
    }
}

pub struct MicrophoneSource {
    name: String,
    poll_interval: Duration,
    threshold: f64,
    permissions: Permissions,
    probe: Box<dyn AudioProbe>,
    last_value: Value,
}

impl MicrophoneSource {
    pub fn new(config: &SignalsConfig, permissions: Permissions, probe: Box<dyn AudioProbe>) -> Self {
        Self {
            name: "microphone_monitor".to_string(),
            poll_interval: Duration::from_secs_f64(config.microphone_poll_interval),
            threshold: config.microphone_threshold,
            permissions,
            probe,
            last_value: Value::Null,
        }
    }

    pub fn with_default_probe(config: &SignalsConfig, permissions: Permissions) -> Self {
        Self::new(config, permissions, Box::new(ArecordAudioProbe::new()))
    }

    fn evaluate(&mut self, peak: f64) -> Option<EventDraft> {
        let peak_level = (peak * 1000.0).round() / 1000.0;
        self.last_value = json!({
            "peak_level": peak_level,
            "threshold_exceeded": peak >= self.threshold,
        });

        // Quiet audio is the steady state, not a change worth routing
        if peak < self.threshold {
            return None;
        }

        let mut data = Map::new();
        data.insert("peak_level".to_string(), json!(peak_level));
        data.insert("threshold".to_string(), json!(self.threshold));

        Some(EventDraft {
            event_type: EventType::ThresholdCrossed,
            data,
            metadata: Map::from_iter([
                ("sample_rate".to_string(), json!(SAMPLE_RATE)),
                ("chunk_size".to_string(), json!(CHUNK_SAMPLES)),
            ]),
        })
    }
}

#[async_trait]
impl SignalSource for MicrophoneSource {
    fn source_type(&self) -> SourceType {
        SourceType::Microphone
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn poll(&mut self) -> Option<EventDraft> {
        if !self.permissions.granted(PERM_MICROPHONE) {
            return None;
        }
        let peak = self.probe.latest_peak()?;
        self.evaluate(peak)
    }

    fn current_values(&self) -> Value {
        self.last_value.clone()
    }

    fn config_schema(&self) -> Value {
        json!({
            "poll_interval": {"type": "number", "description": "Polling interval in seconds", "default": 0.1},
            "threshold": {"type": "number", "description": "Peak level threshold (0-1) to trigger events", "default": 0.5},
            "enabled": {"type": "boolean", "description": "Requires the microphone permission", "default": false},
        })
    }
}
