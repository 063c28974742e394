//! Signal sources - producers that watch one host subsystem each and emit
//! normalized events on salient changes
//!
//! Each source implements [`SignalSource`]; a [`SourceHandle`] runs it on
//! its own tokio task. `build_sources` constructs the standard set from
//! config. Change detection lives in the sources; platform probing sits
//! behind small probe traits so the detection logic stays testable.

mod battery;
mod clipboard;
mod cpu;
mod filesystem;
mod microphone;
mod network;
mod source;
mod window;

pub use battery::{BatteryProbe, BatteryReading, BatterySource};
pub use clipboard::ClipboardSource;
pub use cpu::CpuSource;
pub use filesystem::FilesystemSource;
pub use microphone::{AudioProbe, MicrophoneSource};
pub use network::{NetworkProbe, NetworkSample, NetworkSource};
pub use source::{
    EventSink, SignalSource, SourceHandle, SourceStatus, SubscriptionId, ThresholdState,
    ThresholdTracker,
};
pub use window::{WindowProbe, WindowSource};

use crate::config::Config;
use anyhow::Result;

/// Build the standard source set from config.
///
/// The clipboard and microphone sources are always constructed; their polls
/// are no-ops until the matching permission is granted. The filesystem
/// source is only built when watch paths are configured.
pub fn build_sources(config: &Config) -> Result<Vec<SourceHandle>> {
    let mut handles = vec![
        SourceHandle::new(Box::new(CpuSource::new(&config.signals))),
        SourceHandle::new(Box::new(BatterySource::with_default_probe(&config.signals))),
        SourceHandle::new(Box::new(NetworkSource::with_default_probe(&config.signals))),
        SourceHandle::new(Box::new(WindowSource::with_default_probe(&config.signals))),
        SourceHandle::new(Box::new(ClipboardSource::new(
            &config.signals,
            config.permissions.clone(),
        ))),
        SourceHandle::new(Box::new(MicrophoneSource::with_default_probe(
            &config.signals,
            config.permissions.clone(),
        ))),
    ];

    if !config.signals.watch_paths.is_empty() {
        handles.push(SourceHandle::new(Box::new(FilesystemSource::new(
            &config.signals,
        )?)));
    }

    Ok(handles)
}
