// Battery signal source
//
// Emits on a level change of at least one percent, a plugged/unplugged
// transition, or a threshold crossing. The platform probe is a trait so
// hosts without a battery (or tests) can supply their own; the default
// reads the Linux sysfs power-supply interface.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::source::{SignalSource, ThresholdTracker};
use crate::config::SignalsConfig;
use crate::events::{EventDraft, EventType, SourceType};

/// One battery observation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryReading {
    pub percent: f64,
    pub plugged: bool,
}

/// Narrow contract over the platform battery interface
pub trait BatteryProbe: Send + 'static {
    /// `None` when no battery is present or the read failed.
    fn read(&mut self) -> Option<BatteryReading>;
}

/// Reads `/sys/class/power_supply/BAT*` on Linux. Reports `None` elsewhere,
/// which leaves the source running but silent.
pub struct SysfsBatteryProbe {
    battery_dir: Option<PathBuf>,
}

impl SysfsBatteryProbe {
    pub fn new() -> Self {
        Self {
            battery_dir: Self::find_battery(Path::new("/sys/class/power_supply")),
        }
    }

    fn find_battery(base: &Path) -> Option<PathBuf> {
        let entries = std::fs::read_dir(base).ok()?;
        for entry in entries.flatten() {
            let path = entry.path();
            // Battery supplies expose a capacity file; AC adapters do not
            if path.join("capacity").exists() {
                return Some(path);
            }
        }
        None
    }
}

impl Default for SysfsBatteryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl BatteryProbe for SysfsBatteryProbe {
    fn read(&mut self) -> Option<BatteryReading> {
        let dir = self.battery_dir.as_ref()?;
        let percent: f64 = std::fs::read_to_string(dir.join("capacity"))
            .ok()?
            .trim()
            .parse()
            .ok()?;
        let status = std::fs::read_to_string(dir.join("status")).ok()?;
        let plugged = !status.trim().eq_ignore_ascii_case("discharging");
        Some(BatteryReading { percent, plugged })
    }
}

pub struct BatterySource {
    name: String,
    probe: Box<dyn BatteryProbe>,
    poll_interval: Duration,
    thresholds: ThresholdTracker,
    last_percent: Option<f64>,
    last_plugged: Option<bool>,
    last_value: Value,
}

impl BatterySource {
    pub fn new(config: &SignalsConfig, probe: Box<dyn BatteryProbe>) -> Self {
        let mut thresholds = ThresholdTracker::new();
        // High end unused for battery; 100 can never be exceeded upward
        thresholds.set_threshold("battery", config.battery_critical_threshold, 101.0);

        Self {
            name: "battery_monitor".to_string(),
            probe,
            poll_interval: Duration::from_secs_f64(config.battery_poll_interval),
            thresholds,
            last_percent: None,
            last_plugged: None,
            last_value: json!({"battery_available": false}),
        }
    }

    pub fn with_default_probe(config: &SignalsConfig) -> Self {
        Self::new(config, Box::new(SysfsBatteryProbe::new()))
    }

    fn evaluate(&mut self, reading: BatteryReading) -> Option<EventDraft> {
        let BatteryReading { percent, plugged } = reading;
        let mut changes: Vec<Value> = Vec::new();
        let mut event_type = EventType::ValueChanged;

        if let Some(last_plugged) = self.last_plugged {
            if plugged != last_plugged {
                changes.push(json!({
                    "type": "charging_state",
                    "previous": if last_plugged { "plugged" } else { "unplugged" },
                    "current": if plugged { "plugged" } else { "unplugged" },
                }));
                event_type = EventType::StateChanged;
            }
        }

        let level_moved = self
            .last_percent
            .map_or(true, |last| (percent - last).abs() >= 1.0);
        if level_moved {
            let crossing = self.thresholds.check("battery", percent);
            changes.push(json!({
                "type": "level",
                "previous": self.last_percent,
                "current": percent,
                "threshold_state": crossing.map(|s| s.as_str()),
            }));
            if crossing.is_some() {
                event_type = EventType::ThresholdCrossed;
            }
        }

        self.last_percent = Some(percent);
        self.last_plugged = Some(plugged);
        self.last_value = json!({
            "battery_available": true,
            "percent": percent,
            "plugged": plugged,
        });

        if changes.is_empty() {
            return None;
        }

        let mut data = Map::new();
        data.insert("percent".to_string(), json!(percent));
        data.insert("plugged".to_string(), json!(plugged));
        data.insert("changes".to_string(), Value::Array(changes));

        Some(EventDraft {
            event_type,
            data,
            metadata: Map::from_iter([("battery_available".to_string(), json!(true))]),
        })
    }
}

#[async_trait]
impl SignalSource for BatterySource {
    fn source_type(&self) -> SourceType {
        SourceType::Battery
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn poll(&mut self) -> Option<EventDraft> {
        let reading = self.probe.read()?;
        self.evaluate(reading)
    }

    fn current_values(&self) -> Value {
        self.last_value.clone()
    }

    fn config_schema(&self) -> Value {
        json!({
            "poll_interval": {"type": "number", "description": "Polling interval in seconds", "default": 10.0},
            "critical_threshold": {"type": "number", "description": "Critical battery threshold (%)", "default": 10},
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(Option<BatteryReading>);

    impl BatteryProbe for FixedProbe {
        fn read(&mut self) -> Option<BatteryReading> {
            self.0
        }
    }

    fn source() -> BatterySource {
        BatterySource::new(
            &SignalsConfig::default(),
            Box::new(FixedProbe(None)),
        )
    }

    fn reading(percent: f64, plugged: bool) -> BatteryReading {
        BatteryReading { percent, plugged }
    }

    #[test]
    fn test_plug_transition_is_state_changed() {
        let mut src = source();
        let _ = src.evaluate(reading(50.0, false));
        let e = src.evaluate(reading(50.0, true)).expect("plug flip");
        assert_eq!(e.event_type, EventType::StateChanged);
        let changes = e.data["changes"].as_array().unwrap();
        assert_eq!(changes[0]["type"], json!("charging_state"));
        assert_eq!(changes[0]["current"], json!("plugged"));
    }

    #[test]
    fn test_sub_percent_drift_is_silent() {
        let mut src = source();
        let _ = src.evaluate(reading(50.0, false));
        assert!(src.evaluate(reading(50.4, false)).is_none());
        assert!(src.evaluate(reading(49.6, false)).is_none());
    }

    #[test]
    fn test_critical_crossing() {
        let mut src = source();
        let _ = src.evaluate(reading(50.0, false));
        let e = src.evaluate(reading(9.0, false)).expect("crossing");
        assert_eq!(e.event_type, EventType::ThresholdCrossed);
    }

    #[test]
    fn test_threshold_beats_plug_flip_for_event_type() {
        let mut src = source();
        let _ = src.evaluate(reading(50.0, true));
        // Both a plug flip and a critical crossing in one poll
        let e = src.evaluate(reading(5.0, false)).expect("change");
        assert_eq!(e.event_type, EventType::ThresholdCrossed);
        assert_eq!(e.data["changes"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_no_battery_means_no_events() {
        let mut src = BatterySource::new(
            &SignalsConfig::default(),
            Box::new(FixedProbe(None)),
        );
        assert!(src.poll().await.is_none());
        assert_eq!(src.current_values()["battery_available"], json!(false));
    }
}
