// CPU/RAM signal source
//
// Samples processor and memory utilization through sysinfo. Emits only
// when a metric moved by at least the configured step since the last
// emitted value, or when it crossed its threshold band.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use sysinfo::System;

use super::source::{SignalSource, ThresholdTracker};
use crate::config::SignalsConfig;
use crate::events::{EventDraft, EventType, SourceType};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

pub struct CpuSource {
    name: String,
    system: System,
    poll_interval: Duration,
    change_step: f64,
    thresholds: ThresholdTracker,
    last_cpu: Option<f64>,
    last_ram: Option<f64>,
    last_value: Value,
}

impl CpuSource {
    pub fn new(config: &SignalsConfig) -> Self {
        let mut thresholds = ThresholdTracker::new();
        thresholds.set_threshold("cpu", config.cpu_low_threshold, config.cpu_high_threshold);
        thresholds.set_threshold("ram", 0.0, config.ram_high_threshold);

        Self {
            name: "cpu_ram_monitor".to_string(),
            system: System::new(),
            poll_interval: Duration::from_secs_f64(config.cpu_poll_interval),
            change_step: config.cpu_change_step,
            thresholds,
            last_cpu: None,
            last_ram: None,
            last_value: Value::Null,
        }
    }

    /// Change detection over one sample pair. Separated from `poll` so the
    /// logic can be driven with synthetic values in tests.
    fn evaluate(
        &mut self,
        cpu_percent: f64,
        ram_percent: f64,
        ram_used_gb: f64,
        ram_total_gb: f64,
    ) -> Option<EventDraft> {
        let mut changes: Vec<Value> = Vec::new();

        let cpu_moved = self
            .last_cpu
            .map_or(true, |last| (cpu_percent - last).abs() >= self.change_step);
        if cpu_moved {
            let crossing = self.thresholds.check("cpu", cpu_percent);
            changes.push(json!({
                "metric": "cpu",
                "value": cpu_percent,
                "previous": self.last_cpu,
                "threshold_state": crossing.map(|s| s.as_str()),
            }));
            self.last_cpu = Some(cpu_percent);
        }

        let ram_moved = self
            .last_ram
            .map_or(true, |last| (ram_percent - last).abs() >= self.change_step);
        if ram_moved {
            let crossing = self.thresholds.check("ram", ram_percent);
            changes.push(json!({
                "metric": "ram",
                "value": ram_percent,
                "previous": self.last_ram,
                "threshold_state": crossing.map(|s| s.as_str()),
                "used_gb": ram_used_gb,
                "total_gb": ram_total_gb,
            }));
            self.last_ram = Some(ram_percent);
        }

        self.last_value = json!({
            "cpu_percent": cpu_percent,
            "ram_percent": ram_percent,
            "ram_used_gb": ram_used_gb,
            "ram_total_gb": ram_total_gb,
        });

        if changes.is_empty() {
            return None;
        }

        let crossed = changes
            .iter()
            .any(|c| !c["threshold_state"].is_null());
        let event_type = if crossed {
            EventType::ThresholdCrossed
        } else {
            EventType::ValueChanged
        };

        let mut data = Map::new();
        data.insert("cpu_percent".to_string(), json!(cpu_percent));
        data.insert("ram_percent".to_string(), json!(ram_percent));
        data.insert("ram_used_gb".to_string(), json!(ram_used_gb));
        data.insert("ram_total_gb".to_string(), json!(ram_total_gb));
        data.insert("changes".to_string(), Value::Array(changes));

        Some(EventDraft {
            event_type,
            data,
            metadata: Map::from_iter([(
                "cpu_count".to_string(),
                json!(self.system.cpus().len()),
            )]),
        })
    }

    fn round2(v: f64) -> f64 {
        (v * 100.0).round() / 100.0
    }
}

#[async_trait]
impl SignalSource for CpuSource {
    fn source_type(&self) -> SourceType {
        SourceType::Cpu
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn poll(&mut self) -> Option<EventDraft> {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let cpu_percent = Self::round2(self.system.global_cpu_usage() as f64);
        let total = self.system.total_memory();
        let used = self.system.used_memory();
        let ram_percent = if total == 0 {
            0.0
        } else {
            Self::round2(used as f64 / total as f64 * 100.0)
        };

        self.evaluate(
            cpu_percent,
            ram_percent,
            Self::round2(used as f64 / GIB),
            Self::round2(total as f64 / GIB),
        )
    }

    fn current_values(&self) -> Value {
        self.last_value.clone()
    }

    fn config_schema(&self) -> Value {
        json!({
            "poll_interval": {"type": "number", "description": "Polling interval in seconds", "default": 2.0},
            "cpu_low_threshold": {"type": "number", "description": "CPU low usage threshold (%)", "default": 20},
            "cpu_high_threshold": {"type": "number", "description": "CPU high usage threshold (%)", "default": 80},
            "ram_high_threshold": {"type": "number", "description": "RAM high usage threshold (%)", "default": 85},
            "cpu_change_step": {"type": "number", "description": "Minimum change to trigger event (%)", "default": 5},
        })
    }
}
