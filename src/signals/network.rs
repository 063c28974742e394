// Network signal source
//
// Watches connectivity (any non-loopback interface up) and the set of up
// interfaces. Emits on a connectivity flip or an interface set change;
// byte counters and computed rates ride along in the payload for
// downstream transformers.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use sysinfo::Networks;

use super::source::SignalSource;
use crate::config::SignalsConfig;
use crate::events::{EventDraft, EventType, SourceType};

/// One network observation
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSample {
    /// Names of non-loopback interfaces currently up, sorted
    pub interfaces_up: BTreeSet<String>,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

/// Narrow contract over the platform network interface tables
pub trait NetworkProbe: Send + 'static {
    fn sample(&mut self) -> NetworkSample;
}

/// sysinfo-backed probe; interface up/down state comes from sysfs on Linux
/// and falls back to "has traffic" elsewhere.
pub struct SysinfoNetworkProbe {
    networks: Networks,
}

impl SysinfoNetworkProbe {
    pub fn new() -> Self {
        Self {
            networks: Networks::new_with_refreshed_list(),
        }
    }

    fn interface_is_up(name: &str) -> bool {
        let operstate = std::path::Path::new("/sys/class/net")
            .join(name)
            .join("operstate");
        match std::fs::read_to_string(operstate) {
            Ok(state) => state.trim() == "up",
            // No sysfs: assume a listed non-loopback interface is usable
            Err(_) => true,
        }
    }
}

impl Default for SysinfoNetworkProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkProbe for SysinfoNetworkProbe {
    fn sample(&mut self) -> NetworkSample {
        self.networks.refresh(true);

        let mut interfaces_up = BTreeSet::new();
        let mut bytes_sent = 0u64;
        let mut bytes_recv = 0u64;
        for (name, data) in self.networks.iter() {
            bytes_sent += data.total_transmitted();
            bytes_recv += data.total_received();
            if name != "lo" && Self::interface_is_up(name) {
                interfaces_up.insert(name.clone());
            }
        }

        NetworkSample {
            interfaces_up,
            bytes_sent,
            bytes_recv,
        }
    }
}

pub struct NetworkSource {
    name: String,
    probe: Box<dyn NetworkProbe>,
    poll_interval: Duration,
    last_sample: Option<NetworkSample>,
    last_poll: Option<Instant>,
    last_value: Value,
}

impl NetworkSource {
    pub fn new(config: &SignalsConfig, probe: Box<dyn NetworkProbe>) -> Self {
        Self {
            name: "network_monitor".to_string(),
            probe,
            poll_interval: Duration::from_secs_f64(config.network_poll_interval),
            last_sample: None,
            last_poll: None,
            last_value: Value::Null,
        }
    }

    pub fn with_default_probe(config: &SignalsConfig) -> Self {
        Self::new(config, Box::new(SysinfoNetworkProbe::new()))
    }

    fn evaluate(&mut self, sample: NetworkSample, elapsed_secs: f64) -> Option<EventDraft> {
        let connected = !sample.interfaces_up.is_empty();
        let mut changes: Vec<Value> = Vec::new();

        let (upload_rate, download_rate) = match (&self.last_sample, elapsed_secs > 0.0) {
            (Some(last), true) => (
                sample.bytes_sent.saturating_sub(last.bytes_sent) as f64 / elapsed_secs,
                sample.bytes_recv.saturating_sub(last.bytes_recv) as f64 / elapsed_secs,
            ),
            _ => (0.0, 0.0),
        };

        if let Some(last) = &self.last_sample {
            let was_connected = !last.interfaces_up.is_empty();
            if connected != was_connected {
                changes.push(json!({
                    "type": "connectivity",
                    "previous": if was_connected { "connected" } else { "disconnected" },
                    "current": if connected { "connected" } else { "disconnected" },
                }));
            }
            if sample.interfaces_up != last.interfaces_up {
                let added: Vec<&String> =
                    sample.interfaces_up.difference(&last.interfaces_up).collect();
                let removed: Vec<&String> =
                    last.interfaces_up.difference(&sample.interfaces_up).collect();
                if !added.is_empty() || !removed.is_empty() {
                    changes.push(json!({
                        "type": "interfaces",
                        "added": added,
                        "removed": removed,
                    }));
                }
            }
        } else {
            // First observation establishes the baseline and announces it
            changes.push(json!({
                "type": "connectivity",
                "previous": Value::Null,
                "current": if connected { "connected" } else { "disconnected" },
            }));
        }

        self.last_value = json!({
            "connected": connected,
            "interfaces_up": sample.interfaces_up,
            "upload_rate_bytes": upload_rate,
            "download_rate_bytes": download_rate,
        });

        let draft = if changes.is_empty() {
            None
        } else {
            let mut data = Map::new();
            data.insert("connected".to_string(), json!(connected));
            data.insert(
                "interfaces_up".to_string(),
                json!(sample.interfaces_up.iter().collect::<Vec<_>>()),
            );
            data.insert("upload_rate_bytes".to_string(), json!(upload_rate));
            data.insert("download_rate_bytes".to_string(), json!(download_rate));
            data.insert("total_bytes_sent".to_string(), json!(sample.bytes_sent));
            data.insert("total_bytes_recv".to_string(), json!(sample.bytes_recv));
            data.insert("changes".to_string(), Value::Array(changes));
            Some(EventDraft {
                event_type: EventType::StateChanged,
                data,
                metadata: Map::new(),
            })
        };

        self.last_sample = Some(sample);
        draft
    }
}

#[async_trait]
impl SignalSource for NetworkSource {
    fn source_type(&self) -> SourceType {
        SourceType::Network
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn poll(&mut self) -> Option<EventDraft> {
        let sample = self.probe.sample();
        let elapsed = self
            .last_poll
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        self.last_poll = Some(Instant::now());
        self.evaluate(sample, elapsed)
    }

    fn current_values(&self) -> Value {
        self.last_value.clone()
    }

    fn config_schema(&self) -> Value {
        json!({
            "poll_interval": {"type": "number", "description": "Polling interval in seconds", "default": 5.0},
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ifaces: &[&str], sent: u64, recv: u64) -> NetworkSample {
        NetworkSample {
            interfaces_up: ifaces.iter().map(|s| s.to_string()).collect(),
            bytes_sent: sent,
            bytes_recv: recv,
        }
    }

    struct FakeProbe(NetworkSample);

    impl NetworkProbe for FakeProbe {
        fn sample(&mut self) -> NetworkSample {
            self.0.clone()
        }
    }

    fn source() -> NetworkSource {
        NetworkSource::new(
            &SignalsConfig::default(),
            Box::new(FakeProbe(sample(&[], 0, 0))),
        )
    }

    #[test]
    fn test_first_sample_announces_baseline() {
        let mut src = source();
        let e = src.evaluate(sample(&["eth0"], 0, 0), 0.0).expect("baseline");
        assert_eq!(e.event_type, EventType::StateChanged);
        assert_eq!(e.data["connected"], json!(true));
    }

    #[test]
    fn test_connectivity_flip() {
        let mut src = source();
        let _ = src.evaluate(sample(&["eth0"], 0, 0), 0.0);
        let e = src.evaluate(sample(&[], 0, 0), 5.0).expect("flip");
        let changes = e.data["changes"].as_array().unwrap();
        assert_eq!(changes[0]["type"], json!("connectivity"));
        assert_eq!(changes[0]["current"], json!("disconnected"));
    }

    #[test]
    fn test_interface_set_change_without_connectivity_flip() {
        let mut src = source();
        let _ = src.evaluate(sample(&["eth0"], 0, 0), 0.0);
        let e = src
            .evaluate(sample(&["eth0", "wlan0"], 0, 0), 5.0)
            .expect("iface added");
        let changes = e.data["changes"].as_array().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0]["type"], json!("interfaces"));
        assert_eq!(changes[0]["added"], json!(["wlan0"]));
    }

    #[test]
    fn test_quiet_sample_is_silent_but_rates_tracked() {
        let mut src = source();
        let _ = src.evaluate(sample(&["eth0"], 0, 0), 0.0);
        assert!(src.evaluate(sample(&["eth0"], 1000, 2000), 2.0).is_none());
        assert_eq!(src.current_values()["upload_rate_bytes"], json!(500.0));
        assert_eq!(src.current_values()["download_rate_bytes"], json!(1000.0));
    }
}
