//! Show configuration for the conductor binary
//!
//! Handles loading, validating and hot-reloading the YAML file that lists
//! devices, layer mappings and the timeline to play.

pub mod watcher;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::fs;
use tracing::warn;

use crate::clock::Time;
use crate::conductor::{ConductorOptions, DEFAULT_LOOKAHEAD_MS, DEFAULT_RESOLVE_RETRY_MS};
use crate::drivers::DeviceOptions;
use crate::timeline::{Mappings, StartTime, TimelineObject};

pub use watcher::ConfigWatcher;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub conductor: ConductorConfig,
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceOptions>,
    #[serde(default)]
    pub mappings: Mappings,
    #[serde(default)]
    pub timeline: Vec<TimelineObject>,
}

/// Resolve loop tuning
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConductorConfig {
    #[serde(default = "default_lookahead_ms")]
    pub lookahead_ms: i64,
    #[serde(default = "default_resolve_retry_ms")]
    pub resolve_retry_ms: i64,
    /// Resync every device once it is added
    #[serde(default = "default_true")]
    pub make_ready_on_start: bool,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            lookahead_ms: default_lookahead_ms(),
            resolve_retry_ms: default_resolve_retry_ms(),
            make_ready_on_start: true,
        }
    }
}

impl ConductorConfig {
    /// Copy the tuning values onto `options`
    pub fn apply(&self, mut options: ConductorOptions) -> ConductorOptions {
        options.lookahead_ms = self.lookahead_ms;
        options.resolve_retry_ms = self.resolve_retry_ms;
        options
    }
}

/// Start times the conductor pinned for `"now"` objects, by object id
pub type PinnedStarts = BTreeMap<String, Time>;

/// Devices to tear down and bring up after a reload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceChanges {
    pub removed: Vec<String>,
    pub added: Vec<String>,
}

impl DeviceChanges {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

impl AppConfig {
    /// Load configuration from file with validation
    pub async fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: AppConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML config: {}", path))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration for correctness and consistency
    pub fn validate(&self) -> Result<()> {
        if self.conductor.lookahead_ms < 0 {
            anyhow::bail!("conductor.lookahead_ms cannot be negative");
        }
        if self.conductor.resolve_retry_ms <= 0 {
            anyhow::bail!("conductor.resolve_retry_ms must be positive");
        }

        for (device_id, options) in &self.devices {
            if device_id.is_empty() {
                anyhow::bail!("Device id cannot be empty");
            }
            match options {
                DeviceOptions::Sisyfos(sisyfos) => {
                    if sisyfos.host.is_empty() {
                        anyhow::bail!("Device '{}' host cannot be empty", device_id);
                    }
                }
            }
        }

        for (layer, mapping) in &self.mappings {
            match self.devices.get(&mapping.device_id) {
                Some(options) if options.device_type() != mapping.device => {
                    anyhow::bail!(
                        "Layer '{}' maps to {} device '{}', but that device is {}",
                        layer,
                        mapping.device,
                        mapping.device_id,
                        options.device_type()
                    );
                }
                Some(_) => {}
                // A device may be added at runtime, so this is not fatal
                None => warn!(layer = %layer, device = %mapping.device_id, "Mapping targets an unknown device"),
            }
        }

        let mut ids = HashSet::new();
        for object in &self.timeline {
            if !ids.insert(object.id.as_str()) {
                anyhow::bail!("Duplicate timeline object id '{}'", object.id);
            }
            if object.layer.is_empty() {
                anyhow::bail!("Timeline object '{}' has no layer", object.id);
            }
        }

        Ok(())
    }

    /// Devices that differ between `self` (running) and `next`
    ///
    /// A device whose options changed is listed as both removed and added.
    pub fn device_changes(&self, next: &AppConfig) -> DeviceChanges {
        let mut changes = DeviceChanges::default();

        for (device_id, options) in &self.devices {
            match next.devices.get(device_id) {
                Some(next_options) if same_options(options, next_options) => {}
                Some(_) => {
                    changes.removed.push(device_id.clone());
                    changes.added.push(device_id.clone());
                }
                None => changes.removed.push(device_id.clone()),
            }
        }
        for device_id in next.devices.keys() {
            if !self.devices.contains_key(device_id) {
                changes.added.push(device_id.clone());
            }
        }

        changes
    }

    /// Timeline to hand the conductor when `next` replaces `self`.
    ///
    /// Objects that are unchanged in `next` and still start at `"now"` keep
    /// the start already pinned for them, so a reload does not restart them.
    /// `pinned` is narrowed to the objects that kept their pin.
    pub fn timeline_after_reload(&self, next: &AppConfig, pinned: &mut PinnedStarts) -> Vec<TimelineObject> {
        let running: HashMap<&str, &TimelineObject> =
            self.timeline.iter().map(|object| (object.id.as_str(), object)).collect();

        let mut kept = PinnedStarts::new();
        let timeline = next
            .timeline
            .iter()
            .cloned()
            .map(|mut object| {
                let unchanged = running.get(object.id.as_str()).is_some_and(|old| **old == object);
                if let (true, true, Some(&time)) = (unchanged, object.enable.start.is_now(), pinned.get(&object.id)) {
                    object.enable.start = StartTime::At(time);
                    kept.insert(object.id.clone(), time);
                }
                object
            })
            .collect();

        *pinned = kept;
        timeline
    }
}

fn same_options(a: &DeviceOptions, b: &DeviceOptions) -> bool {
    match (serde_json::to_value(a), serde_json::to_value(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

// Default value functions
fn default_lookahead_ms() -> i64 { DEFAULT_LOOKAHEAD_MS }
fn default_resolve_retry_ms() -> i64 { DEFAULT_RESOLVE_RETRY_MS }
fn default_true() -> bool { true }

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::DeviceType;
    use crate::timeline::Enable;
    use tempfile::TempDir;

    const SHOW: &str = r#"
conductor:
  lookahead_ms: 2000
devices:
  mixer1: { type: sisyfos, host: 10.0.0.5, channels: 4 }
mappings:
  host_mic: { device: sisyfos, device_id: mixer1, channel: 1 }
timeline:
  - id: obj0
    layer: host_mic
    enable: { start: now }
    content: { isPgm: 1 }
  - id: obj1
    layer: host_mic
    enable: { start: 5000, duration: 1000 }
    content: { isPgm: 0, label: HOST }
"#;

    fn parse(yaml: &str) -> AppConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[tokio::test]
    async fn test_load_show_file() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("show.yaml");
        std::fs::write(&path, SHOW)?;

        let config = AppConfig::load(&path.to_string_lossy()).await?;

        assert_eq!(config.conductor.lookahead_ms, 2000);
        assert_eq!(config.conductor.resolve_retry_ms, DEFAULT_RESOLVE_RETRY_MS);
        assert!(config.conductor.make_ready_on_start);
        assert_eq!(config.devices["mixer1"].device_type(), DeviceType::Sisyfos);
        assert_eq!(config.mappings["host_mic"].channel, Some(1));
        assert!(config.timeline[0].enable.start.is_now());
        assert_eq!(config.timeline[1].enable.start, StartTime::At(5000));
        assert_eq!(config.timeline[1].enable.duration, Some(1000));
        Ok(())
    }

    #[tokio::test]
    async fn test_load_missing_file_fails() {
        let err = AppConfig::load("/definitely/not/here.yaml").await.unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = parse("{}");
        assert!(config.devices.is_empty());
        assert_eq!(config.conductor, ConductorConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_timeline_id_rejected() {
        let mut config = parse(SHOW);
        config.timeline[1].id = "obj0".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate timeline object id"));
    }

    #[test]
    fn test_unknown_mapping_device_is_tolerated() {
        let mut config = parse(SHOW);
        config.devices.clear();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_retry_rejected() {
        let mut config = parse(SHOW);
        config.conductor.resolve_retry_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reload_keeps_pinned_now_starts() {
        let running = parse(SHOW);
        let mut next = running.clone();
        let enable = Enable {
            start: StartTime::now(),
            end: None,
            duration: None,
        };
        next.timeline.push(TimelineObject::new("obj2", "host_mic", enable, serde_json::json!({})));
        let mut pinned = PinnedStarts::from([("obj0".to_string(), 1200), ("gone".to_string(), 50)]);

        let timeline = running.timeline_after_reload(&next, &mut pinned);

        assert_eq!(timeline[0].enable.start, StartTime::At(1200));
        assert_eq!(timeline[1].enable.start, StartTime::At(5000));
        assert!(timeline[2].enable.start.is_now());
        assert_eq!(pinned, PinnedStarts::from([("obj0".to_string(), 1200)]));
    }

    #[test]
    fn test_reload_repins_edited_now_object() {
        let running = parse(SHOW);
        let mut next = running.clone();
        next.timeline[0].content = serde_json::json!({ "isPgm": 0 });
        let mut pinned = PinnedStarts::from([("obj0".to_string(), 1200)]);

        let timeline = running.timeline_after_reload(&next, &mut pinned);

        assert!(timeline[0].enable.start.is_now());
        assert!(pinned.is_empty());
    }

    #[test]
    fn test_device_changes() {
        let running = parse(SHOW);
        let mut next = running.clone();
        assert!(running.device_changes(&next).is_empty());

        if let Some(DeviceOptions::Sisyfos(options)) = next.devices.get_mut("mixer1") {
            options.host = "10.0.0.6".into();
        }
        let extra: DeviceOptions = serde_yaml::from_str("type: sisyfos\nhost: 10.0.0.7\n").unwrap();
        next.devices.insert("mixer2".into(), extra);

        let changes = running.device_changes(&next);
        assert_eq!(changes.removed, vec!["mixer1".to_string()]);
        assert_eq!(changes.added, vec!["mixer1".to_string(), "mixer2".to_string()]);
    }
}
