//! Timeline, mapping and resolved-state types
//!
//! The timeline is owned by the caller and handed to the conductor
//! wholesale. The resolver turns it into a [`TimelineState`] for one
//! instant: the active object per layer plus the upcoming change points.

pub mod resolver;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::clock::Time;
use crate::drivers::DeviceType;

pub use resolver::{LayerResolver, TimelineResolver};

/// Literal `"now"` in a start expression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NowKeyword {
    Now,
}

/// Start of an enable window: absolute milliseconds or "now"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum StartTime {
    At(Time),
    Now(NowKeyword),
}

impl StartTime {
    pub fn now() -> Self {
        StartTime::Now(NowKeyword::Now)
    }

    pub fn is_now(&self) -> bool {
        matches!(self, StartTime::Now(_))
    }
}

/// When a timeline object is active
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Enable {
    pub start: StartTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
}

impl Enable {
    pub fn at(start: Time) -> Self {
        Self {
            start: StartTime::At(start),
            end: None,
            duration: None,
        }
    }

    pub fn between(start: Time, end: Time) -> Self {
        Self {
            start: StartTime::At(start),
            end: Some(end),
            duration: None,
        }
    }
}

/// A timed content item targeting a logical layer
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TimelineObject {
    pub id: String,
    pub layer: String,
    pub enable: Enable,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, rename = "isLookahead", alias = "is_lookahead")]
    pub is_lookahead: bool,
    #[serde(
        default,
        rename = "lookaheadForLayer",
        alias = "lookahead_for_layer",
        skip_serializing_if = "Option::is_none"
    )]
    pub lookahead_for_layer: Option<String>,
    /// Name reported through a timeline callback when the object starts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
    /// Name reported through a timeline callback when the object stops
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_stopped: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_data: Option<Value>,
}

impl TimelineObject {
    pub fn new(id: impl Into<String>, layer: impl Into<String>, enable: Enable, content: Value) -> Self {
        Self {
            id: id.into(),
            layer: layer.into(),
            enable,
            content,
            priority: 0,
            is_lookahead: false,
            lookahead_for_layer: None,
            callback: None,
            callback_stopped: None,
            callback_data: None,
        }
    }

    /// Mark this object as a lookahead (preview) entry for another layer
    pub fn lookahead_for(mut self, layer: impl Into<String>) -> Self {
        self.is_lookahead = true;
        self.lookahead_for_layer = Some(layer.into());
        self
    }
}

/// Device addressing for one layer
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Mapping {
    pub device: DeviceType,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u32>,
    /// Family-specific addressing fields not modelled above
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Mapping {
    pub fn sisyfos(device_id: impl Into<String>, channel: u32) -> Self {
        Self {
            device: DeviceType::Sisyfos,
            device_id: device_id.into(),
            channel: Some(channel),
            extra: BTreeMap::new(),
        }
    }
}

/// Layer name -> device addressing
pub type Mappings = HashMap<String, Mapping>;

/// Active window of one resolved object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub start: Time,
    pub end: Option<Time>,
}

/// A timeline object as it is active at the resolved instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedObjectInstance {
    pub id: String,
    pub layer: String,
    pub content: Value,
    pub instance: Instance,
    pub is_lookahead: bool,
    pub lookahead_for_layer: Option<String>,
    pub callback: Option<String>,
    pub callback_stopped: Option<String>,
    pub callback_data: Option<Value>,
}

/// Kind of an upcoming change point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NextEventKind {
    Start,
    End,
}

/// A future instant at which the resolved state changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextEvent {
    pub time: Time,
    pub object_id: String,
    pub kind: NextEventKind,
}

/// Resolved timeline at one instant
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TimelineState {
    pub time: Time,
    pub layers: BTreeMap<String, ResolvedObjectInstance>,
    /// Upcoming change points, ascending
    pub next_events: Vec<NextEvent>,
}

impl TimelineState {
    /// Earliest change point strictly after `time`
    pub fn next_change_after(&self, time: Time) -> Option<Time> {
        self.next_events.iter().map(|e| e.time).filter(|t| *t > time).min()
    }

    /// Slice of this state whose layers are addressed to `device_id`
    ///
    /// Lookahead layers without a mapping of their own follow the mapping of
    /// the layer they are lookahead for.
    pub fn filter_for_device(&self, mappings: &Mappings, device_id: &str) -> TimelineState {
        let targets_device = |layer: &str| {
            mappings
                .get(layer)
                .map(|m| m.device_id == device_id)
        };

        let layers = self
            .layers
            .iter()
            .filter(|(layer, obj)| match targets_device(layer.as_str()) {
                Some(hit) => hit,
                None => obj.is_lookahead
                    && obj
                        .lookahead_for_layer
                        .as_deref()
                        .and_then(|l| targets_device(l))
                        .unwrap_or(false),
            })
            .map(|(layer, obj)| (layer.clone(), obj.clone()))
            .collect();

        TimelineState {
            time: self.time,
            layers,
            next_events: self.next_events.clone(),
        }
    }
}

/// A `"now"` start that was fixed to an absolute time during a resolve
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerTime {
    pub id: String,
    pub time: Time,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolved(id: &str, layer: &str) -> ResolvedObjectInstance {
        ResolvedObjectInstance {
            id: id.to_string(),
            layer: layer.to_string(),
            content: json!({}),
            instance: Instance { start: 0, end: None },
            is_lookahead: false,
            lookahead_for_layer: None,
            callback: None,
            callback_stopped: None,
            callback_data: None,
        }
    }

    #[test]
    fn test_start_time_parses_now_and_number() {
        let enable: Enable = serde_json::from_value(json!({ "start": "now" })).unwrap();
        assert!(enable.start.is_now());

        let enable: Enable = serde_json::from_value(json!({ "start": 1500, "end": 2000 })).unwrap();
        assert_eq!(enable.start, StartTime::At(1500));
        assert_eq!(enable.end, Some(2000));
    }

    #[test]
    fn test_timeline_object_yaml() {
        let yaml = r#"
id: obj0
layer: host_mic
enable: { start: now }
content: { isPgm: 1 }
isLookahead: true
lookaheadForLayer: guest_mic
"#;
        let obj: TimelineObject = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(obj.id, "obj0");
        assert!(obj.is_lookahead);
        assert_eq!(obj.lookahead_for_layer.as_deref(), Some("guest_mic"));
        assert_eq!(obj.content["isPgm"], 1);
    }

    #[test]
    fn test_filter_for_device() {
        let mut mappings = Mappings::new();
        mappings.insert("a".to_string(), Mapping::sisyfos("mixer1", 1));
        mappings.insert("b".to_string(), Mapping::sisyfos("mixer2", 1));

        let mut state = TimelineState::default();
        state.layers.insert("a".to_string(), resolved("o1", "a"));
        state.layers.insert("b".to_string(), resolved("o2", "b"));
        let mut lookahead = resolved("o3", "a_lookahead");
        lookahead.is_lookahead = true;
        lookahead.lookahead_for_layer = Some("a".to_string());
        state.layers.insert("a_lookahead".to_string(), lookahead);
        state.layers.insert("unmapped".to_string(), resolved("o4", "unmapped"));

        let sub = state.filter_for_device(&mappings, "mixer1");
        let layers: Vec<_> = sub.layers.keys().cloned().collect();
        assert_eq!(layers, vec!["a".to_string(), "a_lookahead".to_string()]);
    }

    #[test]
    fn test_next_change_after() {
        let state = TimelineState {
            time: 100,
            layers: BTreeMap::new(),
            next_events: vec![
                NextEvent { time: 100, object_id: "a".into(), kind: NextEventKind::Start },
                NextEvent { time: 300, object_id: "b".into(), kind: NextEventKind::End },
                NextEvent { time: 200, object_id: "c".into(), kind: NextEventKind::Start },
            ],
        };
        assert_eq!(state.next_change_after(100), Some(200));
        assert_eq!(state.next_change_after(300), None);
    }
}
