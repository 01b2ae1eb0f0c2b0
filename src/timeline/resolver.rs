//! Timeline resolution
//!
//! The conductor only depends on [`TimelineResolver`]. [`LayerResolver`] is a
//! window-based implementation: an object is active while
//! `start <= t < end`, and the latest start wins a layer.

use std::collections::{BTreeMap, HashSet};

use super::{
    Instance, NextEvent, NextEventKind, ResolvedObjectInstance, StartTime, TimelineObject,
    TimelineState,
};
use crate::clock::Time;
use crate::error::ResolverError;

/// Computes which timeline objects are active at a given instant
pub trait TimelineResolver: Send + Sync {
    /// Resolve `timeline` at `time`.
    ///
    /// `"now"` starts are expected to be fixed by the caller before this is
    /// called; any left over are treated as starting at `time`.
    fn resolve_state(
        &self,
        timeline: &[TimelineObject],
        time: Time,
    ) -> Result<TimelineState, ResolverError>;
}

/// Window-based resolver, one winner per layer
#[derive(Debug, Default, Clone, Copy)]
pub struct LayerResolver;

impl LayerResolver {
    pub fn new() -> Self {
        Self
    }

    fn instance_of(obj: &TimelineObject, time: Time) -> Result<Instance, ResolverError> {
        let start = match obj.enable.start {
            StartTime::At(t) => t,
            StartTime::Now(_) => time,
        };

        let end = match (obj.enable.end, obj.enable.duration) {
            (Some(end), _) => Some(end),
            (None, Some(duration)) if duration < 0 => {
                return Err(ResolverError::NegativeDuration {
                    id: obj.id.clone(),
                    duration,
                })
            }
            (None, Some(duration)) => Some(start + duration),
            (None, None) => None,
        };

        if let Some(end) = end {
            if end < start {
                return Err(ResolverError::EndBeforeStart {
                    id: obj.id.clone(),
                    start,
                    end,
                });
            }
        }

        Ok(Instance { start, end })
    }
}

impl TimelineResolver for LayerResolver {
    fn resolve_state(
        &self,
        timeline: &[TimelineObject],
        time: Time,
    ) -> Result<TimelineState, ResolverError> {
        let mut seen = HashSet::new();
        // layer -> (start, priority, position, object, instance)
        let mut winners: BTreeMap<&str, (Time, i32, usize, &TimelineObject, Instance)> =
            BTreeMap::new();
        let mut next_events = Vec::new();

        for (position, obj) in timeline.iter().enumerate() {
            if !seen.insert(obj.id.as_str()) {
                return Err(ResolverError::DuplicateId(obj.id.clone()));
            }
            if obj.layer.is_empty() {
                return Err(ResolverError::EmptyLayer(obj.id.clone()));
            }

            let instance = Self::instance_of(obj, time)?;

            if instance.start > time {
                next_events.push(NextEvent {
                    time: instance.start,
                    object_id: obj.id.clone(),
                    kind: NextEventKind::Start,
                });
            }
            if let Some(end) = instance.end {
                if end > time {
                    next_events.push(NextEvent {
                        time: end,
                        object_id: obj.id.clone(),
                        kind: NextEventKind::End,
                    });
                }
            }

            let active = instance.start <= time && instance.end.map_or(true, |end| time < end);
            if !active {
                continue;
            }

            let candidate = (instance.start, obj.priority, position);
            let replace = match winners.get(obj.layer.as_str()) {
                Some((start, priority, pos, _, _)) => candidate >= (*start, *priority, *pos),
                None => true,
            };
            if replace {
                winners.insert(
                    obj.layer.as_str(),
                    (instance.start, obj.priority, position, obj, instance),
                );
            }
        }

        next_events.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.object_id.cmp(&b.object_id)));

        let layers = winners
            .into_iter()
            .map(|(layer, (_, _, _, obj, instance))| {
                (
                    layer.to_string(),
                    ResolvedObjectInstance {
                        id: obj.id.clone(),
                        layer: obj.layer.clone(),
                        content: obj.content.clone(),
                        instance,
                        is_lookahead: obj.is_lookahead,
                        lookahead_for_layer: obj.lookahead_for_layer.clone(),
                        callback: obj.callback.clone(),
                        callback_stopped: obj.callback_stopped.clone(),
                        callback_data: obj.callback_data.clone(),
                    },
                )
            })
            .collect();

        Ok(TimelineState {
            time,
            layers,
            next_events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::Enable;
    use serde_json::json;

    fn obj(id: &str, layer: &str, enable: Enable) -> TimelineObject {
        TimelineObject::new(id, layer, enable, json!({ "isPgm": 1 }))
    }

    #[test]
    fn test_active_window() {
        let timeline = vec![obj("a", "l1", Enable::between(1000, 2000))];
        let resolver = LayerResolver::new();

        assert!(resolver.resolve_state(&timeline, 999).unwrap().layers.is_empty());
        assert_eq!(resolver.resolve_state(&timeline, 1000).unwrap().layers["l1"].id, "a");
        assert_eq!(resolver.resolve_state(&timeline, 1999).unwrap().layers["l1"].id, "a");
        assert!(resolver.resolve_state(&timeline, 2000).unwrap().layers.is_empty());
    }

    #[test]
    fn test_latest_start_wins_layer() {
        let mut high = obj("c", "l1", Enable::at(500));
        high.priority = 5;
        let timeline = vec![
            obj("a", "l1", Enable::at(0)),
            obj("b", "l1", Enable::at(500)),
            high,
            obj("d", "l1", Enable::at(500)),
        ];
        let state = LayerResolver::new().resolve_state(&timeline, 600).unwrap();
        // Same start: higher priority beats later position
        assert_eq!(state.layers["l1"].id, "c");
    }

    #[test]
    fn test_next_events_sorted() {
        let mut timed = obj("b", "l2", Enable::at(3000));
        timed.enable.duration = Some(1000);
        let timeline = vec![obj("a", "l1", Enable::between(0, 2000)), timed];
        let state = LayerResolver::new().resolve_state(&timeline, 1000).unwrap();

        let times: Vec<_> = state.next_events.iter().map(|e| e.time).collect();
        assert_eq!(times, vec![2000, 3000, 4000]);
        assert_eq!(state.next_change_after(1000), Some(2000));
    }

    #[test]
    fn test_now_start_treated_as_resolve_time() {
        let timeline = vec![obj("a", "l1", Enable {
            start: StartTime::now(),
            end: None,
            duration: Some(100),
        })];
        let state = LayerResolver::new().resolve_state(&timeline, 5000).unwrap();
        assert_eq!(state.layers["l1"].instance, Instance { start: 5000, end: Some(5100) });
    }

    #[test]
    fn test_invalid_input_errors() {
        let resolver = LayerResolver::new();

        let dup = vec![obj("a", "l1", Enable::at(0)), obj("a", "l2", Enable::at(0))];
        assert_eq!(
            resolver.resolve_state(&dup, 0),
            Err(ResolverError::DuplicateId("a".into()))
        );

        let empty_layer = vec![obj("a", "", Enable::at(0))];
        assert!(matches!(
            resolver.resolve_state(&empty_layer, 0),
            Err(ResolverError::EmptyLayer(_))
        ));

        let backwards = vec![obj("a", "l1", Enable::between(100, 50))];
        assert!(matches!(
            resolver.resolve_state(&backwards, 0),
            Err(ResolverError::EndBeforeStart { .. })
        ));
    }
}
