//! Timeline state -> Sisyfos state conversion and state diffing
//!
//! Both functions are pure: the same inputs always give the same output.

use serde_json::Value;

use super::types::{
    QueuedCommand, SisyfosApiState, SisyfosChannel, SisyfosCommand, SisyfosContent, SisyfosState,
    DEFAULT_FADER_LEVEL,
};
use crate::drivers::DeviceType;
use crate::timeline::{Mapping, Mappings, TimelineState};

/// Abstract state built from the mixer's live state.
///
/// With `is_default` every channel is reset to its idle values; otherwise the
/// live values are kept. Contributing ids always start empty.
pub fn device_state_from_api(api_state: Option<&SisyfosApiState>, is_default: bool) -> SisyfosState {
    let mut state = SisyfosState::default();
    let Some(api_state) = api_state else {
        return state;
    };

    for (index, live) in &api_state.channels {
        let channel = if is_default {
            SisyfosChannel {
                fader_level: DEFAULT_FADER_LEVEL,
                pgm_on: 0,
                pst_on: 0,
                label: String::new(),
                visible: true,
                tl_obj_ids: Vec::new(),
            }
        } else {
            SisyfosChannel {
                pgm_on: live.pgm_on,
                pst_on: live.pst_on,
                fader_level: live.fader_level,
                label: live.label.clone(),
                visible: live.visible,
                tl_obj_ids: Vec::new(),
            }
        };
        state.channels.insert(*index, channel);
    }
    state
}

/// Parse the Sisyfos content of a timeline object. No content reads as empty.
pub fn read_content(content: &Value) -> Result<SisyfosContent, serde_json::Error> {
    match content {
        Value::Null => Ok(SisyfosContent::default()),
        other => serde_json::from_value(other.clone()),
    }
}

/// One message per object in `state` whose content cannot be read.
/// Such objects are left out of the converted state.
pub fn unreadable_contents(state: &TimelineState) -> Vec<String> {
    state
        .layers
        .iter()
        .filter_map(|(layer, tl_object)| {
            read_content(&tl_object.content).err().map(|e| {
                format!(
                    "Ignoring timeline object \"{}\" on layer \"{}\": unreadable Sisyfos content ({})",
                    tl_object.id, layer, e
                )
            })
        })
        .collect()
}

/// Apply the resolved layers of `state` on top of `default_state`
pub fn convert_state_to_sisyfos_state(
    state: &TimelineState,
    mappings: &Mappings,
    device_id: &str,
    default_state: SisyfosState,
) -> SisyfosState {
    let mut device_state = default_state;

    let lookup = |layer: &str| -> Option<&Mapping> {
        mappings
            .get(layer)
            .filter(|m| m.device == DeviceType::Sisyfos && m.device_id == device_id)
    };

    for (layer_name, tl_object) in &state.layers {
        // Reported by `unreadable_contents`
        let Ok(content) = read_content(&tl_object.content) else {
            continue;
        };

        // Resync does not need a channel mapping
        if let Some(resync) = content.resync {
            device_state.resync = device_state.resync || resync;
        }

        let mut mapping = lookup(layer_name);
        // A preview object on its own layer borrows the mapping of the layer it previews
        if mapping.is_none() && tl_object.is_lookahead {
            if let Some(for_layer) = &tl_object.lookahead_for_layer {
                mapping = lookup(for_layer);
            }
        }

        let Some(channel_index) = mapping.and_then(|m| m.channel) else {
            continue;
        };
        let Some(channel) = device_state.channels.get_mut(&channel_index) else {
            continue;
        };

        if tl_object.is_lookahead {
            channel.pst_on = content.is_pgm.unwrap_or(0);
        } else {
            channel.pgm_on = content.is_pgm.unwrap_or(0);
        }

        if let Some(fader_level) = content.fader_level {
            channel.fader_level = fader_level;
        }
        if let Some(label) = content.label {
            channel.label = label;
        }
        if let Some(visible) = content.visible {
            channel.visible = visible;
        }

        channel.tl_obj_ids.push(tl_object.id.clone());
    }

    device_state
}

/// Ordered commands that take the mixer from `old` to `new`
pub fn diff_states(old: &SisyfosState, new: &SisyfosState) -> Vec<QueuedCommand> {
    let mut commands = Vec::new();

    if new.resync && !old.resync {
        commands.push(QueuedCommand {
            command: SisyfosCommand::Resync,
            context: "Resyncing with Sisyfos".to_string(),
            timeline_obj_id: String::new(),
        });
    }

    for (index, new_channel) in &new.channels {
        let Some(old_channel) = old.channels.get(index) else {
            continue;
        };
        let index = *index;
        let tl_obj_id = new_channel.tl_obj_ids.first().cloned().unwrap_or_default();
        let mut push = |command: SisyfosCommand, context: String| {
            commands.push(QueuedCommand {
                command,
                context,
                timeline_obj_id: tl_obj_id.clone(),
            });
        };

        if old_channel.pgm_on != new_channel.pgm_on {
            push(
                SisyfosCommand::TogglePgm {
                    channel: index,
                    value: new_channel.pgm_on,
                },
                format!(
                    "Channel {} pgm goes from \"{}\" to \"{}\"",
                    index, old_channel.pgm_on, new_channel.pgm_on
                ),
            );
        }

        if old_channel.pst_on != new_channel.pst_on {
            push(
                SisyfosCommand::TogglePst {
                    channel: index,
                    value: new_channel.pst_on,
                },
                format!(
                    "Channel {} pst goes from \"{}\" to \"{}\"",
                    index, old_channel.pst_on, new_channel.pst_on
                ),
            );
        }

        if old_channel.fader_level != new_channel.fader_level {
            push(
                SisyfosCommand::SetFader {
                    channel: index,
                    value: new_channel.fader_level,
                },
                format!(
                    "Channel {} faderLevel goes from \"{}\" to \"{}\"",
                    index, old_channel.fader_level, new_channel.fader_level
                ),
            );
        }

        if !new_channel.label.is_empty() && old_channel.label != new_channel.label {
            push(
                SisyfosCommand::Label {
                    channel: index,
                    value: new_channel.label.clone(),
                },
                format!(
                    "Channel {} label goes from \"{}\" to \"{}\"",
                    index, old_channel.label, new_channel.label
                ),
            );
        }

        if old_channel.visible != new_channel.visible {
            push(
                SisyfosCommand::Visible {
                    channel: index,
                    value: new_channel.visible,
                },
                format!(
                    "Channel {} Visibility goes from \"{}\" to \"{}\"",
                    index, old_channel.visible, new_channel.visible
                ),
            );
        }
    }

    commands
}

/// An empty label means "leave it": keep the previous one in the recorded state
pub fn carry_forward_labels(old: &SisyfosState, new: &mut SisyfosState) {
    for (index, channel) in new.channels.iter_mut() {
        if channel.label.is_empty() {
            if let Some(old_channel) = old.channels.get(index) {
                channel.label = old_channel.label.clone();
            }
        }
    }
}
