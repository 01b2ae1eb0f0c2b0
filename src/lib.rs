//! Timeline Conductor
//!
//! Drives broadcast devices from a declarative timeline: the timeline is
//! resolved into per-device states at the right future instants, and each
//! device driver turns its state into the minimal set of commands, fired on
//! time by a per-device timed queue.

pub mod clock;
pub mod conductor;
pub mod config;
pub mod do_on_time;
pub mod drivers;
pub mod error;
pub mod timeline;

pub use clock::{Clock, ManualClock, SystemClock, Time};
pub use conductor::{CallbackKind, Conductor, ConductorEvent, ConductorOptions, TimelineCallback};
pub use drivers::{Device, DeviceOptions, DeviceStatus, DeviceType, StatusCode};
pub use error::{ConductorError, DeviceError, ResolverError};
pub use timeline::{Mapping, Mappings, TimelineObject, TimelineState};
