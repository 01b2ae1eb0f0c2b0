//! Sisyfos audio mixer

pub mod api;
pub mod device;
pub mod diff;
pub mod simulator;
pub mod types;

pub use api::{SisyfosApi, SisyfosApiEvent};
pub use device::SisyfosDevice;
pub use simulator::SimulatedSisyfos;
pub use types::{
    CommandReceiver, QueuedCommand, SisyfosApiChannel, SisyfosApiState, SisyfosChannel, SisyfosCommand,
    SisyfosOptions, SisyfosState,
};
