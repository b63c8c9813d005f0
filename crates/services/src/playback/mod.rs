//! Media backends and the observer that samples them.

mod backend;
mod embedded;
mod native;
mod observer;
pub mod simulated;

pub use backend::{BackendConnector, BackendEvent, BackendReading, MediaBackend, PlayerState};
pub use embedded::{EmbedCommand, EmbedMessage, EmbeddedBackend};
pub use native::{NativeBackend, NativePlayer};
pub use observer::{ObserverEvent, PlaybackObserver};
pub use simulated::{SimulatedConnector, SimulatedEmbed, SimulatedPlayer};
