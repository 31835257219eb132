// Audio playback module
// Uses Symphonia for decoding, rubato for rate conversion and cpal for output

pub mod backend;
pub mod convert;
pub mod decoder;
pub mod events;
pub mod output;
pub mod player;
pub mod ring;
pub mod visualizer;
pub mod worker;

pub use backend::{AudioBackend, CpalBackend, NullBackend};
pub use convert::ResamplerQuality;
pub use decoder::TrackInfo;
pub use events::{EngineEvent, EventListener};
pub use player::{AudioPlayer, PlayerState};
