// Pancake Music Box - native playback engine
// Module declarations
pub mod audio;
pub mod commands;
pub mod dsp;
pub mod error;
pub mod settings;
pub mod state;

pub use audio::{
    AudioBackend, AudioPlayer, CpalBackend, EngineEvent, NullBackend, PlayerState, TrackInfo,
};
pub use commands::PlayerBridge;
pub use error::{EngineError, EngineResult};
pub use settings::{BufferSettings, DeviceProfile, EngineSettings};
pub use state::{OutputConfig, OutputFormat};
