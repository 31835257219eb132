pub mod settings;

pub use settings::{BufferSettings, DeviceProfile, EngineSettings};
