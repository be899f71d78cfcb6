pub mod buffer;
#[cfg(feature = "capture")]
pub mod capture;
#[cfg(feature = "capture")]
pub mod device;
pub mod file;
pub mod source_trait;

pub use buffer::BufferSource;
#[cfg(feature = "capture")]
pub use capture::CaptureSource;
#[cfg(feature = "capture")]
pub use device::DeviceManager;
pub use file::FileSource;
pub use source_trait::{AudioSource, ChunkRead};
