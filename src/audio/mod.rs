//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod playback;
pub mod scheduler;

pub use buffer::{AudioFrame, FrameAssembler};
pub use capture::{AudioCaptureSource, CaptureDevice, CpalCapture, FrameStream};
pub use device::{list_devices, DeviceInfo};
pub use playback::{CpalOutput, EndedHook, OutputDevice, VoiceId};
pub use scheduler::PlaybackScheduler;
