//! The audible channel: artifact cache, generator and player subprocess
//! lifecycle, priority preemption, and audio-device recovery.

pub mod cache;
pub mod engine;
pub mod recovery;

pub use cache::{ArtifactCache, ArtifactKey};
pub use engine::{SpeechEngine, SpeechEngineConfig};
pub use recovery::{AudioHealth, RecoveryPolicy};
