//! Wake-word detection: stage contracts, the streaming engine, and the
//! wake listening cycle.

pub mod engine;
pub mod listen;
pub mod stages;

pub use engine::{WakePipeline, WakeWordEngine};
pub use listen::VoiceWakeOrchestrator;
pub use stages::{
    EmbeddingModel, FeatureModel, MelFeatureModel, WakeClassifier, WakeModelLoader, WakeStages,
};
