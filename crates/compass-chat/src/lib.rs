//! Server-side conversation pipeline for Compass.
//!
//! Gathers signals about the user, composes the instruction stack, streams
//! the model's reply and extracts the side-channel tags it contains.

pub mod classifier;
pub mod composer;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod profile;
pub mod prompts;
pub mod providers;
pub mod signals;

pub use classifier::{DomainClassifier, DomainSignal};
pub use composer::{compose, ComposedPrompt, PromptBlock, PromptSlot};
pub use error::{ChatError, ModelError};
pub use llm::{
    backend_from_config, ChunkReceiver, ModelBackend, ModelChunk, ModelMessage, ModelRequest,
    OpenAiCompatBackend, ScriptedBackend,
};
pub use pipeline::{ChatPipeline, PipelineState};
pub use profile::{parse_profile, ProfileParse};
pub use prompts::PromptLibrary;
pub use providers::SignalProviders;
pub use signals::{
    fetch_bounded, DiscoveryContext, SignalProvider, SignalRequest, SignalSet, UserContext,
};
