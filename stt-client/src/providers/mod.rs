//! Concrete transcription providers.

mod mock;
mod openai;

pub use mock::{MockProvider, scripted_transcription};
pub use openai::OpenAiProvider;
