pub mod markup;
pub mod mock;
pub mod ndjson;
pub mod ollama;
pub mod wire;

pub use markup::strip_reasoning_markup;
pub use mock::{MockBackend, MockReply};
pub use ollama::{OllamaClient, OllamaConfig};
