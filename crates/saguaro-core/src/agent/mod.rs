pub mod binding;
pub mod context;
pub mod memory;
pub mod runner;

pub use binding::{CompletionBackend, ModelBinding, ModelFactory, ProviderFactory};
pub use context::{ContextItem, ImageData};
pub use memory::{MemoryError, MemoryStore};
pub use runner::{Agent, Event, EventKind, GenerationSettings, RunError, RunOutcome, Runner};
