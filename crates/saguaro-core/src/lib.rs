pub mod agent;
pub mod kernel;
pub mod senses;
pub mod session;
pub mod tools;

#[cfg(test)]
pub(crate) mod testing;

// Re-export key types
pub use agent::{Agent, ContextItem, MemoryStore, ModelFactory, ProviderFactory, Runner};
pub use kernel::{Kernel, KernelError, LoopOutcome, LoopReport};
pub use senses::{stdin_lines, FileSnapshotSensor};
pub use session::{InMemorySessionService, Session, SessionService, SessionState};
pub use tools::ToolRegistry;
