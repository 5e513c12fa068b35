pub mod agent;
pub mod error;
pub mod history;
pub mod session;
pub mod tools;

// Re-export key types
pub use agent::{Agent, ChatModel, LoopSettings, RigModel};
pub use error::{AgentError, Result};
pub use history::{ToolOutcome, Turn};
pub use session::{Session, SessionKey, SessionStore};
pub use tools::ToolRegistry;
