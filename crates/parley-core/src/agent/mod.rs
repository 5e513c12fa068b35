pub mod r#loop;
pub mod model;
pub mod rig_model;
pub mod service;
pub mod transcript;

pub use model::{ChatModel, ModelError, ModelReply, ModelResponse, TokenUsage, ToolInvocation};
pub use r#loop::{LoopSettings, RetryPolicy, ToolLoop};
pub use rig_model::RigModel;
pub use service::Agent;
pub use transcript::{Scratchpad, Transcript};
