pub mod errors;
pub mod events;
pub mod ids;
pub mod messages;
pub mod status;
pub mod tools;
pub mod transport;

pub use errors::TransportError;
pub use ids::{ComponentId, MutationId, ToolUseId, TranscriptId};
pub use messages::{ContentBlock, Message, ModelResponse, Role};
pub use tools::{ToolCall, ToolChoice, ToolDefinition, ToolError};
pub use transport::{ModelBackend, ModelRequest};
pub use events::RuntimeEvent;
pub use status::{Latency, MutationOutcome, PipelineStatus, ReasoningStatus, UnitState};
