//! Self-authoring UI runtime engine: compile/load pipeline, reasoning loop,
//! tool dispatch and the per-unit authoring state machine.

pub mod authoring;
pub mod boundary;
pub mod debounce;
pub mod dispatch;
pub mod error;
pub mod mutations;
pub mod pipeline;
pub mod prompt;
pub mod queue;
pub mod reasoning;
pub mod runtime;
pub mod shape;
pub mod tools;
pub mod truncate;
pub mod unit;

pub use authoring::{author, AuthoringRequest, DELIVER_TOOL};
pub use boundary::{CrashBoundary, CRASH_THRESHOLD};
pub use dispatch::{Dispatched, LocalTool, Route, ToolDispatcher, ToolTable};
pub use error::{AuthoringError, CompileError, EngineError, HostError, PipelineError, QueueError, RenderError};
pub use mutations::{MutationLog, MutationRecord, MUTATION_CAPACITY};
pub use pipeline::{LuaHost, ModuleHandle, Pipeline};
pub use prompt::PromptSource;
pub use queue::AuthoringQueue;
pub use reasoning::{ReasoningLoop, ReasoningOptions, ReasoningSnapshot, RunOutcome, FIRE_CEILING};
pub use runtime::{Runtime, RuntimeConfig};
pub use unit::{ReasoningConfig, UnitController, UnitSpec};
