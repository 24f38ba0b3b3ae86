use morph_core::errors::TransportError;
use morph_core::tools::ToolError;
use morph_store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("entry module not found: {0}")]
    MissingEntry(String),

    #[error("cannot resolve \"{specifier}\" imported by {importer}")]
    UnresolvedImport { specifier: String, importer: String },
}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("lua error: {0}")]
    Lua(#[from] mlua::Error),

    #[error("invalid module: {0}")]
    InvalidModule(String),

    #[error("component {id} is invalid: {detail}")]
    InvalidComponent { id: String, detail: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("render crashed: {0}")]
    Crashed(String),

    #[error("module generation {0} has been revoked")]
    Revoked(u64),

    #[error("no module is loaded")]
    NotLoaded,

    #[error("unknown component: {0}")]
    UnknownComponent(String),
}

impl RenderError {
    /// Only failures raised by the component's own code count toward the
    /// crash threshold.
    pub fn is_crash(&self) -> bool {
        matches!(self, Self::Crashed(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("load error: {0}")]
    Host(#[from] HostError),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthoringError {
    #[error("model delivered an empty component")]
    EmptySource,

    #[error("model did not deliver a component")]
    NoDelivery,

    #[error("model delivered invalid source: {0}")]
    InvalidSource(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("authoring queue closed")]
    Closed,

    #[error("queued operation panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("authoring failed: {0}")]
    Authoring(#[from] AuthoringError),

    #[error("render error: {0}")]
    Render(#[from] RenderError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("invalid component id: {0}")]
    InvalidComponentId(String),

    #[error("{0}")]
    Internal(String),
}
