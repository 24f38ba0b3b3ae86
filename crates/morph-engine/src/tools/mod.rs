pub mod builtin;
pub mod terminal;

pub use builtin::{BuiltinContext, BuiltinTool};
pub use terminal::{respond_definition, reshape_definition, TerminalTool, RESHAPE, RESPOND};
