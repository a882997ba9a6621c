//! Tool dispatch: the ordered handler strategy table and the handler
//! implementations themselves.

pub mod dispatcher;
pub mod handlers;

pub use dispatcher::{parse_arguments, HandlerKind, ToolDispatcher, ToolExecOutcome};
