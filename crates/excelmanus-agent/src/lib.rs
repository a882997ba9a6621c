//! ExcelManus agent core.
//!
//! The per-session state machine that drives the LLM tool-calling loop,
//! dispatches tool calls through a risk-tiered approval pipeline,
//! maintains a versioned file workspace with transactional staging and
//! multi-turn rollback, and mediates blocking user interactions inside
//! the loop.
//!
//! Component map (leaves first):
//! - [`workspace`]: path validation, file version manager, staging
//!   transactions, quota-enforced isolated roots.
//! - [`registry`]: file metadata + provenance catalog with alias
//!   resolution and the workspace panorama.
//! - [`policy`]: code risk classification and the sandbox env contract.
//! - [`tools`]: tool definitions, write-effect tags, registry.
//! - [`interaction`]: future-based rendezvous for questions/approvals.
//! - [`engine_core`]: dispatcher strategy table and handlers.
//! - [`engine`]: the session loop itself.

pub mod approval;
pub mod config;
pub mod delegation;
pub mod engine;
pub mod engine_core;
pub mod error;
pub mod events;
pub mod interaction;
pub mod memory;
pub mod policy;
pub mod registry;
pub mod session;
pub mod skills;
pub mod tools;
pub mod verification;
pub mod workspace;

pub use approval::ApprovalDecision;
pub use config::{EngineConfig, GuardMode};
pub use engine::{AgentEngine, AgentEngineBuilder, StopReason, TurnOutcome, VisionExtractor};
pub use error::AgentError;
pub use events::{AgentEvent, AgentEventKind, EventObserver};
pub use session::WriteHint;
