//! Code risk classification and the sandbox execution contract.

pub mod code_policy;
pub mod manifest;
pub mod sandbox;

pub use code_policy::{
    extract_excel_targets, strip_exit_calls, Capability, CodeAnalysis, CodePolicyEngine,
    ExcelTarget, RiskTier,
};
pub use sandbox::{CodeRunOutput, CodeRunRequest, ProcessSandboxRunner, SandboxRunner};
