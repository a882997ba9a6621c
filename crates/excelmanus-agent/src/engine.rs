//! The session loop.
//!
//! One [`AgentEngine`] owns one session: its state, memory,
//! interaction registry and a reference to exactly one isolated
//! workspace. Engines never share mutable state with other engines;
//! concurrent sessions are isolated by construction.
//!
//! Locking discipline: the parking-lot mutexes guarding session-local
//! structures are only held for short synchronous sections and never
//! across an await point; the loop itself is sequential.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use excelmanus::chat::{ChatMessage, ChatRole, MessageType, Tool as ToolSchema};
use excelmanus::{ChatRequest, LlmProvider, ToolCall};

use crate::approval::{ApprovalDecision, ApprovalManager};
use crate::config::EngineConfig;
use crate::delegation::SubagentRegistry;
use crate::engine_core::dispatcher::{
    capture_write_probe, diff_write_probe, extract_changed_files, parse_arguments,
    result_has_cow_mapping, HandlerKind, RouteContext, ToolDispatcher, ToolExecOutcome,
};
use crate::error::AgentError;
use crate::events::{AgentEvent, AgentEventKind, EventObserver};
use crate::interaction::{InteractionRegistry, QuestionFlow};
use crate::memory::ConversationMemory;
use crate::policy::{ProcessSandboxRunner, SandboxRunner};
use crate::registry::FileRegistry;
use crate::session::{SessionState, WriteHint};
use crate::skills::{SkillPack, SkillPackSet};
use crate::tools::{builtins, ToolContext, ToolRegistry};
use crate::workspace::{IsolatedWorkspace, SandboxConfig, StagingScope, WorkspaceTransaction};

/// External image→table-spec pipeline (vision). The core validates the
/// input and consumes the result; the extraction itself is a black box.
#[async_trait]
pub trait VisionExtractor: Send + Sync {
    async fn extract_table_spec(
        &self,
        image_b64: &str,
        mime: &str,
        output_path: &str,
        skip_style: bool,
    ) -> Result<String, String>;
}

/// Why the loop stopped for this turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The LLM replied with text only; the turn is over.
    Completed,
    /// `finish_task` was accepted by the finish gate.
    Finished,
    /// The iteration cap was hit.
    IterationCap,
    /// A high-risk approval is pending; resolution resumes the loop.
    PendingApproval { approval_id: String },
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub stop_reason: StopReason,
    pub reply: String,
    pub iterations: usize,
}

pub struct AgentEngine {
    pub(crate) session_id: String,
    pub(crate) config: EngineConfig,
    pub(crate) provider: Arc<dyn LlmProvider>,
    pub(crate) workspace: Arc<IsolatedWorkspace>,
    pub(crate) registry: Arc<FileRegistry>,
    pub(crate) transaction: WorkspaceTransaction,
    pub(crate) tools: ToolRegistry,
    pub(crate) sandbox: Arc<dyn SandboxRunner>,
    pub(crate) vision: Option<Arc<dyn VisionExtractor>>,
    pub(crate) subagents: Arc<SubagentRegistry>,
    pub(crate) dispatcher: ToolDispatcher,

    pub(crate) session: Mutex<SessionState>,
    pub(crate) memory: Mutex<ConversationMemory>,
    pub(crate) interactions: InteractionRegistry,
    pub(crate) question_flow: Mutex<QuestionFlow>,
    pub(crate) approval: Mutex<ApprovalManager>,
    pub(crate) skills: Mutex<SkillPackSet>,
    pub(crate) full_access: AtomicBool,
    /// Tool-scope restriction for subagent sessions; `None` for the
    /// primary session (skill packs filter there instead).
    pub(crate) tool_scope: Option<Vec<String>>,

    event_tx: broadcast::Sender<AgentEvent>,
    event_seq: Arc<AtomicU64>,
    observers: Vec<Arc<dyn EventObserver>>,
    pub(crate) cancel_token: CancellationToken,
}

pub struct AgentEngineBuilder {
    config: EngineConfig,
    provider: Arc<dyn LlmProvider>,
    session_id: Option<String>,
    tools: Option<ToolRegistry>,
    sandbox: Option<Arc<dyn SandboxRunner>>,
    vision: Option<Arc<dyn VisionExtractor>>,
    subagents: Option<SubagentRegistry>,
    skills: Vec<SkillPack>,
    observers: Vec<Arc<dyn EventObserver>>,
}

impl AgentEngineBuilder {
    pub fn new(config: EngineConfig, provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            config,
            provider,
            session_id: None,
            tools: None,
            sandbox: None,
            vision: None,
            subagents: None,
            skills: Vec::new(),
            observers: Vec::new(),
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn SandboxRunner>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn with_vision(mut self, vision: Arc<dyn VisionExtractor>) -> Self {
        self.vision = Some(vision);
        self
    }

    pub fn with_subagents(mut self, subagents: SubagentRegistry) -> Self {
        self.subagents = Some(subagents);
        self
    }

    pub fn with_skill_pack(mut self, pack: SkillPack) -> Self {
        self.skills.push(pack);
        self
    }

    pub fn with_event_observer(mut self, observer: Arc<dyn EventObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn build(self) -> Result<Arc<AgentEngine>, AgentError> {
        let scope = StagingScope::parse(&self.config.transaction_scope);
        let workspace = Arc::new(IsolatedWorkspace::with_options(
            &self.config.workspace_root,
            None,
            SandboxConfig::default(),
            None,
            self.config.transaction_enabled,
            scope,
        )?);
        let registry = Arc::new(FileRegistry::new(&self.config.workspace_root, true)?);
        let fvm = registry
            .fvm()
            .cloned()
            .ok_or_else(|| AgentError::Internal("version manager missing".to_string()))?;
        let transaction = workspace.create_transaction(fvm, None)?;

        let mut skill_set = SkillPackSet::new();
        for pack in self.skills {
            skill_set.register(pack);
        }

        let (event_tx, _) = broadcast::channel(1024);
        let session_id = self
            .session_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()[..16].to_string());
        let memory_budget = self.config.memory_token_budget;

        Ok(Arc::new(AgentEngine {
            session_id,
            config: self.config,
            provider: self.provider,
            workspace,
            registry,
            transaction,
            tools: self.tools.unwrap_or_else(builtins::default_registry),
            sandbox: self
                .sandbox
                .unwrap_or_else(|| Arc::new(ProcessSandboxRunner::default())),
            vision: self.vision,
            subagents: Arc::new(self.subagents.unwrap_or_else(SubagentRegistry::with_defaults)),
            dispatcher: ToolDispatcher::new(),
            session: Mutex::new(SessionState::new()),
            memory: Mutex::new(ConversationMemory::new(memory_budget)),
            interactions: InteractionRegistry::new(),
            question_flow: Mutex::new(QuestionFlow::new()),
            approval: Mutex::new(ApprovalManager::new()),
            skills: Mutex::new(skill_set),
            full_access: AtomicBool::new(false),
            tool_scope: None,
            event_tx,
            event_seq: Arc::new(AtomicU64::new(1)),
            observers: self.observers,
            cancel_token: CancellationToken::new(),
        }))
    }
}

impl AgentEngine {
    pub fn builder(config: EngineConfig, provider: Arc<dyn LlmProvider>) -> AgentEngineBuilder {
        AgentEngineBuilder::new(config, provider)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn registry(&self) -> &Arc<FileRegistry> {
        &self.registry
    }

    pub fn transaction(&self) -> &WorkspaceTransaction {
        &self.transaction
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<AgentEvent> {
        self.event_tx.subscribe()
    }

    pub fn full_access_enabled(&self) -> bool {
        self.full_access.load(Ordering::Relaxed) || self.config.full_access_enabled
    }

    pub fn set_full_access(&self, enabled: bool) {
        self.full_access.store(enabled, Ordering::Relaxed);
    }

    /// Task tags drive the finish verifier strength; set by the
    /// router/transport before the turn starts.
    pub fn set_task_tags(&self, tags: Vec<String>) {
        self.session.lock().task_tags = tags;
    }

    pub fn set_plan_mode(&self, enabled: bool) {
        self.session.lock().plan_intercept_task_create = enabled;
    }

    /// Seed the session write hint from the task router's intent
    /// classification (read_only / may_write / unknown).
    pub fn set_write_hint(&self, hint: WriteHint) {
        self.session.lock().current_write_hint = hint;
    }

    pub fn has_write_recorded(&self) -> bool {
        self.session.lock().has_write_tool_call()
    }

    pub fn verification_attempts(&self) -> usize {
        self.session.lock().verification_attempt_count
    }

    /// Head of the question queue, if the loop is waiting on one.
    pub fn current_question(&self) -> Option<crate::interaction::PendingQuestion> {
        self.question_flow.lock().current().cloned()
    }

    /// The approval the loop is suspended on, if any.
    pub fn pending_approval(&self) -> Option<crate::approval::PendingApproval> {
        self.approval.lock().pending().cloned()
    }

    /// Full session reset: state, memory and pending questions.
    pub fn reset_session(&self) {
        self.session.lock().reset();
        self.memory.lock().clear();
        self.question_flow.lock().clear();
    }

    // ── public loop API ─────────────────────────────────────────

    /// Run one user turn: append the prompt and drive the LLM/tool
    /// loop until it stops.
    pub async fn run_turn(&self, user_prompt: &str) -> Result<TurnOutcome, AgentError> {
        self.registry.scan_workspace();
        self.memory.lock().push(ChatMessage::user(user_prompt));
        self.run_loop().await
    }

    /// Resume the loop without a new user message (after an approval
    /// resolution or an injected tool result).
    pub async fn continue_loop(&self) -> Result<TurnOutcome, AgentError> {
        self.run_loop().await
    }

    /// Resolve a pending `ask_user` / `suggest_mode_switch` question.
    pub async fn answer_question(&self, question_id: &str, payload: serde_json::Value) -> bool {
        self.interactions.resolve(question_id, payload).await
    }

    /// Resolve a pending high-risk approval: accept executes the real
    /// tool, reject synthesizes a rejection tool result, and
    /// full-access-retry accepts and unlocks the session.
    pub async fn resolve_approval(
        &self,
        approval_id: &str,
        decision: ApprovalDecision,
    ) -> Result<String, AgentError> {
        let pending = self
            .approval
            .lock()
            .take_pending(approval_id)
            .ok_or_else(|| AgentError::ApprovalNotFound {
                approval_id: approval_id.to_string(),
            })?;

        let result_str = match decision {
            ApprovalDecision::Reject => format!(
                "The user rejected the `{}` operation. Do not retry it; adjust the approach \
                 or ask the user what to do instead.",
                pending.tool_name
            ),
            ApprovalDecision::Accept | ApprovalDecision::FullAccessRetry => {
                if decision == ApprovalDecision::FullAccessRetry {
                    self.set_full_access(true);
                }
                let (outcome, _audit) = self
                    .execute_tool_with_audit(&pending.tool_name, &pending.arguments, true)
                    .await;
                let iteration = self.session.lock().turn;
                self.record_write_results(&pending.tool_name, &outcome, iteration);
                outcome.result_str
            }
        };

        self.memory.lock().push(ChatMessage::tool_result(
            pending.tool_call_id.clone(),
            pending.tool_name.clone(),
            result_str.clone(),
        ));
        Ok(result_str)
    }

    /// Undo every file change recorded at or after the given turn.
    pub fn rollback_to_turn(&self, turn: usize) -> Vec<String> {
        let restored = self.registry.rollback_to_turn(turn);
        if !restored.is_empty() {
            let iteration = self.session.lock().turn;
            self.emit(
                iteration,
                None,
                AgentEventKind::RollbackApplied {
                    turn,
                    restored: restored.clone(),
                },
            );
        }
        restored
    }

    /// Cancel the session: all pending interactions are dropped, an
    /// in-flight approval is rejected, and the loop stops after the
    /// currently executing tool returns. Staged files are preserved so
    /// the user can resume or discard.
    pub async fn cancel(&self) {
        self.cancel_token.cancel();
        self.interactions.cancel_all().await;
        if let Some(pending) = self.approval.lock().clear_pending() {
            log::info!(
                "session {}: pending approval {} rejected by cancellation",
                self.session_id,
                pending.approval_id
            );
        }
    }

    // ── the loop ────────────────────────────────────────────────

    #[tracing::instrument(skip(self), fields(session_id = %self.session_id))]
    async fn run_loop(&self) -> Result<TurnOutcome, AgentError> {
        loop {
            if self.cancel_token.is_cancelled() {
                let iteration = self.session.lock().turn;
                self.emit(iteration, None, AgentEventKind::Cancelled);
                return Ok(TurnOutcome {
                    stop_reason: StopReason::Cancelled,
                    reply: String::new(),
                    iterations: iteration,
                });
            }

            let iteration = {
                let mut session = self.session.lock();
                session.turn += 1;
                session.turn
            };
            if iteration > self.config.max_iterations {
                self.emit(
                    iteration,
                    None,
                    AgentEventKind::TaskError {
                        message: format!(
                            "iteration cap of {} reached",
                            self.config.max_iterations
                        ),
                    },
                );
                return Ok(TurnOutcome {
                    stop_reason: StopReason::IterationCap,
                    reply: String::new(),
                    iterations: iteration - 1,
                });
            }

            let system_prompt = self.build_system_prompt();
            let (messages, message_count) = {
                let mut memory = self.memory.lock();
                memory.set_system_prompt(system_prompt);
                (memory.messages().to_vec(), memory.len())
            };

            self.emit(iteration, None, AgentEventKind::LlmCallStarted { message_count });
            let request = ChatRequest::new(messages).with_tools(self.collect_tools());
            let response = tokio::select! {
                result = self.provider.chat(&request) => result,
                _ = self.cancel_token.cancelled() => {
                    self.emit(iteration, None, AgentEventKind::Cancelled);
                    return Ok(TurnOutcome {
                        stop_reason: StopReason::Cancelled,
                        reply: String::new(),
                        iterations: iteration,
                    });
                }
            };
            let response = match response {
                Ok(response) => response,
                Err(err) => {
                    let err: AgentError = err.into();
                    self.emit(
                        iteration,
                        None,
                        AgentEventKind::TaskError {
                            message: err.to_string(),
                        },
                    );
                    return Err(err);
                }
            };

            let tool_call_count = response.tool_calls.as_ref().map_or(0, Vec::len);
            self.emit(
                iteration,
                None,
                AgentEventKind::LlmCallFinished {
                    usage: response.usage,
                    tool_calls: tool_call_count,
                },
            );

            // store the assistant message
            {
                let mut memory = self.memory.lock();
                let message_type = match &response.tool_calls {
                    Some(calls) if !calls.is_empty() => MessageType::ToolUse(calls.clone()),
                    _ => MessageType::Text,
                };
                memory.push(ChatMessage {
                    role: ChatRole::Assistant,
                    message_type,
                    content: response.content.clone(),
                });
            }

            let Some(calls) = response.tool_calls.filter(|c| !c.is_empty()) else {
                // text-only reply ends the turn
                return Ok(TurnOutcome {
                    stop_reason: StopReason::Completed,
                    reply: response.content,
                    iterations: iteration,
                });
            };

            for call in calls {
                if self.cancel_token.is_cancelled() {
                    self.emit(iteration, None, AgentEventKind::Cancelled);
                    return Ok(TurnOutcome {
                        stop_reason: StopReason::Cancelled,
                        reply: String::new(),
                        iterations: iteration,
                    });
                }

                let outcome = self.execute_tool_call(&call, iteration).await;

                if outcome.finish_accepted {
                    self.emit(
                        iteration,
                        Some(call.id.clone()),
                        AgentEventKind::TaskDone {
                            summary: outcome.result_str.clone(),
                        },
                    );
                    return Ok(TurnOutcome {
                        stop_reason: StopReason::Finished,
                        reply: outcome.result_str,
                        iterations: iteration,
                    });
                }
                if outcome.pending_approval {
                    return Ok(TurnOutcome {
                        stop_reason: StopReason::PendingApproval {
                            approval_id: outcome.approval_id.clone().unwrap_or_default(),
                        },
                        reply: outcome.result_str,
                        iterations: iteration,
                    });
                }
                if outcome.defer_tool_result {
                    // plan proposal: the turn pauses for user review
                    return Ok(TurnOutcome {
                        stop_reason: StopReason::Completed,
                        reply: outcome.result_str,
                        iterations: iteration,
                    });
                }
            }
        }
    }

    // ── tool execution ──────────────────────────────────────────

    pub(crate) async fn execute_tool_call(
        &self,
        call: &ToolCall,
        iteration: usize,
    ) -> ToolExecOutcome {
        let tool_name = call.function.name.clone();
        self.emit(
            iteration,
            Some(call.id.clone()),
            AgentEventKind::ToolCallStarted {
                tool_name: tool_name.clone(),
                arguments: call.function.arguments.clone(),
            },
        );

        let outcome = match parse_arguments(&call.function.arguments) {
            Err(message) => ToolExecOutcome::err(format!("tool argument error: {}", message)),
            Ok(args) => {
                // pre-compute the write hint from the tool definition;
                // finish_task keeps the hint of the preceding work so
                // the finish gate judges the task, not the finish call
                if tool_name != "finish_task" {
                    let hint = self
                        .tools
                        .write_effect(&tool_name)
                        .map(|effect| effect.write_hint())
                        .unwrap_or(WriteHint::Unknown);
                    self.session.lock().current_write_hint = hint;
                }

                let kind = {
                    let plan_intercept = self.session.lock().plan_intercept_task_create;
                    let approval = self.approval.lock();
                    let context = RouteContext {
                        plan_intercept_task_create: plan_intercept,
                        code_policy_enabled: self.config.code_policy_enabled,
                        approval: &approval,
                    };
                    self.dispatcher.route(&context, &tool_name)
                };
                self.dispatch_to_handler(kind, &tool_name, &call.id, &args, iteration)
                    .await
            }
        };

        let mut outcome = outcome;
        outcome.result_str =
            crate::tools::truncate_result(&outcome.result_str, self.tools.max_result_chars(&tool_name));

        self.record_write_results(&tool_name, &outcome, iteration);

        if !outcome.defer_tool_result {
            self.memory.lock().push(ChatMessage::tool_result(
                call.id.clone(),
                tool_name.clone(),
                outcome.result_str.clone(),
            ));
        }

        self.emit(
            iteration,
            Some(call.id.clone()),
            AgentEventKind::ToolCallFinished {
                tool_name,
                is_error: !outcome.success,
                result: outcome.result_str.clone(),
            },
        );
        outcome
    }

    async fn dispatch_to_handler(
        &self,
        kind: HandlerKind,
        tool_name: &str,
        tool_call_id: &str,
        args: &serde_json::Map<String, serde_json::Value>,
        iteration: usize,
    ) -> ToolExecOutcome {
        match kind {
            HandlerKind::SkillActivation => self.handle_skill_activation(args, iteration).await,
            HandlerKind::Delegation => {
                self.handle_delegation(tool_name, tool_call_id, args, iteration)
                    .await
            }
            HandlerKind::FinishTask => self.handle_finish_task(tool_call_id, args, iteration).await,
            HandlerKind::AskUser => self.handle_ask_user(tool_call_id, args, iteration).await,
            HandlerKind::SuggestModeSwitch => {
                self.handle_suggest_mode_switch(tool_call_id, args, iteration)
                    .await
            }
            HandlerKind::PlanIntercept => self.handle_plan_intercept(args).await,
            HandlerKind::ExtractTableSpec => self.handle_extract_table_spec(args, iteration).await,
            HandlerKind::CodePolicy => {
                self.handle_code_policy(tool_call_id, args, iteration).await
            }
            HandlerKind::AuditOnly => self.handle_audit_only(tool_name, args, iteration).await,
            HandlerKind::HighRiskApproval => {
                self.handle_high_risk(tool_name, tool_call_id, args, iteration)
                    .await
            }
            HandlerKind::Default => self.handle_default(tool_name, args).await,
        }
    }

    /// Post-execution write bookkeeping: session log, turn checkpoint
    /// and the files_changed event.
    pub(crate) fn record_write_results(
        &self,
        tool_name: &str,
        outcome: &ToolExecOutcome,
        iteration: usize,
    ) {
        let mut changed = outcome.changed_files.clone();
        for path in extract_changed_files(&outcome.result_str) {
            if !changed.contains(&path) {
                changed.push(path);
            }
        }

        if changed.is_empty() {
            if result_has_cow_mapping(&outcome.result_str) {
                self.session.lock().record_write_action();
            }
            return;
        }

        {
            let mut session = self.session.lock();
            for path in &changed {
                session.log_write_operation(tool_name, path.clone(), "modified");
            }
        }

        if let Some(checkpoint) =
            self.registry
                .create_turn_checkpoint(iteration, &changed, &[tool_name.to_string()])
        {
            self.emit(
                iteration,
                None,
                AgentEventKind::TurnCheckpointCreated {
                    turn: checkpoint.turn_number,
                    paths: checkpoint.files_modified.clone(),
                },
            );
        }
        self.emit(
            iteration,
            None,
            AgentEventKind::FilesChanged { paths: changed },
        );
    }

    // ── shared helpers ──────────────────────────────────────────

    pub(crate) fn tool_context(&self) -> ToolContext {
        ToolContext {
            session_id: self.session_id.clone(),
            turn: self.session.lock().turn,
            workspace: Arc::clone(&self.workspace),
            registry: Arc::clone(&self.registry),
            transaction: self.transaction.clone(),
            transaction_enabled: self.config.transaction_enabled,
            sandbox: Arc::clone(&self.sandbox),
            code_timeout: self.config.code_timeout,
            protected_dirs: self.config.protected_dirs.clone(),
        }
    }

    /// Direct registry call with the unknown-write probe around it.
    pub(crate) async fn call_registry_tool(
        &self,
        tool_name: &str,
        args: &serde_json::Map<String, serde_json::Value>,
    ) -> ToolExecOutcome {
        let Some(tool) = self.tools.find(tool_name) else {
            return ToolExecOutcome::err(format!("unknown tool: {}", tool_name));
        };
        let probe_before = capture_write_probe(self.workspace.root_dir());
        let context = self.tool_context();
        match tool.call(args, &context).await {
            Ok(result_str) => {
                let probe_after = capture_write_probe(self.workspace.root_dir());
                let mut outcome = ToolExecOutcome::ok(result_str);
                outcome.changed_files = diff_write_probe(&probe_before, &probe_after);
                outcome
            }
            Err(err) => ToolExecOutcome::err(err.to_string()),
        }
    }

    /// Execute a tool and capture an audit record of what changed.
    pub(crate) async fn execute_tool_with_audit(
        &self,
        tool_name: &str,
        args: &serde_json::Map<String, serde_json::Value>,
        undoable: bool,
    ) -> (ToolExecOutcome, Option<crate::approval::AuditRecord>) {
        let outcome = self.call_registry_tool(tool_name, args).await;
        if !outcome.success {
            return (outcome, None);
        }
        let mut changes = outcome.changed_files.clone();
        for path in extract_changed_files(&outcome.result_str) {
            if !changes.contains(&path) {
                changes.push(path);
            }
        }
        let audit = crate::approval::AuditRecord {
            approval_id: ApprovalManager::new_approval_id(),
            tool_name: tool_name.to_string(),
            changes,
            undoable,
            created_at: ApprovalManager::utc_now(),
        };
        let mut outcome = outcome;
        outcome.audit = Some(audit.clone());
        (outcome, Some(audit))
    }

    pub(crate) fn collect_tools(&self) -> Vec<ToolSchema> {
        let scope = match &self.tool_scope {
            Some(scope) => Some(scope.clone()),
            None => self.skills.lock().active_scope(),
        };
        self.tools.definitions(scope.as_deref())
    }

    pub(crate) fn build_system_prompt(&self) -> String {
        let mut sections: Vec<String> = Vec::new();
        sections.push(
            "You are ExcelManus, an agent that manipulates spreadsheet files in the user's \
             workspace through tools. Work step by step; call finish_task when the request is \
             fully handled."
                .to_string(),
        );

        let skill_instructions = self.skills.lock().active_instructions();
        if !skill_instructions.is_empty() {
            sections.push(skill_instructions);
        }

        let panorama = self.registry.build_panorama();
        if !panorama.is_empty() {
            sections.push(panorama);
        }

        let staged = self.transaction.list_staged();
        if !staged.is_empty() {
            let mut lines =
                vec!["File staging is active: writes land in staged copies until committed."
                    .to_string()];
            for (original, staged_path) in staged {
                lines.push(format!(
                    "- {} → {}",
                    self.transaction.to_relative(&original.to_string_lossy()),
                    self.transaction.to_relative(&staged_path.to_string_lossy()),
                ));
            }
            sections.push(lines.join("\n"));
        }

        let plan_tasks = self.session.lock().plan_tasks.clone();
        if !plan_tasks.is_empty() {
            let mut lines = vec!["Current plan:".to_string()];
            for (idx, task) in plan_tasks.iter().enumerate() {
                let marker = if task.done { "x" } else { " " };
                lines.push(format!("{}. [{}] {}", idx + 1, marker, task.title));
            }
            sections.push(lines.join("\n"));
        }

        sections.join("\n\n")
    }

    pub(crate) fn emit(
        &self,
        iteration: usize,
        tool_call_id: Option<String>,
        kind: AgentEventKind,
    ) {
        let event = AgentEvent {
            seq: self.event_seq.fetch_add(1, Ordering::Relaxed),
            timestamp: time::OffsetDateTime::now_utc().unix_timestamp(),
            session_id: self.session_id.clone(),
            iteration,
            tool_call_id,
            kind,
        };
        let _ = self.event_tx.send(event.clone());
        for observer in &self.observers {
            let observer = Arc::clone(observer);
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(err) = observer.on_event(&event).await {
                    log::warn!("event observer failed: {}", err);
                }
            });
        }
    }

    /// Child engine for a subagent run: fresh session state and memory,
    /// shared workspace, registry, transaction and event stream.
    pub(crate) fn spawn_child(
        &self,
        profile: &crate::delegation::SubagentProfile,
    ) -> Arc<AgentEngine> {
        let mut config = self.config.clone();
        config.max_iterations = profile.max_iterations;
        config.subagent_enabled = false;

        let mut memory = ConversationMemory::new(config.memory_token_budget);
        memory.set_system_prompt(profile.system_prompt.clone());

        let tool_scope = if profile.tool_scope.is_empty() {
            None
        } else {
            Some(profile.tool_scope.clone())
        };

        Arc::new(AgentEngine {
            session_id: format!("{}:sub:{}", self.session_id, profile.name),
            config,
            provider: Arc::clone(&self.provider),
            workspace: Arc::clone(&self.workspace),
            registry: Arc::clone(&self.registry),
            transaction: self.transaction.clone(),
            tools: self.tools.clone(),
            sandbox: Arc::clone(&self.sandbox),
            vision: self.vision.clone(),
            subagents: Arc::clone(&self.subagents),
            dispatcher: ToolDispatcher::new(),
            session: Mutex::new(SessionState::new()),
            memory: Mutex::new(memory),
            interactions: InteractionRegistry::new(),
            question_flow: Mutex::new(QuestionFlow::new()),
            approval: Mutex::new(ApprovalManager::new()),
            skills: Mutex::new(SkillPackSet::new()),
            full_access: AtomicBool::new(self.full_access_enabled()),
            tool_scope,
            event_tx: self.event_tx.clone(),
            event_seq: Arc::clone(&self.event_seq),
            observers: Vec::new(),
            cancel_token: self.cancel_token.child_token(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use excelmanus::error::LlmError;
    use excelmanus::ChatResponse;
    use tempfile::TempDir;

    struct SilentProvider;

    #[async_trait]
    impl LlmProvider for SilentProvider {
        async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse, LlmError> {
            Ok(ChatResponse::text("done"))
        }
    }

    fn engine(dir: &TempDir) -> Arc<AgentEngine> {
        AgentEngine::builder(
            EngineConfig::new(dir.path()),
            Arc::new(SilentProvider),
        )
        .with_session_id("test-session")
        .build()
        .unwrap()
    }

    #[tokio::test]
    async fn system_prompt_includes_panorama_and_staging() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir);
        std::fs::write(dir.path().join("report.csv"), "a,b\n1,2\n").unwrap();
        e.registry.scan_workspace();

        let prompt = e.build_system_prompt();
        assert!(prompt.contains("Workspace file panorama"));
        assert!(prompt.contains("report.csv"));
        assert!(!prompt.contains("File staging is active"));

        e.transaction.stage_for_write("report.csv").unwrap();
        let prompt = e.build_system_prompt();
        assert!(prompt.contains("File staging is active"));
    }

    #[tokio::test]
    async fn collect_tools_honors_subagent_scope() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir);
        let profile = e.subagents.get("verifier").unwrap().clone();
        let child = e.spawn_child(&profile);

        let names: Vec<String> = child
            .collect_tools()
            .into_iter()
            .map(|t| t.function.name)
            .collect();
        assert!(names.contains(&"read_cells".to_string()));
        assert!(names.contains(&"list_files".to_string()));
        assert!(!names.contains(&"write_cells".to_string()));
        assert!(!names.contains(&"run_code".to_string()));
    }

    #[tokio::test]
    async fn child_session_state_is_isolated() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir);
        let profile = e.subagents.get("excel_worker").unwrap().clone();
        let child = e.spawn_child(&profile);

        child.session.lock().record_write_action();
        assert!(!e.session.lock().has_write_tool_call());
        assert!(child.session.lock().has_write_tool_call());
        assert!(child.session_id().starts_with("test-session:sub:"));
    }

    #[tokio::test]
    async fn text_only_reply_completes_turn() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir);
        let outcome = e.run_turn("hello").await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::Completed);
        assert_eq!(outcome.reply, "done");
        assert_eq!(outcome.iterations, 1);
    }

    #[tokio::test]
    async fn cancelled_engine_stops_immediately() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir);
        e.cancel().await;
        let outcome = e.run_turn("hello").await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::Cancelled);
    }

    #[tokio::test]
    async fn events_are_sequenced_per_session() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir);
        let mut rx = e.subscribe_events();
        e.run_turn("hello").await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(second.seq > first.seq);
        assert!(matches!(first.kind, AgentEventKind::LlmCallStarted { .. }));
        assert!(matches!(second.kind, AgentEventKind::LlmCallFinished { .. }));
    }
}
