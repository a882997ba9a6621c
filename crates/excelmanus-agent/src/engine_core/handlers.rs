//! Handler strategy implementations.
//!
//! One method per [`HandlerKind`][super::dispatcher::HandlerKind],
//! executed on the engine. Every recoverable failure is rendered into
//! the returned outcome's result string so the LLM can see it and
//! retry; handlers never panic the loop.

use serde_json::{Map, Value};

use crate::approval::{ApprovalDecision, ApprovalManager};
use crate::config::GuardMode;
use crate::delegation::{SubagentProfile, SubagentResult};
use crate::engine::{AgentEngine, StopReason};
use crate::engine_core::dispatcher::{result_has_cow_mapping, ToolExecOutcome};
use crate::events::{AgentEventKind, QuestionOption};
use crate::interaction::{AwaitOutcome, InteractionRegistry, PendingQuestion};
use crate::policy::code_policy::{
    extract_excel_targets, strip_exit_calls, CodeAnalysis, CodePolicyEngine, RiskTier,
};
use crate::registry::sheets;
use crate::session::{PlanTask, WriteHint};
use crate::verification::{
    parse_verdict, render_verdict, resolve_verifier_level, VerifierLevel, BLOCK_PREFIX,
    MAX_BLOCKING_ATTEMPTS,
};

const SUPPORTED_IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "webp"];
const MAX_IMAGE_SIZE_BYTES: u64 = 20_000_000;

fn new_question_id() -> String {
    format!("q-{}", &uuid::Uuid::new_v4().simple().to_string()[..12])
}

fn render_finish_report(report: Option<&Map<String, Value>>, summary: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !summary.is_empty() {
        parts.push(summary.to_string());
    }
    if let Some(report) = report {
        if let Some(operations) = report.get("operations").and_then(Value::as_str) {
            parts.push(format!("Operations: {}", operations));
        }
        if let Some(files) = report.get("affected_files").and_then(Value::as_array) {
            let names: Vec<&str> = files.iter().filter_map(Value::as_str).collect();
            if !names.is_empty() {
                parts.push(format!("Affected files: {}", names.join(", ")));
            }
        }
    }
    parts.join("\n")
}

fn report_affected_files(
    report: Option<&Map<String, Value>>,
    args: &Map<String, Value>,
) -> Vec<String> {
    let from = |map: &Map<String, Value>| {
        map.get("affected_files")
            .and_then(Value::as_array)
            .map(|files| {
                files
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
    };
    let mut files = report.map(from).unwrap_or_default();
    if files.is_empty() {
        files = from(args);
    }
    files
}

impl AgentEngine {
    // ── skill activation ───────────────────────────────────────

    pub(crate) async fn handle_skill_activation(
        &self,
        args: &Map<String, Value>,
        iteration: usize,
    ) -> ToolExecOutcome {
        let name = match args.get("skill_name").and_then(Value::as_str) {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => {
                return ToolExecOutcome::err(
                    "tool argument error: skill_name must be a non-empty string",
                )
            }
        };
        let activation = {
            let mut skills = self.skills.lock();
            skills.activate(&name).map(|pack| pack.description.clone())
        };
        match activation {
            Ok(description) => {
                self.emit(
                    iteration,
                    None,
                    AgentEventKind::SkillActivated {
                        skill_name: name.clone(),
                    },
                );
                ToolExecOutcome::ok(format!("OK: skill pack '{}' activated. {}", name, description))
            }
            Err(message) => ToolExecOutcome::err(message),
        }
    }

    // ── delegation ─────────────────────────────────────────────

    pub(crate) async fn handle_delegation(
        &self,
        tool_name: &str,
        tool_call_id: &str,
        args: &Map<String, Value>,
        iteration: usize,
    ) -> ToolExecOutcome {
        if !self.config.subagent_enabled {
            return ToolExecOutcome::err("subagent delegation is disabled for this session");
        }
        if tool_name == "list_subagents" {
            return ToolExecOutcome::ok(self.subagents.describe());
        }

        let tasks = args.get("tasks").and_then(Value::as_array);
        let parallel = tool_name == "parallel_delegate"
            || tasks.map(|t| t.len() >= 2).unwrap_or(false);
        if parallel {
            return self
                .handle_parallel_delegate(tasks, tool_call_id, iteration)
                .await;
        }

        let task = match args.get("task").and_then(Value::as_str) {
            Some(task) if !task.trim().is_empty() => task.trim().to_string(),
            _ => {
                return ToolExecOutcome::err(
                    "tool argument error: provide `task` (or `tasks` for parallel delegation)",
                )
            }
        };
        let agent_name = match args.get("agent_name") {
            Some(Value::String(name)) => Some(name.trim().to_string()),
            Some(Value::Null) | None => None,
            Some(_) => {
                return ToolExecOutcome::err("tool argument error: agent_name must be a string")
            }
        };

        self.delegate_single(&task, agent_name.as_deref(), tool_call_id, iteration)
            .await
    }

    async fn handle_parallel_delegate(
        &self,
        tasks: Option<&Vec<Value>>,
        tool_call_id: &str,
        iteration: usize,
    ) -> ToolExecOutcome {
        let Some(tasks) = tasks.filter(|t| t.len() >= 2) else {
            return ToolExecOutcome::err(
                "tool argument error: tasks must be an array of at least 2 subtasks",
            );
        };

        let mut parsed: Vec<(String, Option<String>)> = Vec::new();
        for item in tasks {
            let Some(task) = item.get("task").and_then(Value::as_str) else {
                return ToolExecOutcome::err(
                    "tool argument error: every parallel subtask needs a `task` string",
                );
            };
            let agent = item
                .get("agent_name")
                .and_then(Value::as_str)
                .map(str::to_string);
            parsed.push((task.to_string(), agent));
        }

        // fan out, gather everything before reporting back
        let futures = parsed.iter().map(|(task, agent)| {
            self.delegate_single(task, agent.as_deref(), tool_call_id, iteration)
        });
        let outcomes = futures_util::future::join_all(futures).await;

        let success = outcomes.iter().all(|o| o.success);
        let mut lines = vec![format!("Parallel delegation: {} subtasks", outcomes.len())];
        let mut changed_files = Vec::new();
        for (idx, outcome) in outcomes.iter().enumerate() {
            let status = if outcome.success { "ok" } else { "failed" };
            lines.push(format!("{}. [{}] {}", idx + 1, status, outcome.result_str));
            for path in &outcome.changed_files {
                if !changed_files.contains(path) {
                    changed_files.push(path.clone());
                }
            }
        }

        let mut aggregate = if success {
            ToolExecOutcome::ok(lines.join("\n"))
        } else {
            ToolExecOutcome::err(lines.join("\n"))
        };
        aggregate.changed_files = changed_files;
        aggregate
    }

    /// Run one subagent task, bridging any high-risk approval the child
    /// raises to the parent's user as a blocking question.
    async fn delegate_single(
        &self,
        task: &str,
        agent_name: Option<&str>,
        tool_call_id: &str,
        iteration: usize,
    ) -> ToolExecOutcome {
        let profile: SubagentProfile = match agent_name {
            Some(name) => match self.subagents.get(name) {
                Some(profile) => profile.clone(),
                None => {
                    return ToolExecOutcome::err(format!(
                        "unknown subagent: {}\n{}",
                        name,
                        self.subagents.describe()
                    ))
                }
            },
            None => match self.subagents.default_worker() {
                Some(profile) => profile.clone(),
                None => return ToolExecOutcome::err("no subagents are registered"),
            },
        };

        self.emit(
            iteration,
            Some(tool_call_id.to_string()),
            AgentEventKind::SubagentStarted {
                subagent_name: profile.name.clone(),
                task: task.to_string(),
            },
        );

        let child = self.spawn_child(&profile);
        let mut current = Box::pin(child.run_turn(task)).await;

        loop {
            let turn = match current {
                Ok(turn) => turn,
                Err(err) => {
                    self.emit(
                        iteration,
                        Some(tool_call_id.to_string()),
                        AgentEventKind::SubagentFinished {
                            subagent_name: profile.name.clone(),
                            success: false,
                        },
                    );
                    return ToolExecOutcome::err(format!(
                        "subagent '{}' failed: {}",
                        profile.name, err
                    ));
                }
            };

            if let StopReason::PendingApproval { approval_id } = &turn.stop_reason {
                let approval_id = approval_id.clone();
                let pending_tool = child
                    .approval
                    .lock()
                    .pending()
                    .map(|p| p.tool_name.clone())
                    .unwrap_or_else(|| "high-risk tool".to_string());

                let approved = self
                    .ask_subagent_approval(&profile.name, &pending_tool, tool_call_id, iteration)
                    .await;
                let decision = if approved {
                    ApprovalDecision::Accept
                } else {
                    ApprovalDecision::Reject
                };
                if let Err(err) = child.resolve_approval(&approval_id, decision).await {
                    return ToolExecOutcome::err(format!(
                        "subagent approval handling failed: {}",
                        err
                    ));
                }
                current = Box::pin(child.continue_loop()).await;
                continue;
            }

            let changes: Vec<String> = {
                let session = child.session.lock();
                let mut paths = Vec::new();
                for op in &session.write_operations_log {
                    if !paths.contains(&op.file_path) {
                        paths.push(op.file_path.clone());
                    }
                }
                paths
            };
            let success = matches!(
                turn.stop_reason,
                StopReason::Finished | StopReason::Completed
            );
            // writes from children propagate to the parent session
            if success && !changes.is_empty() {
                self.session.lock().record_write_action();
            }
            self.emit(
                iteration,
                Some(tool_call_id.to_string()),
                AgentEventKind::SubagentFinished {
                    subagent_name: profile.name.clone(),
                    success,
                },
            );

            let mut outcome = if success {
                ToolExecOutcome::ok(format!(
                    "Subagent '{}' finished.\n{}",
                    profile.name, turn.reply
                ))
            } else {
                ToolExecOutcome::err(format!(
                    "Subagent '{}' did not finish ({:?}).",
                    profile.name, turn.stop_reason
                ))
            };
            outcome.changed_files = changes;
            return outcome;
        }
    }

    /// Ask the parent's user whether a child's high-risk call may run.
    async fn ask_subagent_approval(
        &self,
        subagent_name: &str,
        tool_name: &str,
        tool_call_id: &str,
        iteration: usize,
    ) -> bool {
        let question = PendingQuestion {
            question_id: new_question_id(),
            tool_call_id: tool_call_id.to_string(),
            header: "Approval".to_string(),
            text: format!(
                "Subagent '{}' wants to run the high-risk tool `{}`. Allow it?",
                subagent_name, tool_name
            ),
            options: vec![
                QuestionOption {
                    label: "Approve".to_string(),
                    description: "Run the operation".to_string(),
                },
                QuestionOption {
                    label: "Reject".to_string(),
                    description: "Refuse the operation".to_string(),
                },
            ],
            multi_select: false,
            iteration,
        };
        match self.ask_blocking_question(question).await {
            AwaitOutcome::Resolved(payload) => payload_picks(&payload, "Approve"),
            AwaitOutcome::TimedOut | AwaitOutcome::Cancelled => false,
        }
    }

    // ── finish_task gate ───────────────────────────────────────

    pub(crate) async fn handle_finish_task(
        &self,
        _tool_call_id: &str,
        args: &Map<String, Value>,
        iteration: usize,
    ) -> ToolExecOutcome {
        let report = args.get("report").and_then(Value::as_object).cloned();
        let summary = args.get("summary").and_then(Value::as_str).unwrap_or("");
        let rendered = render_finish_report(report.as_ref(), summary);

        let (has_write, hint, warned) = {
            let session = self.session.lock();
            (
                session.has_write_tool_call(),
                session.current_write_hint,
                session.finish_task_warned,
            )
        };
        let guard_off = self.config.guard_mode == GuardMode::Off;

        let completed_text = |suffix: &str| {
            if rendered.is_empty() {
                format!("✓ Task complete{}.", suffix)
            } else {
                format!("✅ Task complete{}\n\n{}", suffix, rendered)
            }
        };

        let mut result_str;
        let mut accepted;
        if has_write {
            accepted = true;
            result_str = completed_text("");
        } else if guard_off || hint != WriteHint::MayWrite {
            accepted = true;
            let suffix = if hint == WriteHint::ReadOnly {
                " (no writes)"
            } else {
                ""
            };
            result_str = completed_text(suffix);
        } else if warned {
            accepted = true;
            result_str = completed_text(" (no writes)");
        } else {
            // first write-less finish on a write-hinted task: reject
            self.session.lock().finish_task_warned = true;
            return ToolExecOutcome {
                result_str: "⚠️ No successful write-class tool call was detected. If the task \
                             genuinely needs no writes, call finish_task again and say so in the \
                             summary; otherwise perform the write first."
                    .to_string(),
                success: true,
                finish_accepted: false,
                ..ToolExecOutcome::default()
            };
        }

        if accepted {
            if let Some(verifier_text) = self.run_verifier_if_needed(report.as_ref(), summary).await
            {
                if verifier_text.starts_with(BLOCK_PREFIX) {
                    accepted = false;
                    result_str = verifier_text;
                } else {
                    result_str.push_str(&verifier_text);
                }
            }
        }

        let affected = report_affected_files(report.as_ref(), args);
        if !affected.is_empty() {
            self.emit(
                iteration,
                None,
                AgentEventKind::FilesChanged { paths: affected },
            );
        }

        ToolExecOutcome {
            result_str,
            success: true,
            finish_accepted: accepted,
            ..ToolExecOutcome::default()
        }
    }

    /// Verifier selection and execution around an accepted finish.
    /// Returns the text to merge into the finish result, or `None` when
    /// verification was skipped or failed open.
    pub(crate) async fn run_verifier_if_needed(
        &self,
        report: Option<&Map<String, Value>>,
        summary: &str,
    ) -> Option<String> {
        if !self.config.subagent_enabled {
            return None;
        }
        let (tags, has_write, hint, attempts) = {
            let session = self.session.lock();
            (
                session.task_tags.clone(),
                session.has_write_tool_call(),
                session.current_write_hint,
                session.verification_attempt_count,
            )
        };
        let level = resolve_verifier_level(&tags, has_write, hint);
        if level == VerifierLevel::Skip {
            return None;
        }
        // blocking is bounded; after the cap the level downgrades
        let blocking = level == VerifierLevel::Blocking && attempts < MAX_BLOCKING_ATTEMPTS;
        if blocking {
            self.session.lock().verification_attempt_count += 1;
        }
        self.run_finish_verifier(report, summary, blocking).await
    }

    async fn run_finish_verifier(
        &self,
        report: Option<&Map<String, Value>>,
        summary: &str,
        blocking: bool,
    ) -> Option<String> {
        let profile = self.subagents.get("verifier")?.clone();

        let write_log = {
            let session = self.session.lock();
            session
                .write_operations_log
                .iter()
                .map(|op| format!("- {} via {}", op.file_path, op.tool_name))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let report_json = report
            .map(|r| serde_json::to_string(r).unwrap_or_default())
            .unwrap_or_default();
        let task = format!(
            "Verify this completion report against the workspace files.\n\
             Report: {}\nSummary: {}\nRecorded writes:\n{}\n\
             Answer with one JSON object: {{\"verdict\": \"pass\"|\"fail\", \
             \"confidence\": \"high\"|\"medium\"|\"low\", \"issues\": [...], \"checks\": [...]}}",
            report_json, summary, write_log
        );

        let result = self.run_subagent(&profile, &task).await;
        if !result.success {
            // verifier failures are fail-open
            log::warn!("finish verifier failed open: {}", result.summary);
            return None;
        }
        let verdict = parse_verdict(&result.summary)?;
        Some(render_verdict(&verdict, blocking))
    }

    /// One-shot subagent run (no approval bridging); used by the
    /// verifier and other read-only delegations.
    pub(crate) async fn run_subagent(
        &self,
        profile: &SubagentProfile,
        task: &str,
    ) -> SubagentResult {
        let child = self.spawn_child(profile);
        let turn = match Box::pin(child.run_turn(task)).await {
            Ok(turn) => turn,
            Err(err) => {
                return SubagentResult {
                    success: false,
                    summary: err.to_string(),
                    subagent_name: profile.name.clone(),
                    structured_changes: Vec::new(),
                    pending_approval_id: None,
                }
            }
        };

        let structured_changes: Vec<String> = {
            let session = child.session.lock();
            let mut paths = Vec::new();
            for op in &session.write_operations_log {
                if !paths.contains(&op.file_path) {
                    paths.push(op.file_path.clone());
                }
            }
            paths
        };

        match turn.stop_reason {
            StopReason::Finished | StopReason::Completed => SubagentResult {
                success: true,
                summary: turn.reply,
                subagent_name: profile.name.clone(),
                structured_changes,
                pending_approval_id: None,
            },
            StopReason::PendingApproval { approval_id } => SubagentResult {
                success: false,
                summary: "subagent suspended on a high-risk approval".to_string(),
                subagent_name: profile.name.clone(),
                structured_changes,
                pending_approval_id: Some(approval_id),
            },
            other => SubagentResult {
                success: false,
                summary: format!("subagent stopped: {:?}", other),
                subagent_name: profile.name.clone(),
                structured_changes,
                pending_approval_id: None,
            },
        }
    }

    // ── blocking questions ─────────────────────────────────────

    /// Enqueue a question, emit the event, and await the answer with
    /// the session timeout and cancellation. The interaction slot is
    /// registered before the question becomes visible so a fast
    /// responder cannot race the registration.
    pub(crate) async fn ask_blocking_question(&self, question: PendingQuestion) -> AwaitOutcome {
        let question_id = question.question_id.clone();
        let rx = self.interactions.create(&question_id).await;

        self.emit(
            question.iteration,
            Some(question.tool_call_id.clone()),
            AgentEventKind::UserQuestion {
                question_id: question_id.clone(),
                header: question.header.clone(),
                text: question.text.clone(),
                options: question.options.clone(),
                multi_select: question.multi_select,
            },
        );
        self.question_flow.lock().enqueue(question);

        let outcome = InteractionRegistry::await_response(
            rx,
            self.config.interaction_timeout,
            &self.cancel_token,
        )
        .await;

        self.question_flow.lock().pop_current();
        self.interactions.cleanup_done().await;
        outcome
    }

    pub(crate) async fn handle_ask_user(
        &self,
        tool_call_id: &str,
        args: &Map<String, Value>,
        iteration: usize,
    ) -> ToolExecOutcome {
        let text = args
            .get("text")
            .or_else(|| args.get("question"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        if text.is_empty() {
            return ToolExecOutcome::err("tool argument error: text is required");
        }
        let header = args
            .get("header")
            .and_then(Value::as_str)
            .unwrap_or("Question")
            .to_string();
        let options = args
            .get("options")
            .and_then(Value::as_array)
            .map(|options| {
                options
                    .iter()
                    .filter_map(|o| {
                        Some(QuestionOption {
                            label: o.get("label")?.as_str()?.to_string(),
                            description: o
                                .get("description")
                                .and_then(Value::as_str)
                                .unwrap_or("")
                                .to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        let multi_select = args
            .get("multiSelect")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let question = PendingQuestion {
            question_id: new_question_id(),
            tool_call_id: tool_call_id.to_string(),
            header,
            text,
            options,
            multi_select,
            iteration,
        };

        match self.ask_blocking_question(question).await {
            AwaitOutcome::Resolved(payload) => ToolExecOutcome::ok(render_payload(&payload)),
            AwaitOutcome::TimedOut => ToolExecOutcome::ok(
                "The user did not answer within the wait window; continue without the answer.",
            ),
            AwaitOutcome::Cancelled => {
                ToolExecOutcome::ok("The question was cancelled; continue without the answer.")
            }
        }
    }

    pub(crate) async fn handle_suggest_mode_switch(
        &self,
        tool_call_id: &str,
        args: &Map<String, Value>,
        iteration: usize,
    ) -> ToolExecOutcome {
        let target_mode = args
            .get("target_mode")
            .and_then(Value::as_str)
            .unwrap_or("write")
            .trim()
            .to_string();
        let reason = args
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();

        let question = PendingQuestion {
            question_id: new_question_id(),
            tool_call_id: tool_call_id.to_string(),
            header: "Mode switch".to_string(),
            text: format!(
                "{}\n\nSwitch to {} mode?",
                reason, target_mode
            ),
            options: vec![
                QuestionOption {
                    label: format!("Switch to {}", target_mode),
                    description: format!("Continue in {} mode", target_mode),
                },
                QuestionOption {
                    label: "Keep current mode".to_string(),
                    description: "Do not switch".to_string(),
                },
            ],
            multi_select: false,
            iteration,
        };

        match self.ask_blocking_question(question).await {
            AwaitOutcome::Resolved(payload) => ToolExecOutcome::ok(render_payload(&payload)),
            AwaitOutcome::TimedOut | AwaitOutcome::Cancelled => ToolExecOutcome::ok(
                "The user did not respond to the mode switch suggestion; keep the current mode.",
            ),
        }
    }

    // ── plan intercept ─────────────────────────────────────────

    pub(crate) async fn handle_plan_intercept(
        &self,
        args: &Map<String, Value>,
    ) -> ToolExecOutcome {
        let title = match args.get("title").and_then(Value::as_str) {
            Some(title) if !title.trim().is_empty() => title.trim().to_string(),
            _ => return ToolExecOutcome::err("tool argument error: title is required"),
        };
        let detail = args
            .get("detail")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let plan_lines = {
            let mut session = self.session.lock();
            session.plan_tasks.push(PlanTask {
                title,
                detail,
                done: false,
            });
            session
                .plan_tasks
                .iter()
                .enumerate()
                .map(|(idx, task)| format!("{}. {}", idx + 1, task.title))
                .collect::<Vec<_>>()
        };

        let mut outcome = ToolExecOutcome::ok(format!(
            "📋 Plan proposal:\n{}\n\nReview the plan and confirm to proceed.",
            plan_lines.join("\n")
        ));
        outcome.defer_tool_result = true;
        outcome
    }

    // ── extract_table_spec ─────────────────────────────────────

    pub(crate) async fn handle_extract_table_spec(
        &self,
        args: &Map<String, Value>,
        iteration: usize,
    ) -> ToolExecOutcome {
        let file_path = args
            .get("file_path")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let output_path = args
            .get("output_path")
            .and_then(Value::as_str)
            .unwrap_or("outputs/replica_spec.json")
            .to_string();
        let skip_style = args
            .get("skip_style")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let Some(vision) = self.vision.clone() else {
            return ToolExecOutcome::err("the vision extraction pipeline is not configured");
        };

        let resolved = match crate::workspace::resolve_in_workspace(
            &file_path,
            self.workspace.root_dir(),
        ) {
            Ok(path) => path,
            Err(err) => return ToolExecOutcome::err(format!("path validation failed: {}", err)),
        };
        if !resolved.is_file() {
            return ToolExecOutcome::err(format!("file not found: {}", file_path));
        }
        let ext = resolved
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if !SUPPORTED_IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            return ToolExecOutcome::err(format!("unsupported image format: .{}", ext));
        }
        let size = resolved.metadata().map(|m| m.len()).unwrap_or(0);
        if size > MAX_IMAGE_SIZE_BYTES {
            return ToolExecOutcome::err(format!(
                "file too large: {} > {}",
                size, MAX_IMAGE_SIZE_BYTES
            ));
        }

        let bytes = match std::fs::read(&resolved) {
            Ok(bytes) => bytes,
            Err(err) => return ToolExecOutcome::err(format!("failed to read image: {}", err)),
        };
        use base64::Engine as _;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
        let mime = match ext.as_str() {
            "jpg" | "jpeg" => "image/jpeg",
            "gif" => "image/gif",
            "bmp" => "image/bmp",
            "webp" => "image/webp",
            _ => "image/png",
        };

        match vision
            .extract_table_spec(&encoded, mime, &output_path, skip_style)
            .await
        {
            Ok(result_str) => {
                let success = result_str.contains(r#""status": "ok""#)
                    || result_str.contains(r#""status":"ok""#);
                if success {
                    self.session.lock().record_write_action();
                    let rel_source = crate::workspace::to_workspace_relative(
                        &resolved,
                        self.workspace.root_dir(),
                    );
                    let name = std::path::Path::new(&output_path)
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| output_path.clone());
                    if let Err(err) = self.registry.register_agent_output(
                        &output_path,
                        &name,
                        Some(&rel_source),
                        Some(&self.session_id),
                        Some(iteration),
                        Some("extract_table_spec"),
                    ) {
                        log::debug!("spec output registration failed: {}", err);
                    }
                    let mut outcome = ToolExecOutcome::ok(result_str);
                    outcome.changed_files = vec![output_path];
                    outcome
                } else {
                    ToolExecOutcome::err(result_str)
                }
            }
            Err(err) => ToolExecOutcome::err(format!("table spec extraction failed: {}", err)),
        }
    }

    // ── code policy ────────────────────────────────────────────

    pub(crate) async fn handle_code_policy(
        &self,
        tool_call_id: &str,
        args: &Map<String, Value>,
        iteration: usize,
    ) -> ToolExecOutcome {
        let code = args
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let policy_engine = CodePolicyEngine::new(
            &self.config.code_policy_extra_safe_modules,
            &self.config.code_policy_extra_blocked_modules,
        );
        let analysis = policy_engine.analyze(&code);

        let auto_approved = |analysis: &CodeAnalysis| {
            (analysis.tier == RiskTier::Green && self.config.code_policy_green_auto_approve)
                || (analysis.tier == RiskTier::Yellow && self.config.code_policy_yellow_auto_approve)
        };

        if auto_approved(&analysis) || self.full_access_enabled() {
            return self
                .execute_code_with_policy(&code, args, &analysis, iteration)
                .await;
        }

        // RED (or not auto-approvable): try sanitizing the exit calls
        // and re-classifying before falling back to approval
        if analysis.tier == RiskTier::Red {
            if let Some(sanitized) = strip_exit_calls(&code) {
                let re_analysis = policy_engine.analyze(&sanitized);
                if auto_approved(&re_analysis) {
                    log::info!(
                        "run_code sanitized: {} -> {} (exit calls stripped)",
                        analysis.tier.as_str(),
                        re_analysis.tier.as_str()
                    );
                    let mut sanitized_args = args.clone();
                    sanitized_args
                        .insert("code".to_string(), Value::String(sanitized.clone()));
                    return self
                        .execute_code_with_policy(&sanitized, &sanitized_args, &re_analysis, iteration)
                        .await;
                }
            }
        }

        let pending =
            self.approval
                .lock()
                .create_pending("run_code", args.clone(), tool_call_id);
        self.emit(
            iteration,
            Some(tool_call_id.to_string()),
            AgentEventKind::PendingApproval {
                approval_id: pending.approval_id.clone(),
                tool_name: "run_code".to_string(),
            },
        );
        let details = analysis
            .details
            .iter()
            .take(3)
            .cloned()
            .collect::<Vec<_>>()
            .join("; ");
        let result_str = format!(
            "⚠️ The code contains high-risk operations and needs manual confirmation:\n\
             - risk tier: {}\n- detected: {}\n- details: {}\n{}",
            analysis.tier.as_str(),
            analysis.capability_summary(),
            details,
            ApprovalManager::format_pending_prompt(&pending),
        );
        log::info!(
            "run_code policy: tier={} -> pending approval {}",
            analysis.tier.as_str(),
            pending.approval_id
        );
        ToolExecOutcome {
            result_str,
            success: true,
            pending_approval: true,
            approval_id: Some(pending.approval_id),
            ..ToolExecOutcome::default()
        }
    }

    /// Shared execution path once the code is cleared to run: snapshot
    /// the declared spreadsheet targets, execute in the sandbox, merge
    /// CoW mappings, register outputs and emit diff events.
    async fn execute_code_with_policy(
        &self,
        code: &str,
        args: &Map<String, Value>,
        analysis: &CodeAnalysis,
        iteration: usize,
    ) -> ToolExecOutcome {
        let mut augmented = args.clone();
        augmented.insert(
            "sandbox_tier".to_string(),
            Value::String(analysis.tier.as_str().to_string()),
        );

        let targets = extract_excel_targets(code);
        let write_targets: Vec<String> = targets
            .iter()
            .filter(|t| t.operation == "write" || t.operation == "unknown")
            .map(|t| self.registry.resolve_for_tool(&t.file_path))
            .collect();
        let read_parent = targets
            .iter()
            .find(|t| t.operation == "read")
            .map(|t| self.registry.resolve_for_tool(&t.file_path));

        // pre-execution grids for the diff events
        let before: Vec<(String, Vec<Vec<String>>)> = write_targets
            .iter()
            .filter_map(|target| {
                let path = self.transaction.resolve_read(target).ok()?;
                Some((target.clone(), sheets::read_grid(&path)))
            })
            .collect();

        let (mut outcome, audit) = self.execute_tool_with_audit("run_code", &augmented, false).await;
        if !outcome.success {
            return outcome;
        }

        let has_cow = result_has_cow_mapping(&outcome.result_str);
        let has_ast_write = targets.iter().any(|t| t.operation == "write");
        let has_audit_changes = audit
            .as_ref()
            .map(|a| !a.changes.is_empty())
            .unwrap_or(false);
        if has_cow || has_ast_write || has_audit_changes {
            self.session.lock().record_write_action();
            for target in &write_targets {
                if !outcome.changed_files.contains(target) {
                    outcome.changed_files.push(target.clone());
                }
            }
        }

        // register files the run created as agent outputs
        for path in outcome.changed_files.clone() {
            if self.registry.get_by_path(&path).is_none() {
                let name = std::path::Path::new(&path)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| path.clone());
                if let Err(err) = self.registry.register_agent_output(
                    &path,
                    &name,
                    read_parent.as_deref(),
                    Some(&self.session_id),
                    Some(iteration),
                    Some("run_code"),
                ) {
                    log::debug!("output registration failed for {}: {}", path, err);
                }
            }
        }

        // sheet-level diff events for the declared targets
        for (target, before_grid) in before {
            let Ok(after_path) = self.transaction.resolve_read(&target) else {
                continue;
            };
            let after_grid = sheets::read_grid(&after_path);
            let (changes, affected_range) = sheets::diff_grids(&before_grid, &after_grid);
            if changes.is_empty() {
                continue;
            }
            self.emit(
                iteration,
                None,
                AgentEventKind::ExcelDiff {
                    file_path: target.clone(),
                    sheet: sheets::first_sheet_name(&after_path),
                    affected_range,
                    changes,
                },
            );
        }

        log::info!(
            "run_code policy: tier={} auto_approved=true caps=[{}]",
            analysis.tier.as_str(),
            analysis.capability_summary()
        );
        outcome
    }

    // ── audit-only and high-risk ───────────────────────────────

    pub(crate) async fn handle_audit_only(
        &self,
        tool_name: &str,
        args: &Map<String, Value>,
        iteration: usize,
    ) -> ToolExecOutcome {
        let undoable = {
            let approval = self.approval.lock();
            !approval.is_read_only_safe_tool(tool_name)
                && tool_name != "run_code"
                && tool_name != "run_shell"
        };

        // grid snapshot of the target file for the diff event
        let file_target = args
            .get("file")
            .and_then(Value::as_str)
            .map(|f| self.registry.resolve_for_tool(f));
        let before_grid = file_target.as_ref().and_then(|target| {
            let path = self.transaction.resolve_read(target).ok()?;
            Some(sheets::read_grid(&path))
        });

        let (outcome, _audit) = self.execute_tool_with_audit(tool_name, args, undoable).await;

        if outcome.success {
            if let (Some(target), Some(before)) = (file_target, before_grid) {
                if let Ok(after_path) = self.transaction.resolve_read(&target) {
                    let after_grid = sheets::read_grid(&after_path);
                    let (changes, affected_range) = sheets::diff_grids(&before, &after_grid);
                    if !changes.is_empty() {
                        self.emit(
                            iteration,
                            None,
                            AgentEventKind::ExcelDiff {
                                file_path: target,
                                sheet: sheets::first_sheet_name(&after_path),
                                affected_range,
                                changes,
                            },
                        );
                    }
                }
            }
        }
        outcome
    }

    pub(crate) async fn handle_high_risk(
        &self,
        tool_name: &str,
        tool_call_id: &str,
        args: &Map<String, Value>,
        iteration: usize,
    ) -> ToolExecOutcome {
        if !self.full_access_enabled() {
            let pending =
                self.approval
                    .lock()
                    .create_pending(tool_name, args.clone(), tool_call_id);
            self.emit(
                iteration,
                Some(tool_call_id.to_string()),
                AgentEventKind::PendingApproval {
                    approval_id: pending.approval_id.clone(),
                    tool_name: tool_name.to_string(),
                },
            );
            return ToolExecOutcome {
                result_str: ApprovalManager::format_pending_prompt(&pending),
                success: true,
                pending_approval: true,
                approval_id: Some(pending.approval_id),
                ..ToolExecOutcome::default()
            };
        }
        let (outcome, _audit) = self.execute_tool_with_audit(tool_name, args, true).await;
        outcome
    }

    // ── default ────────────────────────────────────────────────

    pub(crate) async fn handle_default(
        &self,
        tool_name: &str,
        args: &Map<String, Value>,
    ) -> ToolExecOutcome {
        self.call_registry_tool(tool_name, args).await
    }
}

/// Render an answer payload into the tool-result string.
fn render_payload(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_else(|_| other.to_string()),
    }
}

/// Whether an answer payload selects the given option label.
fn payload_picks(payload: &Value, label: &str) -> bool {
    let matches_label = |s: &str| s.eq_ignore_ascii_case(label);
    match payload {
        Value::String(s) => matches_label(s),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .any(matches_label),
        Value::Object(map) => map
            .get("answer")
            .or_else(|| map.get("decision"))
            .or_else(|| map.get("selection"))
            .map(|v| payload_picks(v, label))
            .unwrap_or(false),
        _ => false,
    }
}
