//! The monologue loop: plan, act, observe, repeat.

use futures::StreamExt;
use itak_checkpoint::CheckpointRecord;
use itak_core::{
    Classify, ErrorKind, StepState, StepStatus, SurfacedError, Task, TaskId, TaskStatus, Turn,
    WorkingContext,
};
use itak_heal::{Decision, HealContext, RepairStrategy};
use itak_hooks::{HookContext, LifecyclePoint};
use itak_llm::{ChatRequest, Message, ModelRole, StreamEvent};
use itak_store::TaskStore;
use itak_tools::ToolContext;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::intent::{IntentOutcome, parse_intent};
use crate::progress::{PresenceState, ProgressEvent};
use crate::runtime::AgentRuntime;
use crate::session::AgentSession;

impl AgentRuntime {
    /// Run one monologue for one user message. Exactly one `Final` event
    /// is published per call.
    #[allow(clippy::too_many_lines)]
    pub(crate) async fn run_monologue(
        self: &Arc<Self>,
        session_arc: &Arc<Mutex<AgentSession>>,
        content: &str,
        cancel: &CancellationToken,
    ) {
        let mut session = session_arc.lock().await;
        let key = session.key.clone();
        let principal = session.principal.clone();

        let _ = self
            .services
            .hooks
            .dispatch(
                HookContext::new(LifecyclePoint::MonologueStart).with_session(key.clone()),
            )
            .await;

        self.append_turn(&mut session, Turn::user(content)).await;

        if session.working.is_none() {
            let mut task = Task::new(
                content.chars().take(60).collect::<String>(),
                content,
                key.clone(),
            );
            let _ = task.transition(TaskStatus::InProgress);
            if let Err(e) = self.services.tasks.upsert_task(&task).await {
                warn!(error = %e, "Task record write failed");
            }
            session.working = Some(WorkingContext::new(task.id));
        }

        let mut consecutive_parse_failures = 0u32;
        let mut pending_compression = false;
        let mut last_strategy: Option<(HealContext, RepairStrategy)> = None;
        let mut final_text: Option<String> = None;
        let mut failed = false;
        let mut plan_announced = false;

        let max_iterations = self.config.max_iterations;
        let mut iteration = 0u32;

        while iteration < max_iterations {
            iteration = iteration.saturating_add(1);
            if let Some(working) = session.working.as_mut() {
                working.iteration_count = iteration;
            }

            if cancel.is_cancelled() {
                self.finish_cancelled(&mut session, iteration).await;
                return;
            }

            let _ = self
                .services
                .hooks
                .dispatch(
                    HookContext::new(LifecyclePoint::MessageLoopStart)
                        .with_session(key.clone()),
                )
                .await;

            // Pressure from the previous iteration applies now, not to the
            // prompt that crossed the threshold.
            if pending_compression {
                pending_compression = false;
                self.compress_session(&mut session).await;
            }

            // Prompt assembly.
            let _ = self
                .services
                .hooks
                .dispatch(
                    HookContext::new(LifecyclePoint::PromptAssembleBefore)
                        .with_session(key.clone()),
                )
                .await;

            let request = match self.assemble_prompt(&session, content).await {
                Ok(request) => request,
                Err(report) => {
                    failed = true;
                    final_text = Some(self.surface_error(&mut session, report).await);
                    break;
                },
            };

            let _ = self
                .services
                .hooks
                .dispatch(
                    HookContext::new(LifecyclePoint::PromptAssembleAfter)
                        .with_session(key.clone()),
                )
                .await;

            // Pressure check for the next iteration.
            let window = self.services.router.context_window(ModelRole::Chat);
            #[allow(clippy::cast_precision_loss)]
            let utilization = session.estimated_tokens() as f32 / window.max(1) as f32;
            if utilization >= self.services.fabric.soft_pressure() {
                pending_compression = true;
            }
            if utilization >= self.services.fabric.hard_pressure() {
                if let Err(e) = self.services.fabric.demote_stale(principal.id).await {
                    warn!(error = %e, "Demotion pass failed");
                }
            }

            // Model call.
            self.publish(ProgressEvent::Presence {
                session: key.clone(),
                state: PresenceState::Thinking,
            });
            let _ = self
                .services
                .hooks
                .dispatch(
                    HookContext::new(LifecyclePoint::LlmCallBefore).with_session(key.clone()),
                )
                .await;

            let response = match self.stream_chat(&key, principal.id, request, cancel).await {
                Ok(text) => text,
                Err(report) if report.kind == ErrorKind::Cancelled => {
                    self.finish_cancelled(&mut session, iteration).await;
                    return;
                },
                Err(report) => {
                    // Router-level fallback already ran; what reaches us is
                    // exhausted or non-transient. Give the healer one look.
                    let heal_ctx = HealContext {
                        session: key.clone(),
                        principal: principal.id,
                        kind: report.kind,
                        message: report.message.clone(),
                        step: session.working.as_ref().map(|w| w.current_step),
                    };
                    match self.services.healer.handle(&heal_ctx).await {
                        Decision::Retry { strategy, backoff } => {
                            tokio::time::sleep(backoff).await;
                            last_strategy = Some((heal_ctx, strategy));
                            continue;
                        },
                        Decision::Surface(report) | Decision::Fatal(report) => {
                            failed = true;
                            final_text = Some(self.surface_error(&mut session, report).await);
                            break;
                        },
                    }
                },
            };

            let _ = self
                .services
                .hooks
                .dispatch(
                    HookContext::new(LifecyclePoint::LlmCallAfter).with_session(key.clone()),
                )
                .await;

            // A model call that succeeded after a repair proves the
            // strategy; persist it.
            if let Some((heal_ctx, strategy)) = last_strategy.take() {
                self.services.healer.record_success(&heal_ctx, &strategy).await;
            }

            match parse_intent(&response) {
                IntentOutcome::Response { text } => {
                    self.append_turn(&mut session, Turn::assistant(text.clone())).await;
                    final_text = Some(text);
                    break;
                },
                IntentOutcome::Tool { name, args } => {
                    consecutive_parse_failures = 0;
                    self.append_turn(&mut session, Turn::assistant(response.clone())).await;

                    if !plan_announced {
                        plan_announced = true;
                        self.publish(ProgressEvent::Plan {
                            session: key.clone(),
                            steps: vec![name.clone()],
                        });
                    }

                    match self
                        .dispatch_tool(&mut session, &name, args, iteration, cancel)
                        .await
                    {
                        ToolFlow::Continue => {},
                        ToolFlow::Retry(heal_ctx, strategy, backoff) => {
                            tokio::time::sleep(backoff).await;
                            let notice = Turn::system(format!("Repair plan: {}", strategy.plan));
                            self.append_turn(&mut session, notice).await;
                            last_strategy = Some((heal_ctx, strategy));
                        },
                        ToolFlow::Stop(report) => {
                            failed = true;
                            final_text = Some(self.surface_error(&mut session, report).await);
                            break;
                        },
                        ToolFlow::Cancelled => {
                            self.finish_cancelled(&mut session, iteration).await;
                            return;
                        },
                    }
                },
                IntentOutcome::ParseError { reason } => {
                    consecutive_parse_failures = consecutive_parse_failures.saturating_add(1);
                    if consecutive_parse_failures >= self.config.max_consecutive_parse_failures {
                        let report = SurfacedError::new(
                            ErrorKind::InternalInvariant,
                            format!(
                                "the model failed to produce a structured intent {consecutive_parse_failures} times in a row ({reason})"
                            ),
                        );
                        failed = true;
                        final_text = Some(self.surface_error(&mut session, report).await);
                        break;
                    }
                    debug!(session = %key, reason, "Parse failure, feeding correction");
                    let correction = Turn::system(format!(
                        "Your last output could not be parsed ({reason}). Reply with exactly \
                         one JSON object: {{\"tool\": \"<name>\", \"args\": {{...}}}}."
                    ));
                    self.append_turn(&mut session, correction).await;
                },
            }

            self.save_checkpoint(&session, iteration, false).await;
        }

        // Budget exhausted without a terminal tool: synthesize the final.
        let final_text = final_text.unwrap_or_else(|| {
            warn!(session = %key, "Iteration budget exhausted");
            "I ran out of reasoning budget before finishing this task. Here is where I \
             stopped; send a follow-up to continue."
                .to_string()
        });

        if let Some(working) = session.working.as_mut() {
            working.terminal = true;
        }
        self.save_checkpoint(&session, iteration, true).await;
        if let Some(working) = session.working.take() {
            self.close_task(working.task_id, !failed).await;
        }

        self.publish(ProgressEvent::Presence {
            session: key.clone(),
            state: PresenceState::Idle,
        });
        self.publish(ProgressEvent::Final {
            session: key.clone(),
            text: final_text,
        });
        let _ = self
            .services
            .hooks
            .dispatch(HookContext::new(LifecyclePoint::MonologueEnd).with_session(key.clone()))
            .await;
    }

    /// Assemble the chat request: core tier, tool prompts, memory
    /// context, transcript tail.
    async fn assemble_prompt(
        &self,
        session: &AgentSession,
        query: &str,
    ) -> Result<ChatRequest, SurfacedError> {
        let core = self.services.fabric.core_context().unwrap_or_else(|e| {
            warn!(error = %e, "Core tier unreadable");
            String::new()
        });
        let tools = self
            .services
            .executor
            .registry()
            .prompt_block(session.principal.role);

        let memory_block = match self
            .services
            .fabric
            .search(session.principal.id, query, self.config.memory_k)
            .await
        {
            Ok(hits) if !hits.is_empty() => {
                let listing = hits
                    .iter()
                    .map(|e| format!("- {}", e.content))
                    .collect::<Vec<_>>()
                    .join("\n");
                format!("# Relevant memories\n{listing}\n")
            },
            Ok(_) => String::new(),
            Err(e) => {
                // Reads must survive partial store outages.
                warn!(error = %e, "Memory search failed during prompt assembly");
                String::new()
            },
        };

        let system = format!(
            "{core}\n{tools}\n{memory_block}\n\
             Work step by step. Every reply must be exactly one JSON object of the form \
             {{\"tool\": \"<name>\", \"args\": {{...}}}}. Finish with the `response` tool."
        );

        let messages: Vec<Message> = session
            .tail(self.config.history_tail)
            .iter()
            .map(|turn| match turn.role {
                itak_core::TurnRole::User => Message::user(&turn.content),
                itak_core::TurnRole::Assistant => Message::assistant(&turn.content),
                itak_core::TurnRole::Tool => Message::tool(&turn.content),
                itak_core::TurnRole::System => {
                    Message::user(format!("[system] {}", turn.content))
                },
            })
            .collect();

        Ok(ChatRequest::new(system, messages).max_tokens(1024))
    }

    /// Drive the chat stream, firing the per-chunk hook, and return the
    /// redacted accumulated text.
    async fn stream_chat(
        &self,
        key: &itak_core::SessionKey,
        principal: itak_core::PrincipalId,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<String, SurfacedError> {
        let mut stream = self
            .services
            .router
            .stream(ModelRole::Chat, principal, request)
            .map_err(|e| SurfacedError::new(e.kind(), e.to_string()))?;

        let mut text = String::new();
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => return Err(SurfacedError::new(ErrorKind::Cancelled, "cancelled")),
                event = stream.next() => event,
            };
            match event {
                Some(Ok(StreamEvent::Started { provider, model })) => {
                    debug!(provider, model, "Stream attempt started");
                    text.clear();
                },
                Some(Ok(StreamEvent::Delta(delta))) => {
                    text.push_str(&delta);
                    // Hot path: handlers must hand real work to the
                    // background worker and return.
                    let _ = self
                        .services
                        .hooks
                        .dispatch(
                            HookContext::new(LifecyclePoint::LlmStreamChunk)
                                .with_session(key.clone())
                                .with_data("len", Value::from(delta.len())),
                        )
                        .await;
                },
                Some(Ok(StreamEvent::Done { .. })) => break,
                Some(Err(e)) => {
                    return Err(SurfacedError::new(e.kind(), e.to_string()));
                },
                None => {
                    return Err(SurfacedError::new(
                        ErrorKind::ProviderTransient,
                        "stream ended without completion",
                    ));
                },
            }
        }
        Ok(self.services.guard.redact(&text))
    }

    /// Dispatch one tool call with progress, checkpointing, and healing.
    async fn dispatch_tool(
        self: &Arc<Self>,
        session: &mut AgentSession,
        name: &str,
        args: Value,
        iteration: u32,
        cancel: &CancellationToken,
    ) -> ToolFlow {
        let key = session.key.clone();
        let step = session
            .working
            .as_ref()
            .map_or(0, |w| w.current_step);

        if let Some(working) = session.working.as_mut() {
            working.plan.push(StepState {
                description: name.to_string(),
                status: StepStatus::Active,
                summary: None,
            });
            working.current_step = working.plan.len().saturating_sub(1);
        }

        self.publish(ProgressEvent::StepStart {
            session: key.clone(),
            step,
            description: name.to_string(),
        });
        self.publish(ProgressEvent::Presence {
            session: key.clone(),
            state: if name == "web_search" || name == "memory_load" {
                PresenceState::Searching
            } else {
                PresenceState::ToolUse
            },
        });

        // Force a checkpoint before the long external call, with the
        // pending tool recorded.
        let call = itak_core::ToolCall {
            name: name.to_string(),
            args: args.clone(),
            caller_principal: session.principal.id,
            session_key: key.clone(),
            iteration,
        };
        if let Some(working) = session.working.as_ref() {
            let record = CheckpointRecord::new(key.clone(), working.clone(), iteration)
                .with_history_tail(session.tail(10).to_vec())
                .with_pending_tool(call.clone());
            if let Err(e) = self.services.checkpoints.checkpoint_forced(&record).await {
                error!(error = %e, "Pre-dispatch checkpoint failed");
            }
        }

        let ctx = self.tool_context(session, iteration, cancel).await;
        let started = std::time::Instant::now();
        let result = self
            .services
            .executor
            .dispatch(name, args, &ctx, cancel)
            .await;

        match result {
            Ok(output) => {
                let summary: String = output.content.chars().take(120).collect();
                if let Some(working) = session.working.as_mut() {
                    working.complete_step(summary.clone());
                    working.artifacts.extend(output.artifacts.iter().cloned());
                }
                self.publish(ProgressEvent::StepEnd {
                    session: key.clone(),
                    step,
                    summary,
                    ok: true,
                });
                let turn = Turn::tool(output.content.clone()).with_metadata(serde_json::json!({
                    "tool": name,
                    "duration_ms": output.duration.as_millis(),
                    "artifacts": output.artifacts.iter().map(|a| a.id.to_string()).collect::<Vec<_>>(),
                }));
                self.append_turn(session, turn).await;
                ToolFlow::Continue
            },
            Err(e) if matches!(e.kind(), ErrorKind::Cancelled) => ToolFlow::Cancelled,
            Err(e) => {
                let message = e.to_string();
                if let Some(working) = session.working.as_mut() {
                    working.errors_seen.push(itak_heal::signature(&message));
                    if let Some(active) = working.plan.get_mut(working.current_step) {
                        active.status = StepStatus::Failed;
                    }
                }
                self.publish(ProgressEvent::StepEnd {
                    session: key.clone(),
                    step,
                    summary: message.clone(),
                    ok: false,
                });
                let turn = itak_tools::error_output(&e, started.elapsed());
                self.append_turn(session, Turn::tool(format!("ERROR: {}", turn.error.unwrap_or(message.clone())))).await;

                let _ = self
                    .services
                    .hooks
                    .dispatch(
                        HookContext::new(LifecyclePoint::ErrorClassify)
                            .with_session(key.clone())
                            .with_data("kind", Value::String(e.kind().to_string()))
                            .with_data("tool", Value::String(name.to_string())),
                    )
                    .await;
                let heal_ctx = HealContext {
                    session: key.clone(),
                    principal: session.principal.id,
                    kind: e.kind(),
                    message,
                    step: Some(step),
                };
                match self.services.healer.handle(&heal_ctx).await {
                    Decision::Retry { strategy, backoff } => {
                        ToolFlow::Retry(heal_ctx, strategy, backoff)
                    },
                    Decision::Surface(report) => ToolFlow::Stop(report),
                    Decision::Fatal(report) => {
                        error!(session = %key, %report, "Fatal tool failure");
                        ToolFlow::Stop(report)
                    },
                }
            },
        }
    }

    /// Build the per-turn tool context with the sub-agent spawner
    /// injected.
    async fn tool_context(
        self: &Arc<Self>,
        session: &AgentSession,
        iteration: u32,
        cancel: &CancellationToken,
    ) -> ToolContext {
        let mut ctx = ToolContext::new(
            session.principal.clone(),
            session.key.clone(),
            self.services.work_root.join(session.key.as_path_segment()),
            self.services.sessions.media_dir(&session.key),
            Arc::clone(&self.services.vault),
            self.services.guard.clone(),
            self.services.fabric.clone(),
            Arc::clone(&self.services.graph),
            self.services.ssrf.clone(),
        );
        ctx.set_iteration(iteration);
        let spawner = self.coordinator.spawner_for(
            &session.key,
            &session.principal,
            "primary",
            cancel.child_token(),
        );
        ctx.set_spawner(Some(spawner)).await;
        ctx
    }

    async fn append_turn(&self, session: &mut AgentSession, turn: Turn) {
        let _ = self
            .services
            .hooks
            .dispatch(
                HookContext::new(LifecyclePoint::HistoryAppendBefore)
                    .with_session(session.key.clone())
                    .with_data("role", Value::String(turn.role.to_string())),
            )
            .await;
        if let Err(e) = self.services.sessions.persist_turn(&session.key, &turn).await {
            warn!(error = %e, "Transcript persist failed");
        }
        session.append(turn);
    }

    /// Soft pressure: compress the oldest raw block into a summary.
    async fn compress_session(&self, session: &mut AgentSession) {
        let block = session.oldest_raw_block(self.config.compress_block);
        if block.len() < 2 {
            return;
        }
        match self
            .services
            .fabric
            .compress_turns(session.principal.id, &session.key, &block)
            .await
        {
            Ok(summary) => {
                info!(session = %session.key, turns = block.len(), "Compressing transcript block");
                let _ = self
                    .services
                    .sessions
                    .persist_turn(&session.key, &summary)
                    .await;
                session.compact(block.len(), summary);
            },
            Err(e) => warn!(error = %e, "Compression failed"),
        }
    }

    async fn save_checkpoint(&self, session: &AgentSession, iteration: u32, forced: bool) {
        let Some(working) = session.working.as_ref() else {
            return;
        };
        let record = CheckpointRecord::new(session.key.clone(), working.clone(), iteration)
            .with_history_tail(session.tail(10).to_vec());
        let result = if forced {
            self.services.checkpoints.checkpoint_forced(&record).await.map(|()| true)
        } else {
            self.services.checkpoints.checkpoint(&record).await
        };
        if let Err(e) = result {
            error!(error = %e, "Checkpoint failed");
        }
    }

    /// Move the monologue's task record to a terminal state.
    async fn close_task(&self, task_id: TaskId, success: bool) {
        let Ok(Some(mut task)) = self.services.tasks.get_task(task_id).await else {
            return;
        };
        let target = if success { TaskStatus::Done } else { TaskStatus::Failed };
        if task.transition(target).is_ok() {
            let _ = self.services.tasks.upsert_task(&task).await;
        }
    }

    /// Surface a structured error as the single user-visible response.
    async fn surface_error(&self, session: &mut AgentSession, report: SurfacedError) -> String {
        self.publish(ProgressEvent::Error {
            session: session.key.clone(),
            report: report.clone(),
        });
        self.publish(ProgressEvent::Presence {
            session: session.key.clone(),
            state: PresenceState::Error,
        });
        let text = report.to_string();
        self.append_turn(session, Turn::assistant(text.clone())).await;
        text
    }

    async fn finish_cancelled(&self, session: &mut AgentSession, iteration: u32) {
        info!(session = %session.key, "Monologue cancelled");
        if let Some(working) = session.working.as_mut() {
            working.cancelled = true;
        }
        self.save_checkpoint(session, iteration, true).await;
        session.working = None;

        let text = "Cancelled.".to_string();
        self.append_turn(session, Turn::assistant(text.clone())).await;
        self.publish(ProgressEvent::Final {
            session: session.key.clone(),
            text,
        });
        let _ = self
            .services
            .hooks
            .dispatch(
                HookContext::new(LifecyclePoint::MonologueEnd)
                    .with_session(session.key.clone()),
            )
            .await;
    }
}

/// Control-flow outcome of one tool dispatch.
enum ToolFlow {
    /// Result observed; continue iterating.
    Continue,
    /// Healer granted a retry.
    Retry(HealContext, RepairStrategy, std::time::Duration),
    /// Surface and terminate.
    Stop(SurfacedError),
    /// Cancellation hit mid-dispatch.
    Cancelled,
}
