//! End-to-end scenarios across the full runtime.

use itak_core::{Principal, Role, RoomType, SessionKey, TurnRole};
use itak_integration_tests::{DelayedProvider, HarnessBuilder, response_json, tool_json};
use itak_limits::{CostBudgetConfig, LimiterConfig, ReserveRequest, WindowKind};
use itak_llm::{ModelBinding, ModelRole, ScriptedAction};
use itak_runtime::{InboundMessage, SubAgentProfile};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn principal_with_bindings() -> Principal {
    Principal::new("dawn", Role::Owner)
        .with_binding("discord", "D")
        .with_binding("telegram", "T")
}

fn inbound(principal: &Principal, channel: &str, room: &str, content: &str) -> InboundMessage {
    InboundMessage {
        session_key: SessionKey::new(channel, RoomType::Direct, room),
        principal: principal.clone(),
        content: content.to_string(),
    }
}

// Scenario: a fact saved on one channel is retrievable from another
// session of the same principal.
#[tokio::test(flavor = "multi_thread")]
async fn cross_channel_memory() {
    let h = HarnessBuilder::new()
        .chat_script(vec![
            // Discord: save the fact, confirm.
            ScriptedAction::Complete(tool_json(
                "memory_save",
                serde_json::json!({"content": "the VPS port is 48920"}),
            )),
            ScriptedAction::Complete(response_json("Noted: the VPS port is 48920.")),
            // Telegram: load it, answer.
            ScriptedAction::Complete(tool_json(
                "memory_load",
                serde_json::json!({"query": "VPS port"}),
            )),
            ScriptedAction::Complete(response_json("The VPS is on port 48920.")),
        ])
        .build();
    let principal = principal_with_bindings();

    let discord_reply = h
        .runtime
        .submit_and_wait(
            inbound(&principal, "discord", "D", "Remember: the VPS port is 48920."),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
    assert!(discord_reply.contains("48920"));
    h.fabric.flush_derivations(Duration::from_secs(2)).await;

    let telegram_reply = h
        .runtime
        .submit_and_wait(
            inbound(&principal, "telegram", "T", "What port is the VPS on?"),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
    assert!(telegram_reply.contains("48920"));

    // The retrieval was real: the telegram session's tool turn carries
    // the entry saved from discord.
    let key = SessionKey::new("telegram", RoomType::Direct, "T");
    let session = h.runtime.services().sessions.get(&key).unwrap();
    let session = session.lock().await;
    let tool_turn = session
        .transcript
        .iter()
        .find(|t| t.role == TurnRole::Tool)
        .expect("telegram session ran memory_load");
    assert!(tool_turn.content.contains("48920"));
}

// Scenario: mid-stream provider failure falls back; the caller sees only
// the second provider's output and only its cost is committed.
#[tokio::test(flavor = "multi_thread")]
async fn provider_fallback_discards_partial_output() {
    let backup = Arc::new(itak_llm::ScriptedProvider::new(
        "backup",
        vec![ScriptedAction::Chunks(vec![
            response_json("answer from the backup model"),
        ])],
    ));
    let h = HarnessBuilder::new()
        .chat_script(vec![ScriptedAction::FailMidStream {
            chunks: vec!["par".into(), "tial".into()],
            error: "503 mid-stream".into(),
        }])
        .provider(backup)
        .chat_bindings(vec![
            ModelBinding::new("scripted", "model_x").free_model(),
            ModelBinding::new("backup", "model_y").free_model(),
        ])
        .build();
    let principal = principal_with_bindings();

    let reply = h
        .runtime
        .submit_and_wait(
            inbound(&principal, "discord", "D", "hello"),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
    assert_eq!(reply, "answer from the backup model");
    assert!(!reply.contains("partial"));
}

// Scenario: a hard daily budget denies the reservation before any
// provider call; the user sees a budget error and the counter is
// unchanged.
#[tokio::test(flavor = "multi_thread")]
async fn hard_budget_blocks_before_any_provider_call() {
    let h = HarnessBuilder::new()
        .chat_script(vec![ScriptedAction::Complete(response_json("unreachable"))])
        .chat_bindings(vec![ModelBinding::new("scripted", "paid-model")])
        .limits(LimiterConfig {
            budgets: CostBudgetConfig {
                daily_usd: Some(1.0),
                weekly_usd: None,
                monthly_usd: None,
                soft_percent: 80,
                hard_percent: 100,
            },
            ..LimiterConfig::default()
        })
        .build();
    let principal = principal_with_bindings();

    // Spend $0.99 of the $1.00 budget.
    let reservation = h
        .limiter
        .reserve(&ReserveRequest::new(principal.id, 0.99))
        .unwrap();
    h.limiter.commit(reservation, 0.99, 1000, 100);
    let before = h.limiter.usage(WindowKind::Daily);

    let reply = h
        .runtime
        .submit_and_wait(
            inbound(&principal, "discord", "D", "an expensive question"),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
    assert!(reply.contains("budget"));
    assert_eq!(h.chat_provider.calls(), 0);
    assert_eq!(h.limiter.usage(WindowKind::Daily), before);
}

// Scenario: killed between a tool result landing and the next iteration.
// The restart resumes from the checkpoint: a system turn notes the
// resume, the step position survives, and the finished tool is not run
// again.
#[tokio::test(flavor = "multi_thread")]
async fn crash_resume_continues_from_checkpoint() {
    let h = HarnessBuilder::new()
        .chat_script(vec![ScriptedAction::Complete(response_json(
            "continuing from where we stopped",
        ))])
        .build();
    let principal = principal_with_bindings();
    let key = SessionKey::new("discord", RoomType::Direct, "D");

    // Reconstruct the on-disk state a crash leaves behind: the transcript
    // already holds the third step's tool result, the checkpoint is at
    // iteration 3.
    let services = h.runtime.services();
    services
        .sessions
        .persist_turn(&key, &itak_core::Turn::user("run the five-step task"))
        .await
        .unwrap();
    services
        .sessions
        .persist_turn(&key, &itak_core::Turn::tool("step 3 result: scan finished"))
        .await
        .unwrap();
    let mut working = itak_core::WorkingContext::new(itak_core::TaskId::new());
    working.current_step = 2;
    working.iteration_count = 3;
    services
        .checkpoints
        .checkpoint_forced(&itak_checkpoint::CheckpointRecord::new(
            key.clone(),
            working,
            3,
        ))
        .await
        .unwrap();

    // "Restart": resume scan over the checkpoint directory.
    let principal_for_resume = principal.clone();
    h.runtime
        .resume_all(move |_| Some(principal_for_resume.clone()))
        .await;
    {
        let session = h.runtime.services().sessions.get(&key).unwrap();
        let session = session.lock().await;
        assert!(
            session
                .transcript
                .iter()
                .any(|t| t.role == TurnRole::System && t.content.contains("resuming"))
        );
        assert_eq!(session.working.as_ref().unwrap().current_step, 2);
    }

    // The next message continues the task without re-running the tool.
    let reply = h
        .runtime
        .submit_and_wait(
            inbound(&principal, "discord", "D", "continue"),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
    assert_eq!(reply, "continuing from where we stopped");
    assert_eq!(h.chat_provider.calls(), 1);

    let session = h.runtime.services().sessions.get(&key).unwrap();
    let session = session.lock().await;
    let tool_turns = session
        .transcript
        .iter()
        .filter(|t| t.role == TurnRole::Tool)
        .count();
    assert_eq!(tool_turns, 1, "the finished tool must not run again");
}

// Scenario: an SSRF target is blocked before any network I/O and the
// failure is fatal, not retried.
#[tokio::test(flavor = "multi_thread")]
async fn ssrf_target_is_fatal() {
    let h = HarnessBuilder::new()
        .chat_script(vec![
            ScriptedAction::Complete(tool_json(
                "browser",
                serde_json::json!({"url": "http://169.254.169.254/latest/meta-data"}),
            )),
            // Would only run if the healer (wrongly) granted a retry.
            ScriptedAction::Complete(response_json("should never be reached")),
        ])
        .build();
    let principal = principal_with_bindings();

    let reply = h
        .runtime
        .submit_and_wait(
            inbound(&principal, "discord", "D", "fetch the cloud metadata"),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
    assert!(reply.contains("policy_violation"));
    assert!(!reply.contains("should never be reached"));
    // One model call produced the tool intent; no retry consumed more.
    assert_eq!(h.chat_provider.calls(), 1);
}

// Scenario: wait-first swarm returns the fastest sub-agent and abandons
// the slow peers.
#[tokio::test(flavor = "multi_thread")]
async fn wait_first_swarm_cancels_peers() {
    let delayed = Arc::new(DelayedProvider::new("delayed"));
    let h = HarnessBuilder::new()
        .chat_script(vec![
            ScriptedAction::Complete(tool_json(
                "delegate_task",
                serde_json::json!({
                    "profile": "prober",
                    "subtasks": ["slow angle one", "the fast angle", "slow angle three"],
                    "strategy": "parallel",
                    "wait": "first",
                    "merge": "concat"
                }),
            )),
            ScriptedAction::Complete(response_json("winner: fast result")),
        ])
        .provider(Arc::clone(&delayed) as Arc<dyn itak_llm::Provider>)
        .utility_bindings(vec![ModelBinding::new("delayed", "probe").free_model()])
        .profiles(vec![SubAgentProfile {
            name: "prober".into(),
            role: ModelRole::Utility,
            tool_allowlist: vec!["response".into()],
            max_iterations: 3,
            system_overlay: "Answer immediately with the response tool.".into(),
        }])
        .build();
    let principal = principal_with_bindings();

    let started = Instant::now();
    let reply = h
        .runtime
        .submit_and_wait(
            inbound(&principal, "discord", "D", "probe all angles"),
            Duration::from_secs(15),
        )
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(reply, "winner: fast result");
    // The fast peer won well before the slow peers' five-second sleeps.
    assert!(elapsed < Duration::from_secs(4), "took {elapsed:?}");
    // Only the fast call ran to completion; the cancelled peers never
    // finished.
    assert_eq!(delayed.completed(), 1);

    // The parent transcript carries only the merged result.
    let key = SessionKey::new("discord", RoomType::Direct, "D");
    let session = h.runtime.services().sessions.get(&key).unwrap();
    let session = session.lock().await;
    let tool_turn = session
        .transcript
        .iter()
        .find(|t| t.role == TurnRole::Tool)
        .unwrap();
    assert!(tool_turn.content.contains("fast result"));
    assert!(!tool_turn.content.contains("slow result"));
}

// Invariant: no stored secret value appears verbatim in an outbound
// message, even when the model echoes it.
#[tokio::test(flavor = "multi_thread")]
async fn outbound_messages_never_leak_secrets() {
    let h = HarnessBuilder::new()
        .chat_script(vec![ScriptedAction::Complete(response_json(
            "your token is tk-super-secret-9000, keep it safe",
        ))])
        .secret("api_token", "tk-super-secret-9000")
        .build();
    let principal = principal_with_bindings();

    let reply = h
        .runtime
        .submit_and_wait(
            inbound(&principal, "discord", "D", "what's my token?"),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
    assert!(!reply.contains("tk-super-secret-9000"));
    assert!(reply.contains(itak_vault::MASK));
}
