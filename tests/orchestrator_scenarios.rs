//! 编排器端到端场景测试：脚本化 Mock LLM + 测试内伪工具

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;

use conductor::config::AppConfig;
use conductor::core::{
    progress_channel, EngineBuilder, Orchestrator, Phase, ProgressEvent, Route, StepSpec,
    StepStatus, TaskSnapshot, CANCELLED_BY_USER, ENGINE_SHUTDOWN,
};
use conductor::llm::{LlmError, MockLlmClient};
use conductor::tools::{Tool, ToolError, ToolOutput, ToolRegistry, WriteFileTool};

const INSTRUCTION: &str = "rename foo to bar";
const SOURCE: &str = "fn foo() {}";

fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.llm.provider = "mock".into();
    cfg.llm.retry.max_attempts = 1;
    cfg
}

fn triage(route: &str, complexity: u8) -> Result<String, LlmError> {
    Ok(json!({ "route": route, "complexity": complexity }).to_string())
}

fn plan(steps: Vec<StepSpec>) -> Result<String, LlmError> {
    Ok(format!("```json\n{}\n```", json!({ "steps": steps })))
}

fn finish_step() -> StepSpec {
    StepSpec::new("finish", "finish")
        .with_param("final_explanation", "renamed foo to bar")
        .with_param("final_code", "fn bar() {}")
}

fn engine(cfg: AppConfig, llm: Arc<MockLlmClient>, tools: ToolRegistry) -> Arc<Orchestrator> {
    EngineBuilder::new(cfg).with_llm(llm).with_tools(tools).build()
}

/// 记录每次调用的 query
struct RecordingTool {
    name: &'static str,
    queries: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Tool for RecordingTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "records queries"
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let query = args["query"].as_str().unwrap_or_default().to_string();
        self.queries.lock().unwrap().push(query.clone());
        Ok(ToolOutput::new(json!({
            "query": query,
            "results": [{
                "title": "lib.rs",
                "content": "fn foo() {}",
                "relevance_score": 0.3,
                "source": "internal"
            }]
        })))
    }
}

struct FailingTool {
    name: &'static str,
}

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "always fails"
    }

    async fn execute(&self, _args: Value) -> Result<ToolOutput, ToolError> {
        Err(ToolError::Failed("backend down".into()))
    }
}

/// 每次执行都往计划末尾追加一个新步骤
struct GrowingTool {
    counter: AtomicUsize,
}

#[async_trait]
impl Tool for GrowingTool {
    fn name(&self) -> &str {
        "search_internal"
    }

    fn description(&self) -> &str {
        "keeps asking for more"
    }

    async fn execute(&self, _args: Value) -> Result<ToolOutput, ToolError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(ToolOutput::new(json!({ "results": [] }))
            .with_follow_up(vec![StepSpec::new(format!("extra-{n}"), "search_internal")]))
    }
}

/// query 为 seed 时追加一个 followup 步骤
struct SeedingTool {
    queries: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Tool for SeedingTool {
    fn name(&self) -> &str {
        "search_internal"
    }

    fn description(&self) -> &str {
        "asks for one more search"
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let query = args["query"].as_str().unwrap_or_default().to_string();
        self.queries.lock().unwrap().push(query.clone());
        let output = ToolOutput::new(json!({ "results": [] }));
        if query == "seed" {
            Ok(output.with_follow_up(vec![
                StepSpec::new("followup", "search_internal").with_param("query", "followup")
            ]))
        } else {
            Ok(output)
        }
    }
}

/// 进入后通知 started，然后永不返回
struct BlockingTool {
    started: Arc<Notify>,
}

#[async_trait]
impl Tool for BlockingTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "never finishes"
    }

    async fn execute(&self, _args: Value) -> Result<ToolOutput, ToolError> {
        self.started.notify_one();
        std::future::pending().await
    }
}

fn status_of(snapshot: &TaskSnapshot, id: &str) -> StepStatus {
    snapshot
        .plan_steps
        .iter()
        .find(|s| s.id == id)
        .map(|s| s.status)
        .unwrap_or_else(|| panic!("step {id} missing"))
}

#[tokio::test]
async fn test_independent_steps_run_in_insertion_order() {
    let queries = Arc::new(Mutex::new(Vec::new()));
    let mut tools = ToolRegistry::new();
    tools.register(RecordingTool {
        name: "search_internal",
        queries: queries.clone(),
    });
    let llm = Arc::new(MockLlmClient::scripted(vec![
        triage("complex_modification", 6),
        plan(vec![
            StepSpec::new("first", "search_internal").with_param("query", "first"),
            StepSpec::new("second", "search_internal").with_param("query", "second"),
            finish_step(),
        ]),
    ]));
    let orchestrator = engine(test_config(), llm, tools);

    let submitted = orchestrator.submit(INSTRUCTION, SOURCE).await.unwrap();
    let events = submitted.progress.collect().await;
    let snapshot = submitted.handle.await.unwrap();

    assert!(snapshot.task_complete && !snapshot.task_failed);
    assert_eq!(snapshot.phase, Phase::Done);
    assert_eq!(snapshot.final_code.as_deref(), Some("fn bar() {}"));
    assert_eq!(snapshot.final_explanation.as_deref(), Some("renamed foo to bar"));
    assert_eq!(snapshot.loop_count, 3);
    assert_eq!(snapshot.progress.completed, snapshot.progress.total);
    assert_eq!(snapshot.metrics.internal_searches, 3);
    assert_eq!(
        *queries.lock().unwrap(),
        vec![INSTRUCTION.to_string(), "first".into(), "second".into()]
    );

    let handle = orchestrator.registry().handle(&submitted.task_id).await.unwrap();
    let record = handle.record.lock().await;
    assert!(record.working_memory().contains("search_results_first"));
    assert!(record.working_memory().contains("search_results_second"));
    drop(record);

    let last = events.last().unwrap();
    assert!(last.is_end_of_stream());
    assert!(events[..events.len() - 1].iter().all(|e| !e.is_end_of_stream()));
}

#[tokio::test]
async fn test_progress_events_are_ordered_and_round_trip() {
    let mut tools = ToolRegistry::new();
    tools.register(RecordingTool {
        name: "search_internal",
        queries: Arc::default(),
    });
    let llm = Arc::new(MockLlmClient::scripted(vec![
        triage("simple_modification", 2),
        plan(vec![StepSpec::new("look", "search_internal"), finish_step()]),
    ]));
    let orchestrator = engine(test_config(), llm, tools);

    let submitted = orchestrator.submit(INSTRUCTION, SOURCE).await.unwrap();
    let events = submitted.progress.collect().await;
    let snapshot = submitted.handle.await.unwrap();

    let seqs: Vec<u64> = events.iter().map(ProgressEvent::seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]), "seqs not increasing: {seqs:?}");

    let Some(ProgressEvent::Snapshot(last)) = events.last() else {
        panic!("stream did not end with a snapshot");
    };
    let json = serde_json::to_string(last).unwrap();
    let back: TaskSnapshot = serde_json::from_str(&json).unwrap();
    assert_eq!(&back, last);
    assert_eq!(back.task_complete, snapshot.task_complete);
    assert_eq!(back.final_code, snapshot.final_code);
    assert_eq!(status_of(&back, "look"), StepStatus::Completed);
}

#[tokio::test]
async fn test_failed_dependency_fails_task_naming_the_step() {
    let queries = Arc::new(Mutex::new(Vec::new()));
    let mut tools = ToolRegistry::new();
    tools.register(FailingTool {
        name: "search_external",
    });
    tools.register(RecordingTool {
        name: "search_internal",
        queries: queries.clone(),
    });
    let llm = Arc::new(MockLlmClient::scripted(vec![
        triage("complex_modification", 7),
        plan(vec![
            StepSpec::new("fetch-docs", "search_external"),
            StepSpec::new("apply-docs", "search_internal")
                .with_param("query", "apply")
                .depends_on("fetch-docs"),
            finish_step().depends_on("apply-docs"),
        ]),
    ]));
    let orchestrator = engine(test_config(), llm, tools);

    let snapshot = orchestrator.execute(INSTRUCTION, SOURCE).await.unwrap();

    assert!(snapshot.task_failed && !snapshot.task_complete);
    let reason = snapshot.failure_reason.clone().unwrap();
    assert!(reason.contains("fetch-docs"), "reason: {reason}");
    assert_eq!(status_of(&snapshot, "fetch-docs"), StepStatus::Failed);
    assert_eq!(status_of(&snapshot, "apply-docs"), StepStatus::Pending);
    assert!(!queries.lock().unwrap().contains(&"apply".to_string()));
}

#[tokio::test]
async fn test_non_critical_failure_ends_in_deadlock() {
    let mut cfg = test_config();
    cfg.engine.non_critical_actions = vec!["search_external".into()];
    let mut tools = ToolRegistry::new();
    tools.register(FailingTool {
        name: "search_external",
    });
    tools.register(RecordingTool {
        name: "search_internal",
        queries: Arc::default(),
    });
    let llm = Arc::new(MockLlmClient::scripted(vec![
        triage("complex_modification", 7),
        plan(vec![
            StepSpec::new("fetch-docs", "search_external"),
            StepSpec::new("apply-docs", "search_internal").depends_on("fetch-docs"),
            finish_step().depends_on("apply-docs"),
        ]),
    ]));
    let orchestrator = engine(cfg, llm, tools);

    let snapshot = orchestrator.execute(INSTRUCTION, SOURCE).await.unwrap();

    assert!(snapshot.task_failed);
    let reason = snapshot.failure_reason.clone().unwrap();
    assert!(reason.starts_with("scheduler deadlock"), "reason: {reason}");
    assert!(reason.contains("unresolved dependencies [fetch-docs]"), "reason: {reason}");
    assert_eq!(status_of(&snapshot, "fetch-docs"), StepStatus::Failed);
    assert_eq!(status_of(&snapshot, "apply-docs"), StepStatus::Skipped);
    assert_eq!(status_of(&snapshot, "finish"), StepStatus::Skipped);
}

#[tokio::test]
async fn test_classifier_failure_falls_back_to_planning() {
    let llm = Arc::new(MockLlmClient::scripted(vec![
        Err(LlmError::Api("model unavailable".into())),
        plan(vec![finish_step()]),
    ]));
    let orchestrator = engine(test_config(), llm.clone(), ToolRegistry::new());

    let snapshot = orchestrator.execute(INSTRUCTION, SOURCE).await.unwrap();

    assert_eq!(snapshot.route, Some(Route::ComplexModification));
    assert_eq!(snapshot.complexity, Some(8));
    assert!(snapshot.task_complete);
    assert_eq!(snapshot.plan_steps.len(), 1);
    assert_eq!(llm.call_count(), 2);
}

#[tokio::test]
async fn test_runaway_plan_hits_loop_ceiling() {
    let mut cfg = test_config();
    cfg.engine.max_loops = 3;
    let mut tools = ToolRegistry::new();
    tools.register(GrowingTool {
        counter: AtomicUsize::new(0),
    });
    let mut steps: Vec<StepSpec> = (1..=5)
        .map(|i| StepSpec::new(format!("s{i}"), "search_internal"))
        .collect();
    steps.push(finish_step());
    let llm = Arc::new(MockLlmClient::scripted(vec![
        triage("complex_modification", 9),
        plan(steps),
    ]));
    let orchestrator = engine(cfg, llm, tools);

    let snapshot = orchestrator.execute(INSTRUCTION, SOURCE).await.unwrap();

    assert!(snapshot.task_failed);
    assert_eq!(snapshot.loop_count, 3);
    let reason = snapshot.failure_reason.clone().unwrap();
    assert!(reason.starts_with("loop ceiling exceeded"), "reason: {reason}");
    for id in ["s1", "s2", "s3"] {
        assert_eq!(status_of(&snapshot, id), StepStatus::Completed);
    }
    for id in ["s4", "s5", "finish"] {
        assert_eq!(status_of(&snapshot, id), StepStatus::Pending);
    }
    assert_eq!(snapshot.plan_steps.len(), 6 + 3);
}

#[tokio::test]
async fn test_unknown_action_fails_before_later_steps() {
    let queries = Arc::new(Mutex::new(Vec::new()));
    let mut tools = ToolRegistry::new();
    tools.register(RecordingTool {
        name: "search_internal",
        queries: queries.clone(),
    });
    let llm = Arc::new(MockLlmClient::scripted(vec![
        triage("complex_modification", 5),
        plan(vec![
            StepSpec::new("warp", "teleport"),
            StepSpec::new("after", "search_internal").with_param("query", "after"),
            finish_step(),
        ]),
    ]));
    let orchestrator = engine(test_config(), llm, tools);

    let snapshot = orchestrator.execute(INSTRUCTION, SOURCE).await.unwrap();

    assert!(snapshot.task_failed);
    assert_eq!(
        snapshot.failure_reason.as_deref(),
        Some("unknown action type: teleport")
    );
    assert_eq!(status_of(&snapshot, "warp"), StepStatus::Failed);
    assert_eq!(status_of(&snapshot, "after"), StepStatus::Pending);
    assert_eq!(*queries.lock().unwrap(), vec![INSTRUCTION.to_string()]);
}

#[tokio::test]
async fn test_simple_inquiry_answers_without_plan() {
    let llm = Arc::new(MockLlmClient::scripted(vec![
        triage("simple_inquiry", 1),
        Ok("foo is an empty function.".into()),
    ]));
    let orchestrator = engine(test_config(), llm, ToolRegistry::new());

    let snapshot = orchestrator.execute("what does foo do?", SOURCE).await.unwrap();

    assert!(snapshot.task_complete);
    assert_eq!(snapshot.route, Some(Route::SimpleInquiry));
    assert!(snapshot.plan_steps.is_empty());
    assert_eq!(snapshot.final_explanation.as_deref(), Some("foo is an empty function."));
    assert_eq!(snapshot.final_code.as_deref(), Some(SOURCE));
    assert_eq!(snapshot.metrics.llm_calls, 2);
}

#[tokio::test]
async fn test_simple_inquiry_model_failure_fails_task() {
    let llm = Arc::new(MockLlmClient::scripted(vec![
        triage("simple_inquiry", 1),
        Err(LlmError::Timeout),
    ]));
    let orchestrator = engine(test_config(), llm, ToolRegistry::new());

    let snapshot = orchestrator.execute("what does foo do?", SOURCE).await.unwrap();

    assert!(snapshot.task_failed);
    assert!(snapshot.failure_reason.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_malformed_plan_is_reasked_once_then_fails() {
    let llm = Arc::new(MockLlmClient::scripted(vec![
        triage("complex_modification", 6),
        Ok("I would start by reading the code.".into()),
        Ok(r#"{"steps": []}"#.into()),
    ]));
    let orchestrator = engine(test_config(), llm.clone(), ToolRegistry::new());

    let snapshot = orchestrator.execute(INSTRUCTION, SOURCE).await.unwrap();

    assert!(snapshot.task_failed);
    let reason = snapshot.failure_reason.unwrap();
    assert!(
        reason.starts_with("planner failed to produce a valid plan"),
        "reason: {reason}"
    );
    assert_eq!(llm.call_count(), 3);
    assert_eq!(snapshot.metrics.llm_calls, 3);
}

#[tokio::test]
async fn test_cancel_interrupts_running_step() {
    let started = Arc::new(Notify::new());
    let mut tools = ToolRegistry::new();
    tools.register(BlockingTool {
        started: started.clone(),
    });
    let llm = Arc::new(MockLlmClient::scripted(vec![
        triage("simple_modification", 3),
        plan(vec![
            StepSpec::new("write", "write_file")
                .with_param("path", "src/lib.rs")
                .with_param("content", "fn bar() {}"),
            finish_step(),
        ]),
    ]));
    let orchestrator = engine(test_config(), llm, tools);

    let submitted = orchestrator.submit(INSTRUCTION, SOURCE).await.unwrap();
    started.notified().await;
    assert!(orchestrator.cancel(&submitted.task_id).await.unwrap());
    assert!(!orchestrator.cancel(&submitted.task_id).await.unwrap());

    let events = submitted.progress.collect().await;
    let snapshot = submitted.handle.await.unwrap();
    assert!(snapshot.task_failed);
    assert_eq!(snapshot.failure_reason.as_deref(), Some(CANCELLED_BY_USER));
    assert_eq!(status_of(&snapshot, "write"), StepStatus::InProgress);
    assert!(events.last().unwrap().is_end_of_stream());

    let listed = orchestrator.list().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].task_id, submitted.task_id);
}

#[tokio::test]
async fn test_unknown_task_lookup() {
    let orchestrator = engine(test_config(), Arc::new(MockLlmClient::new()), ToolRegistry::new());
    let missing = conductor::core::TaskId::new();
    assert!(orchestrator.get(&missing).await.is_err());
    assert!(orchestrator.cancel(&missing).await.is_err());
    assert!(!orchestrator.delete(&missing).await);
}

#[tokio::test]
async fn test_follow_up_step_runs_before_finish() {
    let queries = Arc::new(Mutex::new(Vec::new()));
    let mut tools = ToolRegistry::new();
    tools.register(SeedingTool {
        queries: queries.clone(),
    });
    let llm = Arc::new(MockLlmClient::scripted(vec![
        triage("complex_modification", 5),
        plan(vec![
            StepSpec::new("seed", "search_internal").with_param("query", "seed"),
            finish_step(),
        ]),
    ]));
    let orchestrator = engine(test_config(), llm, tools);

    let snapshot = orchestrator.execute(INSTRUCTION, SOURCE).await.unwrap();

    assert!(snapshot.task_complete && !snapshot.task_failed);
    let ids: Vec<&str> = snapshot.plan_steps.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["seed", "finish", "followup"]);
    for id in ["seed", "followup", "finish"] {
        assert_eq!(status_of(&snapshot, id), StepStatus::Completed);
    }
    assert_eq!(
        *queries.lock().unwrap(),
        vec![INSTRUCTION.to_string(), "seed".into(), "followup".into()]
    );
    assert_eq!(snapshot.loop_count, 3);
    assert_eq!(snapshot.progress.completed, 3);
    assert_eq!(snapshot.progress.total, 3);
}

#[tokio::test]
async fn test_finish_without_final_code_returns_written_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("lib.rs"), "fn foo() {}\n").unwrap();
    let mut tools = ToolRegistry::new();
    tools.register(WriteFileTool::new(dir.path()));
    let orchestrator = engine(test_config(), Arc::new(MockLlmClient::new()), tools);

    let (task_id, handle) = orchestrator
        .registry()
        .create(INSTRUCTION, SOURCE, 10)
        .await
        .unwrap();
    {
        let mut record = handle.record.lock().await;
        record.set_route(Route::SimpleModification, 2).unwrap();
        record
            .append_steps(vec![
                StepSpec::new("w", "write_file")
                    .with_param("path", "lib.rs")
                    .with_param("content", "fn bar() {}\n"),
                StepSpec::new("f", "finish")
                    .with_param("final_explanation", "renamed foo to bar")
                    .depends_on("w"),
            ])
            .unwrap();
        record.enter_phase(Phase::Execute).unwrap();
    }
    let (publisher, receiver) = progress_channel(
        task_id,
        16,
        Duration::from_secs(1),
        Duration::from_secs(1),
    );

    let snapshot = orchestrator.run(handle.clone(), publisher).await;

    assert!(snapshot.task_complete, "reason: {:?}", snapshot.failure_reason);
    assert_eq!(snapshot.final_code.as_deref(), Some("fn bar() {}\n"));
    assert_eq!(snapshot.final_explanation.as_deref(), Some("renamed foo to bar"));
    assert_eq!(snapshot.metrics.files_modified, 1);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("lib.rs")).unwrap(),
        "fn bar() {}\n"
    );

    let record = handle.record.lock().await;
    assert_eq!(record.current_code(), "fn bar() {}\n");
    let diff = record.working_memory().get("diff_w").unwrap();
    assert!(diff.as_str().unwrap().contains("-fn foo() {}"));
    assert!(diff.as_str().unwrap().contains("+fn bar() {}"));
    drop(record);

    assert!(receiver.collect().await.last().unwrap().is_end_of_stream());
}

#[tokio::test]
async fn test_shutdown_fails_running_task_with_shutdown_reason() {
    let started = Arc::new(Notify::new());
    let mut tools = ToolRegistry::new();
    tools.register(BlockingTool {
        started: started.clone(),
    });
    let llm = Arc::new(MockLlmClient::scripted(vec![
        triage("simple_modification", 3),
        plan(vec![
            StepSpec::new("write", "write_file")
                .with_param("path", "src/lib.rs")
                .with_param("content", "fn bar() {}"),
            finish_step(),
        ]),
    ]));
    let orchestrator = engine(test_config(), llm, tools);

    let submitted = orchestrator.submit(INSTRUCTION, SOURCE).await.unwrap();
    started.notified().await;
    orchestrator.registry().shutdown();

    let events = submitted.progress.collect().await;
    let snapshot = submitted.handle.await.unwrap();
    assert!(snapshot.task_failed);
    assert_eq!(snapshot.failure_reason.as_deref(), Some(ENGINE_SHUTDOWN));
    assert_ne!(ENGINE_SHUTDOWN, CANCELLED_BY_USER);
    assert!(events.last().unwrap().is_end_of_stream());
}
