//! 循环策略端到端测试：脚本化 Mock LLM 驱动完整会话
//!
//! 沙箱用 sh 剖面（RunCodeTool::raw），不依赖 Python 工具链。

use std::sync::Arc;

use serde_json::json;

use dana::config::AppConfig;
use dana::event::Envelope;
use dana::llm::{ChatResponse, MockLlmClient};
use dana::session::SessionManager;
use dana::tools::{ReadDatasetTool, RunCodeTool, TodoWriteTool, ToolRegistry};

const CSV: &[u8] = b"month,sales,region\n1,100,north\n2,150,south\n3,90,north\n";

fn test_config(mode: &str, max_iterations: u32) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.server.upload_dir =
        std::env::temp_dir().join(format!("dana_it_{}", uuid::Uuid::new_v4()));
    cfg.agent.mode = mode.to_string();
    cfg.agent.max_iterations = max_iterations;
    cfg.sandbox.interpreter = "sh".to_string();
    cfg.sandbox.code_timeout_seconds = 10;
    cfg
}

fn manager_with(mock: Arc<MockLlmClient>, cfg: AppConfig) -> Arc<SessionManager> {
    let mut registry = ToolRegistry::new();
    registry.register(ReadDatasetTool);
    registry.register(RunCodeTool::raw());
    registry.register(TodoWriteTool);
    Arc::new(SessionManager::new(cfg, mock, Arc::new(registry)))
}

fn todo_call(id: &str, todos: serde_json::Value, merge: bool) -> ChatResponse {
    ChatResponse::tool_call(id, "todo_write", json!({"todos": todos, "merge": merge}))
}

fn types(events: &[Arc<Envelope>]) -> Vec<String> {
    events.iter().map(|e| e.event_type.clone()).collect()
}

/// 报告样文：满足 tool_driven 的报告启发式（两个特征 + 长度）
fn report_text() -> String {
    format!(
        "# 数据分析报告\n\n## 数据概览\n共 3 行销售记录。\n\n## 关键发现\n{}\n\n## 总结\n二月销量最高。",
        "销量随月份波动，".repeat(30)
    )
}

async fn fetch_with_retry(
    manager: &SessionManager,
    session_id: &str,
) -> dana::session::FinalOutcome {
    for _ in 0..50 {
        if let Ok(outcome) = manager.fetch(session_id).await {
            return outcome;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    panic!("session {} never reached terminal state", session_id);
}

/// S1：tool_driven 正常路径——探索、建清单、执行出图、闭环、交付报告
#[tokio::test]
async fn test_tool_driven_happy_path() {
    let script = vec![
        ChatResponse::tool_call("c1", "read_dataset", json!({})),
        todo_call(
            "c2",
            json!([
                {"id": "1", "content": "探索数据基本特征", "status": "pending"},
                {"id": "2", "content": "分析销售趋势", "status": "pending"},
                {"id": "3", "content": "输出报告", "status": "pending"}
            ]),
            false,
        ),
        todo_call("c3", json!([{"id": "1", "content": "探索数据基本特征", "status": "in_progress"}]), true),
        ChatResponse::tool_call(
            "c4",
            "run_code",
            json!({"code": "printf png-bytes > result.png; echo rows=3", "description": "汇总"}),
        ),
        todo_call(
            "c5",
            json!([
                {"id": "1", "content": "探索数据基本特征", "status": "completed"},
                {"id": "2", "content": "分析销售趋势", "status": "completed"},
                {"id": "3", "content": "输出报告", "status": "completed"}
            ]),
            true,
        ),
        ChatResponse::text(report_text()),
    ];
    let mock = Arc::new(MockLlmClient::new(script));
    let manager = manager_with(mock.clone(), test_config("tool_driven", 25));

    let session_id = manager
        .start(
            "sales.csv".to_string(),
            CSV.to_vec(),
            "总结月度销量并画趋势图".to_string(),
            None,
        )
        .await
        .unwrap();

    let events = manager.subscribe(&session_id).await.unwrap().drain().await;
    let ts = types(&events);

    assert_eq!(ts[0], "agent_started");
    assert!(ts.contains(&"data_explored".to_string()));
    assert!(ts.contains(&"image_generated".to_string()));
    assert!(ts.contains(&"report_generated".to_string()));
    assert_eq!(ts.last().unwrap(), "agent_completed");

    // data_explored 载荷
    let explored = events.iter().find(|e| e.event_type == "data_explored").unwrap();
    assert_eq!(explored.payload["statistics"]["total_rows"], 3);

    // tasks_updated 均来自工具
    let updates: Vec<_> = events.iter().filter(|e| e.event_type == "tasks_updated").collect();
    assert!(updates.len() >= 3);
    assert!(updates.iter().all(|e| e.payload["source"] == "tool"));

    // 性质 3：tool_call / tool_result 一一配对
    let calls: Vec<&str> = events
        .iter()
        .filter(|e| e.event_type == "tool_call")
        .map(|e| e.payload["call_id"].as_str().unwrap())
        .collect();
    let results: Vec<&str> = events
        .iter()
        .filter(|e| e.event_type == "tool_result")
        .map(|e| e.payload["call_id"].as_str().unwrap())
        .collect();
    assert_eq!(calls, results);

    // 流式事件带完整累计文本
    assert!(events.iter().any(|e| e.event_type == "llm_streaming"));

    let terminal = events.last().unwrap();
    assert_eq!(terminal.payload["reached_max_iterations"], false);
    assert_eq!(terminal.payload["incomplete_tasks_count"], 0);
    assert!(terminal.payload["final_report"]
        .as_str()
        .unwrap()
        .contains("# 数据分析报告"));

    let outcome = fetch_with_retry(&manager, &session_id).await;
    assert_eq!(outcome.phase.as_str(), "completed");
    assert_eq!(outcome.images.len(), 1);
}

/// S3：第二个 tool_call 后取消——在途子进程被终止，恰好一个 agent_stopped
#[tokio::test]
async fn test_cancellation_mid_analysis() {
    let script = vec![
        ChatResponse::tool_call("c1", "read_dataset", json!({})),
        ChatResponse::tool_call("c2", "run_code", json!({"code": "sleep 30", "description": "慢任务"})),
        ChatResponse::tool_call("c3", "run_code", json!({"code": "echo never", "description": "不应执行"})),
    ];
    let mock = Arc::new(MockLlmClient::new(script));
    let manager = manager_with(mock, test_config("tool_driven", 25));

    let session_id = manager
        .start("sales.csv".into(), CSV.to_vec(), "分析".into(), None)
        .await
        .unwrap();

    let mut subscription = manager.subscribe(&session_id).await.unwrap();
    let mut seen = Vec::new();
    let mut tool_calls_seen = 0;
    let started = std::time::Instant::now();
    while let Some(envelope) = subscription.next().await {
        if envelope.event_type == "tool_call" {
            tool_calls_seen += 1;
            if tool_calls_seen == 2 {
                manager.stop(&session_id).await.unwrap();
            }
        }
        seen.push(envelope);
    }

    assert_eq!(tool_calls_seen, 2, "no tool_call after stop");
    let terminals: Vec<_> = seen.iter().filter(|e| e.is_terminal()).collect();
    assert_eq!(terminals.len(), 1);
    assert_eq!(terminals[0].event_type, "agent_stopped");
    // 在途 sleep 30 被终止：远小于其自然时长
    assert!(started.elapsed() < std::time::Duration::from_secs(15));

    let outcome = fetch_with_retry(&manager, &session_id).await;
    assert_eq!(outcome.phase.as_str(), "stopped");
}

/// S4：迭代耗尽——agent_warning + agent_completed(reached_max_iterations=true)，LLM 调用数 ≤ 上限
#[tokio::test]
async fn test_iteration_overrun_soft_completion() {
    let script = vec![todo_call(
        "c1",
        json!([
            {"id": "1", "content": "探索数据", "status": "in_progress"},
            {"id": "2", "content": "输出报告", "status": "pending"}
        ]),
        false,
    )];
    // 兜底回复是非报告文本：任务未闭环，循环空转到上限
    let mock = Arc::new(
        MockLlmClient::new(script).with_fallback(ChatResponse::text("继续分析中……")),
    );
    let manager = manager_with(mock.clone(), test_config("tool_driven", 3));

    let session_id = manager
        .start("sales.csv".into(), CSV.to_vec(), "分析".into(), None)
        .await
        .unwrap();
    let events = manager.subscribe(&session_id).await.unwrap().drain().await;
    let ts = types(&events);

    let warning_pos = ts.iter().position(|t| t == "agent_warning").unwrap();
    let completed_pos = ts.iter().position(|t| t == "agent_completed").unwrap();
    assert!(warning_pos < completed_pos);

    let warning = &events[warning_pos];
    assert!(warning.payload["incomplete_tasks_count"].as_u64().unwrap() >= 1);
    let terminal = events.last().unwrap();
    assert_eq!(terminal.event_type, "agent_completed");
    assert_eq!(terminal.payload["reached_max_iterations"], true);

    // 性质 6：LLM 调用数不超过 max_iterations
    assert!(mock.call_count() <= 3);
}

/// S5：autonomous 标签解析——两个任务、括号状态后缀剥除、报告剥离哨兵
#[tokio::test]
async fn test_autonomous_tag_parsing() {
    let first = ChatResponse::text(
        "<thinking>先规划任务。</thinking>\n<tasks>\n- [x] A\n- [ ] B （进行中）\n</tasks>\n继续。",
    );
    let second = ChatResponse::text(format!(
        "<thinking>全部完成。</thinking>\n<tasks>\n- [x] A\n- [x] B\n</tasks>\n{}\n---\n[ANALYSIS_COMPLETE]",
        report_text()
    ));
    let mock = Arc::new(MockLlmClient::new(vec![first, second]));
    let manager = manager_with(mock, test_config("autonomous", 25));

    let session_id = manager
        .start("sales.csv".into(), CSV.to_vec(), "分析".into(), None)
        .await
        .unwrap();
    let events = manager.subscribe(&session_id).await.unwrap().drain().await;

    let first_update = events
        .iter()
        .find(|e| e.event_type == "tasks_updated")
        .unwrap();
    assert_eq!(first_update.payload["source"], "llm");
    let tasks = first_update.payload["tasks"].as_array().unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0]["id"], 1);
    assert_eq!(tasks[0]["name"], "A");
    assert_eq!(tasks[0]["status"], "completed");
    assert_eq!(tasks[1]["id"], 2);
    assert_eq!(tasks[1]["name"], "B");
    assert_eq!(tasks[1]["status"], "pending");

    // 思考块转为 llm_thinking，报告剥离标签与哨兵
    assert!(events.iter().any(|e| e.event_type == "llm_thinking"));
    let terminal = events.last().unwrap();
    assert_eq!(terminal.event_type, "agent_completed");
    let report = terminal.payload["final_report"].as_str().unwrap();
    assert!(report.contains("# 数据分析报告"));
    assert!(!report.contains("ANALYSIS_COMPLETE"));
    assert!(!report.contains("<tasks>"));
}

/// S6：终态后订阅——全量回放、顺序不变、以终止事件收尾
#[tokio::test]
async fn test_late_subscriber_replays_full_log() {
    let script = vec![
        ChatResponse::tool_call("c1", "read_dataset", json!({})),
        ChatResponse::text(report_text()),
    ];
    let mock = Arc::new(MockLlmClient::new(script));
    let manager = manager_with(mock, test_config("tool_driven", 25));

    let session_id = manager
        .start("sales.csv".into(), CSV.to_vec(), "分析".into(), None)
        .await
        .unwrap();

    // 等会话先自然结束
    let outcome = fetch_with_retry(&manager, &session_id).await;
    assert_eq!(outcome.phase.as_str(), "completed");

    let late = manager.subscribe(&session_id).await.unwrap().drain().await;
    let ts = types(&late);
    assert_eq!(ts.first().unwrap(), "agent_started");
    assert_eq!(ts.last().unwrap(), "agent_completed");

    // 与早订阅者看到的顺序一致
    let again = manager.subscribe(&session_id).await.unwrap().drain().await;
    assert_eq!(types(&again), ts);

    // 时间戳单调
    for pair in late.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
}

/// S2 变体：run_code 失败回传 LLM 后自纠——第一次报错，第二次成功
#[tokio::test]
async fn test_code_error_self_recovery() {
    let script = vec![
        ChatResponse::tool_call("c1", "run_code", json!({"code": "nonexistent-command-xyz", "description": "坏代码"})),
        ChatResponse::tool_call("c2", "run_code", json!({"code": "echo fixed", "description": "修正"})),
        ChatResponse::text(report_text()),
    ];
    let mock = Arc::new(MockLlmClient::new(script));
    let manager = manager_with(mock, test_config("tool_driven", 25));

    let session_id = manager
        .start("sales.csv".into(), CSV.to_vec(), "分析".into(), None)
        .await
        .unwrap();
    let events = manager.subscribe(&session_id).await.unwrap().drain().await;

    let results: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == "tool_result")
        .collect();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].payload["status"], "error");
    assert_eq!(results[1].payload["status"], "success");
    assert_eq!(events.last().unwrap().event_type, "agent_completed");
}

/// 未知会话与未就绪会话的控制面错误
#[tokio::test]
async fn test_control_surface_errors() {
    let mock = Arc::new(MockLlmClient::new(vec![ChatResponse::tool_call(
        "c1",
        "run_code",
        json!({"code": "sleep 5", "description": "慢"}),
    )]));
    let manager = manager_with(mock, test_config("tool_driven", 25));

    assert!(manager.stop("no-such-session").await.is_err());
    assert!(manager.subscribe("no-such-session").await.is_err());

    let session_id = manager
        .start("sales.csv".into(), CSV.to_vec(), "分析".into(), None)
        .await
        .unwrap();
    // 进行中 fetch → SESSION_NOT_READY
    let err = manager.fetch(&session_id).await.unwrap_err();
    assert_eq!(err.kind(), "SESSION_NOT_READY");
    manager.stop(&session_id).await.unwrap();
    let outcome = fetch_with_retry(&manager, &session_id).await;
    assert_eq!(outcome.phase.as_str(), "stopped");
}

/// 上传校验：空需求、超限、不支持的扩展名
#[tokio::test]
async fn test_start_upload_validation() {
    let mock = Arc::new(MockLlmClient::new(vec![]));
    let mut cfg = test_config("tool_driven", 25);
    cfg.server.max_file_size_bytes = 16;
    let manager = manager_with(mock, cfg);

    let err = manager
        .start("sales.csv".into(), CSV.to_vec(), "  ".into(), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "INVALID_INPUT");

    let err = manager
        .start("sales.csv".into(), CSV.to_vec(), "分析".into(), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "INVALID_INPUT"); // 超过 16 字节上限

    let err = manager
        .start("sales.xlsx".into(), b"x".to_vec(), "分析".into(), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "UNSUPPORTED_FORMAT");

    let err = manager
        .start("sales.csv".into(), b"a,b\n1,2\n".to_vec(), "分析".into(), Some("no_such_mode".into()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "INVALID_INPUT");
}

/// task_driven：代码持有清单，规划 → 逐任务 → 报告
#[tokio::test]
async fn test_task_driven_code_owned_flow() {
    let script = vec![
        // 规划回合：JSON 计划
        ChatResponse::text(
            r#"[
                {"name": "探索数据", "description": "看结构", "type": "data_exploration"},
                {"name": "输出报告", "description": "汇总", "type": "report"}
            ]"#,
        ),
        // 任务 1：一次工具调用 + 文本小结
        ChatResponse::tool_call("c1", "run_code", json!({"code": "echo explored", "description": "探索"})),
        ChatResponse::text("任务 1 完成：数据结构清晰。"),
        // 任务 2：直接文本小结
        ChatResponse::text("任务 2 完成：要点已汇总。"),
        // 报告回合
        ChatResponse::text(report_text()),
    ];
    let mock = Arc::new(MockLlmClient::new(script));
    let manager = manager_with(mock, test_config("task_driven", 25));

    let session_id = manager
        .start("sales.csv".into(), CSV.to_vec(), "分析".into(), None)
        .await
        .unwrap();
    let events = manager.subscribe(&session_id).await.unwrap().drain().await;
    let ts = types(&events);

    assert!(ts.contains(&"tasks_planned".to_string()));
    assert!(ts.contains(&"data_explored".to_string()));
    let started: Vec<_> = events.iter().filter(|e| e.event_type == "task_started").collect();
    let completed: Vec<_> = events.iter().filter(|e| e.event_type == "task_completed").collect();
    assert_eq!(started.len(), 2);
    assert_eq!(completed.len(), 2);
    // 代码路径的任务更新
    assert!(events
        .iter()
        .filter(|e| e.event_type == "tasks_updated")
        .all(|e| e.payload["source"] == "code"));

    let terminal = events.last().unwrap();
    assert_eq!(terminal.event_type, "agent_completed");
    assert_eq!(terminal.payload["reached_max_iterations"], false);
    assert_eq!(terminal.payload["incomplete_tasks_count"], 0);
}

/// hybrid：任务由 [TASK_DONE] 宣告；失败任务不终止会话
#[tokio::test]
async fn test_hybrid_task_done_signals() {
    let script = vec![
        ChatResponse::text(r#"[{"name": "分析", "type": "analysis"}, {"name": "绘图", "type": "visualization"}]"#),
        // 任务 1：工具调用后宣告完成
        ChatResponse::tool_call("c1", "run_code", json!({"code": "echo t1", "description": "t1"})),
        ChatResponse::text("小结。\n[TASK_DONE]"),
        // 任务 2：宣告失败
        ChatResponse::text("绘图环境不可用。\n[TASK_FAILED]"),
        // 报告
        ChatResponse::text(report_text()),
    ];
    let mock = Arc::new(MockLlmClient::new(script));
    let manager = manager_with(mock, test_config("hybrid", 25));

    let session_id = manager
        .start("sales.csv".into(), CSV.to_vec(), "分析".into(), None)
        .await
        .unwrap();
    let events = manager.subscribe(&session_id).await.unwrap().drain().await;
    let ts = types(&events);

    assert!(ts.contains(&"task_completed".to_string()));
    assert!(ts.contains(&"task_failed".to_string()));
    let terminal = events.last().unwrap();
    assert_eq!(terminal.event_type, "agent_completed");
    // 失败任务是终态，不算未完成
    assert_eq!(terminal.payload["incomplete_tasks_count"], 0);
}
