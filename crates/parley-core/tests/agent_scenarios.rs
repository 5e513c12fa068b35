use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};

use parley_core::agent::{
    Agent, ChatModel, LoopSettings, ModelError, ModelReply, ModelResponse, RetryPolicy,
    TokenUsage, ToolInvocation,
};
use parley_core::history::{self, ToolOutcome, Turn};
use parley_core::session::{
    ManualClock, SessionKey, SessionStorage, SessionStore, SqliteStorage,
};
use parley_core::tools::{empty_object_schema, FnTool, ToolRegistry, ToolSchema};
use parley_core::AgentError;

/// Model stub: replays a script, then repeats its fallback if one is set.
struct Script {
    replies: Mutex<VecDeque<ModelResponse>>,
    fallback: Option<ModelResponse>,
    requests: Mutex<Vec<Vec<Turn>>>,
}

impl Script {
    fn new(replies: Vec<ModelResponse>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        })
    }

    fn forever(reply: ModelResponse) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: Some(reply),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatModel for Script {
    fn name(&self) -> &str {
        "script"
    }

    async fn invoke(
        &self,
        history: &[Turn],
        _tools: &[ToolSchema],
    ) -> Result<ModelResponse, ModelError> {
        self.requests.lock().unwrap().push(history.to_vec());
        let next = self.replies.lock().unwrap().pop_front();
        next.or_else(|| self.fallback.clone())
            .ok_or_else(|| ModelError::Rejected("script exhausted".into()))
    }
}

fn tool_call(id: &str, name: &str) -> ModelResponse {
    ModelResponse::tool_calls(vec![ToolInvocation {
        id: id.into(),
        call_id: None,
        name: name.into(),
        arguments: Map::new(),
    }])
    .with_usage(TokenUsage {
        input: 20,
        output: 5,
        total: 25,
    })
}

struct Harness {
    agent: Agent,
    storage: Arc<SqliteStorage>,
    clock: Arc<ManualClock>,
    _dir: tempfile::TempDir,
}

fn harness(model: Arc<Script>, tools: ToolRegistry, idle: Duration) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(SqliteStorage::open(&dir.path().join("sessions.sqlite")).unwrap());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let sessions = Arc::new(SessionStore::with_clock(
        storage.clone(),
        idle,
        clock.clone(),
    ));
    let settings = LoopSettings {
        budget: 3,
        retry: RetryPolicy {
            max_retries: 1,
            initial_backoff: Duration::from_millis(1),
            call_timeout: Duration::from_secs(5),
        },
    };
    Harness {
        agent: Agent::new(model, tools, sessions, settings),
        storage,
        clock,
        _dir: dir,
    }
}

fn clock_tool() -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools
        .register(Box::new(FnTool::new(
            "get_time",
            "Get the current time",
            empty_object_schema(),
            |_| async { Ok(json!("12:00")) },
        )))
        .unwrap();
    tools
}

async fn stored_turns(storage: &SqliteStorage, id: &str) -> Vec<Turn> {
    let record = storage.load(id).await.unwrap().expect("session stored");
    history::decode(&record.history).unwrap()
}

#[tokio::test]
async fn time_query_runs_the_tool_and_persists_four_turns() {
    let model = Script::new(vec![
        tool_call("call-1", "get_time"),
        ModelResponse::text("It is 12:00."),
    ]);
    let h = harness(model, clock_tool(), Duration::from_secs(300));
    let key = SessionKey::for_user("u1");

    let reply = h.agent.handle_prompt(&key, "what time is it?").await.unwrap();
    assert_eq!(reply, "It is 12:00.");

    let turns = stored_turns(&h.storage, "user:u1").await;
    let kinds: Vec<&str> = turns.iter().map(Turn::kind).collect();
    assert_eq!(
        kinds,
        vec!["user", "tool_call", "tool_result", "agent"]
    );
    assert_eq!(
        turns[2],
        Turn::ToolCallResult {
            id: "call-1".into(),
            name: "get_time".into(),
            outcome: ToolOutcome::Success(json!("12:00")),
        }
    );

    let record = h.storage.load("user:u1").await.unwrap().unwrap();
    assert_eq!(record.token_count, 25);
}

#[tokio::test]
async fn unknown_tool_is_reported_to_the_model_not_the_caller() {
    let model = Script::new(vec![
        tool_call("call-1", "lights_on"),
        ModelResponse::text("I can't control the lights."),
    ]);
    let h = harness(model.clone(), clock_tool(), Duration::from_secs(300));
    let key = SessionKey::for_user("u1");

    let reply = h.agent.handle_prompt(&key, "turn on the lights").await.unwrap();
    assert_eq!(reply, "I can't control the lights.");

    let turns = stored_turns(&h.storage, "user:u1").await;
    assert_eq!(
        turns[2],
        Turn::ToolCallResult {
            id: "call-1".into(),
            name: "lights_on".into(),
            outcome: ToolOutcome::Failure("unknown tool".into()),
        }
    );

    // The model saw the error on its second request.
    let requests = model.requests.lock().unwrap();
    assert!(matches!(
        requests[1].last(),
        Some(Turn::ToolCallResult { outcome: ToolOutcome::Failure(_), .. })
    ));
}

#[tokio::test]
async fn idle_session_is_replaced_by_an_empty_one() {
    let model = Script::forever(ModelResponse::text("ok"));
    let h = harness(model.clone(), clock_tool(), Duration::from_secs(1));
    let key = SessionKey::for_user("u2");

    h.agent.handle_prompt(&key, "first").await.unwrap();
    h.clock.advance(chrono::Duration::seconds(2));

    let session = h.agent.sessions().get_or_create(&key).await.unwrap();
    assert!(session.is_empty());

    h.agent.handle_prompt(&key, "second").await.unwrap();
    let requests = model.requests.lock().unwrap();
    assert_eq!(requests[1], vec![Turn::user("second")]);
}

#[tokio::test]
async fn looping_model_hits_the_budget_and_session_survives() {
    let model = Script::forever(tool_call("again", "get_time"));
    let h = harness(model.clone(), clock_tool(), Duration::from_secs(300));
    let key = SessionKey::for_user("u3");

    let err = h.agent.handle_prompt(&key, "loop").await.unwrap_err();
    assert!(matches!(err, AgentError::LoopBudgetExceeded { budget: 3, .. }));
    assert_eq!(model.request_count(), 4);

    // Prior history is intact and usable on the next prompt.
    let turns = stored_turns(&h.storage, "user:u3").await;
    assert_eq!(turns.len(), 1 + 3 * 2);
    assert!(history::decode(&history::encode(&turns).unwrap()).is_ok());
}

#[tokio::test]
async fn failing_tool_still_completes_the_turn() {
    let mut tools = ToolRegistry::new();
    tools
        .register(Box::new(FnTool::new(
            "get_time",
            "Get the current time",
            empty_object_schema(),
            |_| async { Err::<Value, _>(anyhow::anyhow!("clock unavailable")) },
        )))
        .unwrap();
    let model = Script::new(vec![
        tool_call("call-1", "get_time"),
        ModelResponse::text("Sorry, I could not read the clock."),
    ]);
    let h = harness(model, tools, Duration::from_secs(300));
    let key = SessionKey::for_user("u4");

    let reply = h.agent.handle_prompt(&key, "time?").await.unwrap();
    assert_eq!(reply, "Sorry, I could not read the clock.");

    let turns = stored_turns(&h.storage, "user:u4").await;
    assert!(matches!(
        &turns[2],
        Turn::ToolCallResult {
            outcome: ToolOutcome::Failure(reason),
            ..
        } if reason == "clock unavailable"
    ));
}

#[tokio::test]
async fn concurrent_prompts_for_one_key_do_not_interleave() {
    let model = Script::forever(ModelResponse {
        reply: ModelReply::Text("done".into()),
        usage: TokenUsage::default(),
    });
    let h = harness(model, clock_tool(), Duration::from_secs(300));
    let key = SessionKey::for_user("u5");

    let mut handles = Vec::new();
    for i in 0..6 {
        let agent = h.agent.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            agent.handle_prompt(&key, &format!("prompt {i}")).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let turns = stored_turns(&h.storage, "user:u5").await;
    assert_eq!(turns.len(), 12);
    for pair in turns.chunks(2) {
        assert!(matches!(pair[0], Turn::UserMessage { .. }));
        assert!(matches!(pair[1], Turn::AgentMessage { .. }));
    }
}

#[tokio::test]
async fn token_sessions_are_private_to_their_owner() {
    let model = Script::forever(ModelResponse::text("hi"));
    let h = harness(model, clock_tool(), Duration::from_secs(300));

    let owner = SessionKey::with_token("alice", "shared-token");
    h.agent.handle_prompt(&owner, "hello").await.unwrap();

    let intruder = SessionKey::with_token("mallory", "shared-token");
    let err = h.agent.handle_prompt(&intruder, "show me").await.unwrap_err();
    assert_eq!(err.kind(), "session_forbidden");
    assert_eq!(stored_turns(&h.storage, "token:shared-token").await.len(), 2);
}

#[tokio::test]
async fn eviction_sweep_purges_stored_sessions() {
    let model = Script::forever(ModelResponse::text("ok"));
    let h = harness(model, clock_tool(), Duration::from_secs(60));

    h.agent
        .handle_prompt(&SessionKey::for_user("old"), "hi")
        .await
        .unwrap();
    h.clock.advance(chrono::Duration::seconds(45));
    h.agent
        .handle_prompt(&SessionKey::for_user("new"), "hi")
        .await
        .unwrap();
    h.clock.advance(chrono::Duration::seconds(30));

    let evicted = h.agent.sessions().evict_idle().await.unwrap();
    assert_eq!(evicted, 1);

    let remaining: Vec<String> = h
        .agent
        .sessions()
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(remaining, vec!["user:new"]);
}

#[tokio::test]
async fn spent_session_is_refused_before_the_model_is_asked() {
    let model = Script::new(vec![
        tool_call("call-1", "get_time"),
        ModelResponse::text("It is 12:00."),
    ]);
    let h = harness(model.clone(), clock_tool(), Duration::from_secs(300));
    let agent = h.agent.clone().with_token_limit(25);
    let key = SessionKey::for_user("u6");

    agent.handle_prompt(&key, "what time is it?").await.unwrap();
    let err = agent.handle_prompt(&key, "and now?").await.unwrap_err();
    assert_eq!(err.kind(), "token_limit_exceeded");
    assert_eq!(model.request_count(), 2);

    let record = h.storage.load("user:u6").await.unwrap().unwrap();
    assert_eq!(record.token_count, 25);
    assert_eq!(stored_turns(&h.storage, "user:u6").await.len(), 4);
}
