//! End-to-end behaviour of the orchestrator over real SQLite stores and
//! scripted capabilities.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use kindred_memory::semantic_index::IndexError;
use kindred_memory::{
    HashingEmbedder, InMemoryVectorIndex, LogError, LoggedTurn, MemoryCoordinator, SqliteTurnLog,
    TurnLog, VectorIndex,
};
use kindred_middleware::{EventBus, Topic};
use kindred_runtime::extensions::{CompletionPlanner, DAY_KEY, EventCatalog, NIGHT_KEY, PlanRouter};
use kindred_runtime::{
    AffectConfig, AffectEngine, CompletionModel, ExtensionChain, FALLBACK_REPLY, Orchestrator,
    OrchestratorConfig, SentimentScorer, spawn_event_scheduler,
};
use kindred_types::{
    AffectVector, CapabilityError, CompanionError, EventPayload, RecordId, Role, SessionId, Turn,
};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn sid(raw: &str) -> SessionId {
    SessionId::parse(raw).unwrap()
}

fn memory() -> Arc<MemoryCoordinator> {
    Arc::new(
        MemoryCoordinator::new(
            Arc::new(SqliteTurnLog::open_in_memory().unwrap()),
            Arc::new(InMemoryVectorIndex::new()),
        )
        .with_embedder(Some(Arc::new(HashingEmbedder::default()))),
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Scripted capabilities
// ─────────────────────────────────────────────────────────────────────────────

/// Replies `echo: <message>` after an optional delay.
struct Echo(Duration);

#[async_trait]
impl CompletionModel for Echo {
    async fn complete(&self, _s: &str, _h: &[Turn], msg: &str) -> Result<String, CapabilityError> {
        if !self.0.is_zero() {
            tokio::time::sleep(self.0).await;
        }
        Ok(format!("echo: {msg}"))
    }
}

struct Failing;

#[async_trait]
impl CompletionModel for Failing {
    async fn complete(&self, _s: &str, _h: &[Turn], _m: &str) -> Result<String, CapabilityError> {
        Err(CapabilityError::Unavailable("model offline".into()))
    }
}

/// Fixed reply regardless of input.
struct Canned(&'static str);

#[async_trait]
impl CompletionModel for Canned {
    async fn complete(&self, _s: &str, _h: &[Turn], _m: &str) -> Result<String, CapabilityError> {
        Ok(self.0.to_string())
    }
}

struct Scripted(Vec<(&'static str, f32)>);

impl SentimentScorer for Scripted {
    fn score(&self, text: &str) -> Result<f32, CapabilityError> {
        Ok(self.0.iter().find(|(t, _)| *t == text).map_or(0.0, |(_, s)| *s))
    }
}

struct Constant(f32);

impl SentimentScorer for Constant {
    fn score(&self, _text: &str) -> Result<f32, CapabilityError> {
        Ok(self.0)
    }
}

/// Index whose upserts always fail.
struct RejectingIndex;

impl VectorIndex for RejectingIndex {
    fn upsert(&self, _id: RecordId, _s: &SessionId, _e: &[f32]) -> Result<(), IndexError> {
        Err(IndexError::Poisoned)
    }
    fn query(&self, _s: &SessionId, _e: &[f32], _k: usize) -> Result<Vec<(RecordId, f32)>, IndexError> {
        Err(IndexError::Poisoned)
    }
    fn delete(&self, _id: RecordId) -> Result<bool, IndexError> {
        Ok(false)
    }
    fn contains(&self, _id: RecordId) -> Result<bool, IndexError> {
        Ok(false)
    }
}

/// Echoes after `delay` and tracks the peak number of overlapping calls.
struct Gauge {
    delay: Duration,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CompletionModel for Gauge {
    async fn complete(&self, _s: &str, _h: &[Turn], msg: &str) -> Result<String, CapabilityError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(format!("echo: {msg}"))
    }
}

/// Echoes and keeps the history window of every call.
#[derive(Default)]
struct WindowRecorder(Mutex<Vec<Vec<String>>>);

#[async_trait]
impl CompletionModel for WindowRecorder {
    async fn complete(&self, _s: &str, history: &[Turn], msg: &str) -> Result<String, CapabilityError> {
        let texts = history.iter().map(|t| t.text.clone()).collect();
        self.0.lock().unwrap().push(texts);
        Ok(format!("echo: {msg}"))
    }
}

/// SQLite log that accepts `budget` more appends, then fails.
struct RationedLog {
    inner: SqliteTurnLog,
    budget: AtomicUsize,
}

impl RationedLog {
    fn new(budget: usize) -> Result<Self, LogError> {
        Ok(Self {
            inner: SqliteTurnLog::open_in_memory()?,
            budget: AtomicUsize::new(budget),
        })
    }
}

impl TurnLog for RationedLog {
    fn append(&self, turn: &Turn) -> Result<LoggedTurn, LogError> {
        if self
            .budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err()
        {
            return Err(LogError::Poisoned);
        }
        self.inner.append(turn)
    }
    fn read_all(&self, s: &SessionId) -> Result<Vec<Turn>, LogError> {
        self.inner.read_all(s)
    }
    fn read_since(&self, s: &SessionId, cursor: u64) -> Result<Vec<LoggedTurn>, LogError> {
        self.inner.read_since(s, cursor)
    }
    fn get(&self, id: RecordId) -> Result<Option<LoggedTurn>, LogError> {
        self.inner.get(id)
    }
    fn sessions(&self) -> Result<Vec<SessionId>, LogError> {
        self.inner.sessions()
    }
    fn count(&self, s: &SessionId) -> Result<usize, LogError> {
        self.inner.count(s)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Ordering and concurrency
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn history_order_matches_call_order_across_concurrent_sessions() -> TestResult {
    let orch = Arc::new(
        Orchestrator::new(memory(), OrchestratorConfig::default())
            .with_completion(Some(Arc::new(Echo(Duration::from_millis(2))))),
    );

    let mut tasks = Vec::new();
    for n in 0..8 {
        let orch = orch.clone();
        tasks.push(tokio::spawn(async move {
            let s = sid(&format!("user-{n}"));
            for i in 0..5 {
                orch.handle_message(&s, &format!("message {i}")).await?;
            }
            Ok::<_, CompanionError>(s)
        }));
    }

    for task in tasks {
        let s = task.await??;
        let history = orch.history(&s)?;
        assert_eq!(history.len(), 10);
        for (i, pair) in history.chunks(2).enumerate() {
            assert_eq!(pair[0].role, Role::User);
            assert_eq!(pair[0].text, format!("message {i}"));
            assert_eq!(pair[1].role, Role::Assistant);
            assert_eq!(pair[1].text, format!("echo: message {i}"));
            assert_eq!(pair[0].session_id, s);
        }
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_on_one_session_never_interleave() -> TestResult {
    let orch = Arc::new(
        Orchestrator::new(memory(), OrchestratorConfig::default())
            .with_completion(Some(Arc::new(Echo(Duration::from_millis(3))))),
    );
    let s = sid("shared");

    let tasks: Vec<_> = (0..10)
        .map(|i| {
            let orch = orch.clone();
            let s = s.clone();
            tokio::spawn(async move { orch.handle_message(&s, &format!("m{i}")).await })
        })
        .collect();
    for task in tasks {
        task.await??;
    }

    let history = orch.history(&s)?;
    assert_eq!(history.len(), 20);
    for pair in history.chunks(2) {
        assert_eq!(pair[0].role, Role::User);
        assert_eq!(pair[1].text, format!("echo: {}", pair[0].text));
    }
    assert!(history.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn closing_during_a_slow_exchange_never_forks_the_session() -> TestResult {
    let model = Arc::new(Gauge::new(Duration::from_millis(200)));
    let orch = Arc::new(
        Orchestrator::new(memory(), OrchestratorConfig::default()).with_completion(Some(model.clone())),
    );
    let s = sid("shared");

    let first = {
        let (orch, s) = (orch.clone(), s.clone());
        tokio::spawn(async move { orch.handle_message(&s, "first").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let close = {
        let (orch, s) = (orch.clone(), s.clone());
        tokio::spawn(async move { orch.close_session(&s).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = orch.handle_message(&s, "second").await?;
    assert_eq!(second.reply, "echo: second");
    assert!(close.await?);
    first.await??;

    assert_eq!(model.peak.load(Ordering::SeqCst), 1);
    let texts: Vec<_> = orch.history(&s)?.into_iter().map(|t| t.text).collect();
    assert_eq!(texts, ["first", "echo: first", "second", "echo: second"]);
    assert_eq!(orch.sessions(), [s]);
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Degradation
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn completion_timeout_returns_fallback_within_bound() -> TestResult {
    let orch = Orchestrator::new(
        memory(),
        OrchestratorConfig {
            completion_timeout: Duration::from_millis(200),
            ..OrchestratorConfig::default()
        },
    )
    .with_completion(Some(Arc::new(Echo(Duration::from_secs(120)))));

    let started = tokio::time::Instant::now();
    let reply = orch.handle_message(&sid("u1"), "are you there?").await?;
    assert_eq!(reply.reply, FALLBACK_REPLY);
    assert!(started.elapsed() < Duration::from_secs(1));

    let history = orch.history(&sid("u1"))?;
    assert_eq!(history[1].text, FALLBACK_REPLY);
    Ok(())
}

#[tokio::test]
async fn failing_completion_degrades_and_raises_alert() -> TestResult {
    let bus = EventBus::default();
    let mut alerts = bus.subscribe_to(Topic::SystemAlerts);
    let orch = Orchestrator::new(memory(), OrchestratorConfig::default())
        .with_completion(Some(Arc::new(Failing)))
        .with_bus(bus);

    let reply = orch.handle_message(&sid("u1"), "hello").await?;
    assert_eq!(reply.reply, FALLBACK_REPLY);

    let event = alerts.recv().await?;
    assert!(matches!(event.payload, EventPayload::Degraded { ref component, .. } if component == "completion"));
    Ok(())
}

#[tokio::test]
async fn index_failure_never_blocks_the_conversation() -> TestResult {
    let mem = Arc::new(
        MemoryCoordinator::new(Arc::new(SqliteTurnLog::open_in_memory()?), Arc::new(RejectingIndex))
            .with_embedder(Some(Arc::new(HashingEmbedder::default()))),
    );
    let orch = Orchestrator::new(mem, OrchestratorConfig::default())
        .with_completion(Some(Arc::new(Echo(Duration::ZERO))));

    let s = sid("u1");
    let first = orch.handle_message(&s, "remember my umbrella").await?;
    let second = orch.handle_message(&s, "where is my umbrella?").await?;
    assert_eq!(first.reply, "echo: remember my umbrella");
    assert_eq!(second.reply, "echo: where is my umbrella?");

    assert_eq!(orch.history(&s)?.len(), 4);
    let stats = orch.memory_stats();
    assert_eq!(stats.stored, 4);
    assert_eq!(stats.index_failures, 4);
    assert_eq!(stats.retrieval_failures, 2);
    Ok(())
}

#[tokio::test]
async fn log_failure_is_the_only_error_and_session_recovers() -> TestResult {
    let log = Arc::new(RationedLog::new(usize::MAX)?);
    let mem = Arc::new(MemoryCoordinator::new(log.clone(), Arc::new(InMemoryVectorIndex::new())));
    let orch = Orchestrator::new(mem, OrchestratorConfig::default())
        .with_completion(Some(Arc::new(Echo(Duration::ZERO))));
    let s = sid("u1");

    orch.handle_message(&s, "first").await?;
    let before = orch.affect(&s).await;

    log.budget.store(0, Ordering::SeqCst);
    let err = orch.handle_message(&s, "second").await.unwrap_err();
    assert!(matches!(err, CompanionError::Persistence(_)));
    assert_eq!(orch.affect(&s).await, before, "affect untouched by a failed exchange");

    log.budget.store(usize::MAX, Ordering::SeqCst);
    orch.handle_message(&s, "third").await?;
    let texts: Vec<_> = orch.history(&s)?.into_iter().map(|t| t.text).collect();
    assert_eq!(texts, ["first", "echo: first", "third", "echo: third"]);
    Ok(())
}

#[tokio::test]
async fn failed_assistant_write_keeps_the_stored_user_turn() -> TestResult {
    // The user turn lands; the assistant turn does not.
    let log = Arc::new(RationedLog::new(1)?);
    let mem = Arc::new(MemoryCoordinator::new(log.clone(), Arc::new(InMemoryVectorIndex::new())));
    let model = Arc::new(WindowRecorder::default());
    let orch = Orchestrator::new(mem, OrchestratorConfig::default()).with_completion(Some(model.clone()));
    let s = sid("u1");

    let err = orch.handle_message(&s, "hello").await.unwrap_err();
    assert!(matches!(err, CompanionError::Persistence(_)));

    let texts: Vec<_> = orch.history(&s)?.into_iter().map(|t| t.text).collect();
    assert_eq!(texts, ["hello"]);
    assert_eq!(orch.affect(&s).await, AffectVector::NEUTRAL);
    assert!(orch.affect_history(&s).await.is_empty());

    // The in-memory window matches the log: the orphaned user turn only.
    log.budget.store(usize::MAX, Ordering::SeqCst);
    orch.handle_message(&s, "again").await?;
    let windows = model.0.lock().unwrap().clone();
    assert_eq!(windows, [Vec::<String>::new(), vec!["hello".to_string()]]);

    let texts: Vec<_> = orch.history(&s)?.into_iter().map(|t| t.text).collect();
    assert_eq!(texts, ["hello", "again", "echo: again"]);
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Affect
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn love_then_hate_moves_mood_and_spares_trust() -> TestResult {
    let engine = AffectEngine::new(AffectConfig::default())
        .with_scorer(Some(Arc::new(Scripted(vec![("I love this", 0.8), ("I hate this", -0.7)]))));
    let orch = Orchestrator::new(memory(), OrchestratorConfig::default())
        .with_completion(Some(Arc::new(Canned("I see."))))
        .with_affect_engine(engine);
    let s = sid("u1");
    let start = orch.affect(&s).await;
    assert_eq!(start, AffectVector::NEUTRAL);

    let loved = orch.handle_message(&s, "I love this").await?;
    assert!(loved.affect.mood > start.mood);
    assert_eq!(loved.affect.trust, start.trust);
    assert!(loved.affect.energy > start.energy);

    let hated = orch.handle_message(&s, "I hate this").await?;
    assert!(hated.affect.mood < loved.affect.mood);
    assert!(hated.affect.is_valid());

    assert_eq!(orch.affect(&s).await, hated.affect);
    assert_eq!(orch.affect_history(&s).await.len(), 2);
    Ok(())
}

#[tokio::test]
async fn thousand_negative_messages_keep_affect_bounded() -> TestResult {
    // No embedder: this exercises the exchange pipeline, not retrieval.
    let mem = Arc::new(MemoryCoordinator::new(
        Arc::new(SqliteTurnLog::open_in_memory()?),
        Arc::new(InMemoryVectorIndex::new()),
    ));
    let engine = AffectEngine::new(AffectConfig::default()).with_scorer(Some(Arc::new(Constant(-1.0))));
    let orch = Orchestrator::new(
        mem,
        OrchestratorConfig {
            history_window: 4,
            ..OrchestratorConfig::default()
        },
    )
    .with_completion(Some(Arc::new(Canned("..."))))
    .with_affect_engine(engine);
    let s = sid("grump");

    let mut last = AffectVector::NEUTRAL;
    for _ in 0..1000 {
        last = orch.handle_message(&s, "this is awful and I hate everything").await?.affect;
        assert!(last.is_valid());
    }
    assert!(last.mood < 1e-3);
    assert_eq!(last.trust, 0.0);
    assert_eq!(orch.history(&s)?.len(), 2000);
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Extensions
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn plan_directive_bypasses_completion() -> TestResult {
    let planner_model = Arc::new(Canned("1. Gather flour\n2. Knead dough\n3. Bake"));
    let mut chain = ExtensionChain::new();
    chain.push(Arc::new(PlanRouter::new(
        Arc::new(CompletionPlanner::new(planner_model)),
        Duration::from_secs(5),
    )));
    let orch = Orchestrator::new(memory(), OrchestratorConfig::default())
        .with_completion(Some(Arc::new(Canned("plain reply"))))
        .with_extensions(chain);
    let s = sid("baker");

    let planned = orch.handle_message(&s, "/plan bake bread").await?;
    assert_eq!(planned.reply, "1. Gather flour\n2. Knead dough\n3. Bake");
    assert_eq!(planned.plan.as_deref().map(<[String]>::len), Some(3));

    let plain = orch.handle_message(&s, "thanks!").await?;
    assert_eq!(plain.reply, "plain reply");
    assert!(plain.plan.is_none());

    let history = orch.history(&s)?;
    assert_eq!(history[0].text, "/plan bake bread");
    assert_eq!(history[1].text, planned.reply);
    Ok(())
}

#[tokio::test]
async fn events_follow_time_of_day_and_skip_completion() -> TestResult {
    let mut catalog = EventCatalog::empty();
    catalog.insert(DAY_KEY, ["The afternoon sun warms the room."]);
    catalog.insert(NIGHT_KEY, ["An owl hoots somewhere outside."]);
    let orch = Orchestrator::new(memory(), OrchestratorConfig::default())
        .with_completion(Some(Arc::new(Failing)))
        .with_event_catalog(catalog);
    let s = sid("u1");
    let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();

    let afternoon = orch.trigger_event(&s, day.and_hms_opt(14, 0, 0).unwrap()).await?.unwrap();
    let late = orch.trigger_event(&s, day.and_hms_opt(23, 0, 0).unwrap()).await?.unwrap();
    assert_eq!(afternoon.text, "The afternoon sun warms the room.");
    assert_eq!(late.text, "An owl hoots somewhere outside.");

    let history = orch.history(&s)?;
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|t| t.role == Role::Event));
    assert_eq!(orch.memory_stats().stored, 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn scheduler_delivers_events_to_open_sessions() -> TestResult {
    let orch = Arc::new(Orchestrator::new(memory(), OrchestratorConfig::default()));
    let s = sid("u1");
    orch.handle_message(&s, "hi").await?;

    assert!(spawn_event_scheduler(orch.clone(), Duration::ZERO).is_none());
    let handle = spawn_event_scheduler(orch.clone(), Duration::from_secs(30))
        .ok_or("scheduler not started")?;

    tokio::time::sleep(Duration::from_secs(31)).await;
    for _ in 0..100 {
        if orch.history(&s)?.len() > 2 {
            break;
        }
        tokio::task::yield_now().await;
    }
    handle.abort();

    let history = orch.history(&s)?;
    assert_eq!(history.len(), 3);
    assert_eq!(history[2].role, Role::Event);
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Bus
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn exchange_publishes_turns_then_affect() -> TestResult {
    let bus = EventBus::default();
    let mut all = bus.subscribe();
    let orch = Orchestrator::new(memory(), OrchestratorConfig::default())
        .with_completion(Some(Arc::new(Echo(Duration::ZERO))))
        .with_bus(bus);

    orch.handle_message(&sid("u1"), "ping").await?;

    let mut kinds = Vec::new();
    for _ in 0..3 {
        kinds.push(match all.recv().await?.payload {
            EventPayload::TurnRecorded { turn, .. } => turn.role.as_str(),
            EventPayload::AffectUpdated { .. } => "affect",
            _ => "other",
        });
    }
    assert_eq!(kinds, ["user", "assistant", "affect"]);

    assert!(orch.close_session(&sid("u1")).await);
    assert!(matches!(all.recv().await?.payload, EventPayload::SessionClosed(_)));
    Ok(())
}
