//! End-to-end debate runs: queue → worker → `RUN_DEBATE` handler →
//! orchestrator → session store and ledger, with a scripted completion.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use coordination::debate::{
    run_debate_key, CompletionError, DebateJobHandler, DebateOrchestrator, DebateSession,
    DebateSettings, DebateStatus, FileSessionStore, KnowledgeAssociations, KnowledgePack,
    MemoryKnowledgeCatalog, Persona, SessionStore, TurnCompletion, TurnKind, TurnRequest,
    TurnResponse, MODERATOR_ID, RUN_DEBATE,
};
use coordination::events::RunNotifier;
use coordination::ledger::{EventQuery, EventType, Ledger, RunStatus, TokenUsage};
use coordination::queue::{EnqueueOptions, FileJobQueue, JobQueue, JobStatus, SharedJobQueue};
use coordination::worker::{HandlerRegistry, IterationOutcome, Worker, WorkerOptions};
use serde_json::json;
use tempfile::{tempdir, TempDir};

/// Answers every turn, optionally failing one call by position, and keeps
/// the prompts it was sent.
struct Scripted {
    calls: AtomicUsize,
    fail_on_call: Option<usize>,
    prompts: Mutex<Vec<(String, String)>>,
}

impl Scripted {
    fn new(fail_on_call: Option<usize>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_on_call,
            prompts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl TurnCompletion for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete_turn(
        &self,
        persona: &Persona,
        request: &TurnRequest,
    ) -> Result<TurnResponse, CompletionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.prompts
            .lock()
            .unwrap()
            .push((persona.id.clone(), request.prompt.clone()));
        if self.fail_on_call == Some(call) {
            return Err(CompletionError::Status {
                status: 503,
                body: "overloaded".into(),
            });
        }
        Ok(TurnResponse {
            text: format!("{} makes point #{call}", persona.name),
            raw: json!({}),
            model: "gpt-4o-mini".into(),
            usage: Some(TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 50,
                total_tokens: 150,
            }),
        })
    }
}

struct Stack {
    _dir: TempDir,
    queue: SharedJobQueue,
    ledger: Ledger,
    sessions: Arc<FileSessionStore>,
    completion: Arc<Scripted>,
    worker: Worker,
}

fn stack(completion: Scripted, catalog: MemoryKnowledgeCatalog) -> Stack {
    let dir = tempdir().unwrap();
    let queue: SharedJobQueue = Arc::new(FileJobQueue::open(dir.path()).unwrap());
    let ledger = Ledger::open(dir.path()).unwrap();
    let sessions = Arc::new(FileSessionStore::open(dir.path()).unwrap());
    let completion = Arc::new(completion);

    let orchestrator = DebateOrchestrator::new(
        sessions.clone(),
        completion.clone(),
        Arc::new(catalog),
    )
    .with_event_log(ledger.events.clone());
    let handlers =
        HandlerRegistry::new().register(Arc::new(DebateJobHandler::new(Arc::new(orchestrator))));
    let worker = Worker::new(
        queue.clone(),
        ledger.clone(),
        handlers,
        RunNotifier::new().shared(),
        WorkerOptions {
            worker_id: "debate-worker".into(),
            poll_interval: Duration::from_millis(10),
            lease_ms: 60_000,
            backoff_base_ms: 0,
        },
    );
    Stack {
        _dir: dir,
        queue,
        ledger,
        sessions,
        completion,
        worker,
    }
}

fn two_persona_session(id: &str) -> DebateSession {
    DebateSession::new(
        id,
        "Should cities ban cars from downtown?",
        vec![
            Persona::new("ada", "Ada", "urban economist"),
            Persona::new("ben", "Ben", "small business owner"),
        ],
        DebateSettings {
            rounds: 2,
            ..Default::default()
        },
    )
}

fn enqueue_debate(stack: &Stack, debate_id: &str) -> coordination::queue::Job {
    stack
        .queue
        .enqueue(
            RUN_DEBATE,
            json!({ "debateId": debate_id, "requestId": "req-42" }),
            EnqueueOptions::default()
                .idempotency_key(run_debate_key(debate_id))
                .max_attempts(3),
        )
        .unwrap()
        .job
}

fn turn_order(session: &DebateSession) -> Vec<(String, u32, TurnKind)> {
    session
        .turns
        .iter()
        .map(|t| (t.speaker_id.clone(), t.round, t.kind))
        .collect()
}

fn expected_order() -> Vec<(String, u32, TurnKind)> {
    vec![
        ("ada".into(), 1, TurnKind::Persona),
        ("ben".into(), 1, TurnKind::Persona),
        (MODERATOR_ID.into(), 1, TurnKind::ModeratorSummary),
        ("ada".into(), 2, TurnKind::Persona),
        ("ben".into(), 2, TurnKind::Persona),
        (MODERATOR_ID.into(), 2, TurnKind::ModeratorSummary),
        (MODERATOR_ID.into(), 2, TurnKind::ModeratorFinal),
    ]
}

#[tokio::test]
async fn test_debate_job_runs_every_turn_in_order() {
    let stack = stack(Scripted::new(None), MemoryKnowledgeCatalog::new());
    stack.sessions.save(&two_persona_session("d1")).unwrap();
    let job = enqueue_debate(&stack, "d1");

    let outcome = stack.worker.run_once().await.unwrap();
    assert!(matches!(outcome, IterationOutcome::Completed { .. }));

    let session = stack.sessions.load("d1").unwrap().unwrap();
    assert_eq!(session.status, DebateStatus::Completed);
    assert_eq!(turn_order(&session), expected_order());
    assert!(session
        .turns
        .iter()
        .enumerate()
        .all(|(i, t)| t.index == i));
    let statuses: Vec<_> = session.transitions.iter().map(|t| (t.from, t.to)).collect();
    assert_eq!(
        statuses,
        vec![
            (DebateStatus::Queued, DebateStatus::Running),
            (DebateStatus::Running, DebateStatus::Completed),
        ]
    );
    assert!(session.started_at.is_some() && session.completed_at.is_some());

    let transcript = stack.sessions.transcript("d1").unwrap();
    assert!(transcript.contains("## Round 1 - Ada (persona)"));
    assert!(transcript.contains("Moderator (moderatorFinal)"));

    let done = stack.queue.get(&job.id).unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    let result = done.result.unwrap();
    assert_eq!(result["debateId"], "d1");
    assert_eq!(result["status"], "completed");
    assert_eq!(result["turns"], 7);
}

#[tokio::test]
async fn test_debate_llm_calls_land_in_the_ledger() {
    let stack = stack(Scripted::new(None), MemoryKnowledgeCatalog::new());
    stack.sessions.save(&two_persona_session("d1")).unwrap();
    let job = enqueue_debate(&stack, "d1");
    stack.worker.run_once().await.unwrap();

    let events = stack
        .ledger
        .events
        .list_events(&EventQuery::for_run(&job.run_id))
        .unwrap();
    let count = |kind: EventType| events.iter().filter(|e| e.event_type == kind).count();
    assert_eq!(count(EventType::RunStarted), 1);
    assert_eq!(count(EventType::LLMCallStarted), 7);
    assert_eq!(count(EventType::LLMCallFinished), 7);
    assert_eq!(count(EventType::RunFinished), 1);
    assert!(events
        .iter()
        .all(|e| e.request_id.as_deref() == Some("req-42")));
    let llm = events
        .iter()
        .find(|e| e.event_type == EventType::LLMCallFinished)
        .unwrap();
    assert_eq!(llm.component, "debate");
    assert_eq!(llm.data["debateId"], "d1");
    assert_eq!(llm.data["speaker"], "ada");

    let run = stack.ledger.runs.get_by_id(&job.run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.kind, RUN_DEBATE);
    assert_eq!(run.tokens.total_tokens, 7 * 150);
    assert_eq!(run.tokens.prompt_tokens, 7 * 100);
    assert!(run.estimated_cost_usd > 0.0);

    let summaries = stack.ledger.list_runs(stack.queue.as_ref(), 10).unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].tokens.total_tokens, 7 * 150);
    assert_eq!(summaries[0].status, RunStatus::Completed);
}

#[tokio::test]
async fn test_retry_resumes_without_duplicating_turns() {
    // Call 5 is Ben's round-two turn.
    let stack = stack(Scripted::new(Some(5)), MemoryKnowledgeCatalog::new());
    stack.sessions.save(&two_persona_session("d1")).unwrap();
    let job = enqueue_debate(&stack, "d1");

    let first = stack.worker.run_once().await.unwrap();
    assert!(matches!(first, IterationOutcome::RetryScheduled { .. }));
    let failed = stack.sessions.load("d1").unwrap().unwrap();
    assert_eq!(failed.status, DebateStatus::Failed);
    assert_eq!(failed.turns.len(), 4);
    assert!(failed.error.unwrap().contains("ben"));

    let pending = stack.queue.get(&job.id).unwrap().unwrap();
    assert_eq!(pending.status, JobStatus::Pending);
    assert_eq!(pending.last_error.unwrap().code, "PROVIDER_HTTP_ERROR");

    let second = stack.worker.run_once().await.unwrap();
    assert!(matches!(second, IterationOutcome::Completed { .. }));

    let session = stack.sessions.load("d1").unwrap().unwrap();
    assert_eq!(session.status, DebateStatus::Completed);
    assert_eq!(turn_order(&session), expected_order());
    assert!(session.error.is_none());
    let statuses: Vec<_> = session.transitions.iter().map(|t| (t.from, t.to)).collect();
    assert_eq!(
        statuses,
        vec![
            (DebateStatus::Queued, DebateStatus::Running),
            (DebateStatus::Running, DebateStatus::Failed),
            (DebateStatus::Failed, DebateStatus::Running),
            (DebateStatus::Running, DebateStatus::Completed),
        ]
    );
    // Four turns, one failed call, then the three missing turns.
    assert_eq!(stack.completion.calls.load(Ordering::SeqCst), 8);

    let transcript = stack.sessions.transcript("d1").unwrap();
    assert_eq!(transcript.matches("## Round ").count(), 7);
    assert_eq!(transcript.matches("## Round 2 - Ben (persona)").count(), 1);

    let run = stack.ledger.runs.get_by_id(&job.run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.error.is_none());
}

#[tokio::test]
async fn test_interrupted_debate_is_resumed() {
    let stack = stack(Scripted::new(None), MemoryKnowledgeCatalog::new());
    let mut session = two_persona_session("d1");
    session.transition(DebateStatus::Running, "started").unwrap();
    let ada = session.personas[0].clone();
    session.push_turn(1, &ada, TurnKind::Persona, "Opening.".into(), None, 10);
    stack.sessions.save(&session).unwrap();
    enqueue_debate(&stack, "d1");

    let outcome = stack.worker.run_once().await.unwrap();
    assert!(matches!(outcome, IterationOutcome::Completed { .. }));

    let session = stack.sessions.load("d1").unwrap().unwrap();
    assert_eq!(turn_order(&session), expected_order());
    assert_eq!(session.turns[0].text, "Opening.");
    assert!(session
        .transitions
        .iter()
        .any(|t| t.to == DebateStatus::Failed && t.reason == "worker lease expired"));
    assert_eq!(stack.completion.calls.load(Ordering::SeqCst), 6);

    // The turn saved before the interruption is in the transcript exactly once.
    let transcript = stack.sessions.transcript("d1").unwrap();
    assert_eq!(transcript.matches("Opening.").count(), 1);
    assert_eq!(transcript.matches("## Round ").count(), 7);
    assert!(transcript.starts_with("## Round 1 - Ada (persona)"));
}

#[tokio::test]
async fn test_duplicate_persona_ids_fail_terminally() {
    let stack = stack(Scripted::new(None), MemoryKnowledgeCatalog::new());
    let session = DebateSession::new(
        "dup",
        "Remote work",
        vec![
            Persona::new("x", "Alice", "founder"),
            Persona::new("x", "Bob", "engineer"),
        ],
        DebateSettings {
            rounds: 1,
            include_moderator: false,
            ..Default::default()
        },
    );
    stack.sessions.save(&session).unwrap();
    let job = enqueue_debate(&stack, "dup");

    let outcome = stack.worker.run_once().await.unwrap();
    assert!(matches!(
        outcome,
        IterationOutcome::Failed { ref code, .. } if code == "VALIDATION_ERROR"
    ));
    let failed = stack.queue.get(&job.id).unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.last_error.unwrap().message.contains("duplicate persona id 'x'"));
    assert_eq!(stack.completion.calls.load(Ordering::SeqCst), 0);
    assert!(stack.sessions.load("dup").unwrap().unwrap().turns.is_empty());
}

#[tokio::test]
async fn test_unknown_debate_fails_terminally() {
    let stack = stack(Scripted::new(None), MemoryKnowledgeCatalog::new());
    let job = enqueue_debate(&stack, "missing");

    let outcome = stack.worker.run_once().await.unwrap();
    assert!(matches!(
        outcome,
        IterationOutcome::Failed { ref code, .. } if code == "VALIDATION_ERROR"
    ));
    assert_eq!(
        stack.queue.get(&job.id).unwrap().unwrap().status,
        JobStatus::Failed
    );
    assert_eq!(stack.completion.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_enqueue_is_idempotent_per_debate() {
    let stack = stack(Scripted::new(None), MemoryKnowledgeCatalog::new());
    stack.sessions.save(&two_persona_session("d1")).unwrap();
    let first = enqueue_debate(&stack, "d1");
    let second = enqueue_debate(&stack, "d1");
    assert_eq!(first.id, second.id);

    stack.worker.run_once().await.unwrap();
    // Completed jobs still absorb the key.
    assert_eq!(enqueue_debate(&stack, "d1").id, first.id);
    assert_eq!(stack.worker.run_once().await.unwrap(), IterationOutcome::Idle);
}

#[tokio::test]
async fn test_knowledge_packs_reach_the_persona_prompt() {
    let catalog = MemoryKnowledgeCatalog::from_packs(vec![
        KnowledgePack::new("traffic", "Traffic study", "Congestion fell 30% after the 2019 ban."),
        KnowledgePack::new("retail", "Retail survey", "Foot traffic rose in pedestrian zones."),
    ]);
    let stack = stack(Scripted::new(None), catalog);
    let mut knowledge = KnowledgeAssociations::default();
    knowledge.global.push("traffic".into());
    knowledge
        .per_persona
        .insert("ben".into(), vec!["retail".into(), "missing".into()]);
    let session = two_persona_session("d1").with_knowledge(knowledge);
    stack.sessions.save(&session).unwrap();
    enqueue_debate(&stack, "d1");

    stack.worker.run_once().await.unwrap();

    let prompts = stack.completion.prompts.lock().unwrap().clone();
    let first_of = |speaker: &str| {
        prompts
            .iter()
            .find(|(id, _)| id == speaker)
            .map(|(_, prompt)| prompt.clone())
            .unwrap()
    };
    let ada = first_of("ada");
    let ben = first_of("ben");
    assert!(ada.contains("Congestion fell 30%"));
    assert!(!ada.contains("Foot traffic rose"));
    assert!(ben.contains("Congestion fell 30%"));
    assert!(ben.contains("Foot traffic rose"));
}
