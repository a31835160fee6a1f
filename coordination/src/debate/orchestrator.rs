//! Debate orchestrator: drives a session through its rounds.
//!
//! For each round, every persona speaks once in the session's fixed order;
//! with a moderator enabled, a round summary follows each round and a final
//! synthesis follows the last one. Turns are persisted as they complete, so
//! a failed session keeps its partial transcript and a retry resumes at the
//! first missing turn.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, info_span, warn, Instrument};

use super::knowledge::{resolve_packs, KnowledgeCatalog};
use super::prompt;
use super::provider::{CompletionError, TurnCompletion, TurnRequest};
use super::state::{
    DebateSession, DebateStatus, Persona, TransitionError, Turn, TurnKind, MODERATOR_ID,
};
use super::store::{SessionStore, SessionStoreError};
use crate::ledger::{EventLog, EventRecord, EventType};

const COMPONENT: &str = "debate";

/// Error from the debate orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum DebateError {
    /// The session cannot run as stored. Retrying will not help.
    #[error("Invalid debate: {0}")]
    Invalid(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Turn for {speaker} failed: {source}")]
    Completion {
        speaker: String,
        #[source]
        source: CompletionError,
    },

    #[error("Session store error: {0}")]
    Store(#[from] SessionStoreError),
}

impl DebateError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Invalid(_) => "VALIDATION_ERROR",
            Self::Transition(_) => "DEBATE_INVALID_TRANSITION",
            Self::Completion { source, .. } => source.code(),
            Self::Store(e) => e.code(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Invalid(_))
    }
}

/// Result of running a debate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebateOutcome {
    pub debate_id: String,
    pub status: DebateStatus,
    pub turns: usize,
    pub rounds: u32,
}

impl DebateOutcome {
    fn of(session: &DebateSession) -> Self {
        Self {
            debate_id: session.debate_id.clone(),
            status: session.status,
            turns: session.turns.len(),
            rounds: session.settings.rounds,
        }
    }
}

pub struct DebateOrchestrator {
    sessions: Arc<dyn SessionStore>,
    completion: Arc<dyn TurnCompletion>,
    knowledge: Arc<dyn KnowledgeCatalog>,
    events: Option<Arc<EventLog>>,
}

impl DebateOrchestrator {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        completion: Arc<dyn TurnCompletion>,
        knowledge: Arc<dyn KnowledgeCatalog>,
    ) -> Self {
        Self {
            sessions,
            completion,
            knowledge,
            events: None,
        }
    }

    /// Record LLM call events in `events`.
    pub fn with_event_log(mut self, events: Arc<EventLog>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    /// Run the debate to completion.
    ///
    /// A completed session is returned as is. On error the session is saved
    /// as failed with the error message before the error is returned.
    pub async fn run(&self, debate_id: &str) -> Result<DebateOutcome, DebateError> {
        let mut session = self
            .sessions
            .load(debate_id)?
            .ok_or_else(|| DebateError::Invalid(format!("debate {debate_id} not found")))?;
        session.validate().map_err(DebateError::Invalid)?;

        if session.status == DebateStatus::Completed {
            info!(debate_id, "Debate already completed");
            return Ok(DebateOutcome::of(&session));
        }

        // A running session here was abandoned by a crashed worker whose
        // lease expired.
        if session.status == DebateStatus::Running {
            warn!(debate_id, "Resuming interrupted debate");
            session.transition(DebateStatus::Failed, "worker lease expired")?;
        }
        let reason = if session.status == DebateStatus::Failed {
            "retry"
        } else {
            "started"
        };
        session.transition(DebateStatus::Running, reason)?;
        session.set_progress(0, None, "starting");
        self.sessions.save(&session)?;

        let span = info_span!("debate", debate_id = %session.debate_id, rounds = session.settings.rounds);
        let result = self.execute(&mut session).instrument(span).await;

        match result {
            Ok(()) => {
                session.transition(DebateStatus::Completed, "all rounds finished")?;
                let rounds = session.settings.rounds;
                session.set_progress(rounds, None, "completed");
                self.sessions.save(&session)?;
                info!(debate_id, turns = session.turns.len(), "Debate completed");
                Ok(DebateOutcome::of(&session))
            }
            Err(e) => {
                self.record_failure(&mut session, &e);
                Err(e)
            }
        }
    }

    fn record_failure(&self, session: &mut DebateSession, error: &DebateError) {
        session.error = Some(error.to_string());
        if let Err(t) = session.transition(DebateStatus::Failed, &error.to_string()) {
            warn!(debate_id = %session.debate_id, error = %t, "Could not mark debate failed");
        }
        session.set_progress(session.progress.round, None, "failed");
        if let Err(save) = self.sessions.save(session) {
            warn!(debate_id = %session.debate_id, error = %save, "Could not persist debate failure");
        }
        warn!(debate_id = %session.debate_id, code = error.code(), error = %error, "Debate failed");
    }

    async fn execute(&self, session: &mut DebateSession) -> Result<(), DebateError> {
        let rounds = session.settings.rounds;
        let moderator = Persona::moderator(&session.settings);
        let personas = session.personas.clone();

        // The transcript may trail the saved turns if the last run died
        // between the two writes.
        self.sessions
            .write_transcript(&session.debate_id, &render_transcript(session))?;

        for round in 1..=rounds {
            let summary = session.moderator_summary_before(round).map(str::to_string);

            for persona in &personas {
                if session.has_turn(round, &persona.id, TurnKind::Persona) {
                    continue;
                }
                session.set_progress(round, Some(&persona.id), format!("{} is speaking", persona.name));
                self.sessions.save(session)?;

                let pack_ids = session.knowledge.pack_ids_for(&persona.id);
                let packs = resolve_packs(self.knowledge.as_ref(), &pack_ids);
                let request = prompt::persona_turn(session, persona, round, &packs, summary.as_deref());
                self.take_turn(session, persona, round, TurnKind::Persona, request)
                    .await?;
            }

            if session.settings.include_moderator
                && !session.has_turn(round, MODERATOR_ID, TurnKind::ModeratorSummary)
            {
                session.set_progress(round, Some(MODERATOR_ID), "moderator is summarizing");
                self.sessions.save(session)?;
                let request = prompt::round_summary(session, &moderator, round);
                self.take_turn(session, &moderator, round, TurnKind::ModeratorSummary, request)
                    .await?;
            }
        }

        if session.settings.include_moderator
            && !session.has_turn(rounds, MODERATOR_ID, TurnKind::ModeratorFinal)
        {
            session.set_progress(rounds, Some(MODERATOR_ID), "moderator is writing the synthesis");
            self.sessions.save(session)?;
            let request = prompt::final_synthesis(session, &moderator);
            self.take_turn(session, &moderator, rounds, TurnKind::ModeratorFinal, request)
                .await?;
        }
        Ok(())
    }

    /// Request one turn, append it, and persist session and transcript.
    async fn take_turn(
        &self,
        session: &mut DebateSession,
        speaker: &Persona,
        round: u32,
        kind: TurnKind,
        request: TurnRequest,
    ) -> Result<(), DebateError> {
        let base = json!({
            "debateId": session.debate_id,
            "round": round,
            "speaker": speaker.id,
            "kind": kind.to_string(),
            "provider": speaker.provider.to_string(),
            "model": request.model,
        });
        self.record_event(EventRecord::new(EventType::LLMCallStarted, COMPONENT).data(base.clone()));

        let started = Instant::now();
        let result = self.completion.complete_turn(speaker, &request).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let response = match result {
            Ok(response) => response,
            Err(source) => {
                self.record_event(
                    EventRecord::new(EventType::Error, COMPONENT)
                        .latency_ms(latency_ms)
                        .error(source.to_string())
                        .data(json!({
                            "debateId": session.debate_id,
                            "round": round,
                            "speaker": speaker.id,
                            "code": source.code(),
                        })),
                );
                return Err(DebateError::Completion {
                    speaker: speaker.id.clone(),
                    source,
                });
            }
        };

        let mut finished = base;
        finished["model"] = json!(response.model);
        if let Some(usage) = response.usage {
            finished["usage"] = json!({
                "prompt_tokens": usage.prompt_tokens,
                "completion_tokens": usage.completion_tokens,
                "total_tokens": usage.total_tokens,
            });
        }
        self.record_event(
            EventRecord::new(EventType::LLMCallFinished, COMPONENT)
                .latency_ms(latency_ms)
                .data(finished),
        );

        let turn = session.push_turn(
            round,
            speaker,
            kind,
            response.text.trim().to_string(),
            Some(response.model),
            latency_ms,
        );
        let transcript = transcript_entry(turn);
        info!(round, speaker = %speaker.id, %kind, latency_ms, "Turn recorded");

        self.sessions.save(session)?;
        self.sessions
            .append_transcript(&session.debate_id, &transcript)?;
        Ok(())
    }

    fn record_event(&self, event: EventRecord) {
        if let Some(events) = &self.events {
            events.record(event);
        }
    }
}

fn transcript_entry(turn: &Turn) -> String {
    format!(
        "## Round {} - {} ({})\n\n{}\n\n",
        turn.round, turn.speaker_name, turn.kind, turn.text
    )
}

fn render_transcript(session: &DebateSession) -> String {
    session.turns.iter().map(transcript_entry).collect()
}
