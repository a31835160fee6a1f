//! Debate session state: status machine, participants, and the turn list.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Speaker id used for moderator turns.
pub const MODERATOR_ID: &str = "moderator";
pub const MODERATOR_NAME: &str = "Moderator";

/// Lifecycle status of a debate session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebateStatus {
    /// Created, waiting for a worker.
    Queued,
    /// Owned by the orchestrator.
    Running,
    /// All rounds and moderator steps finished.
    Completed,
    /// A step failed; may be run again.
    Failed,
}

impl DebateStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(self) -> &'static [DebateStatus] {
        match self {
            Self::Queued => &[Self::Running],
            Self::Running => &[Self::Completed, Self::Failed],
            Self::Failed => &[Self::Running],
            Self::Completed => &[],
        }
    }
}

impl std::fmt::Display for DebateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// How strongly turns must cite the attached knowledge packs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceGroundingMode {
    #[default]
    Off,
    Prefer,
    Strict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DebateSettings {
    pub rounds: u32,
    pub max_words_per_turn: u32,
    /// Default model for personas without an override and for the moderator.
    pub model: Option<String>,
    pub temperature: f32,
    pub include_moderator: bool,
    pub source_grounding_mode: SourceGroundingMode,
}

impl Default for DebateSettings {
    fn default() -> Self {
        Self {
            rounds: 2,
            max_words_per_turn: 220,
            model: None,
            temperature: 0.7,
            include_moderator: true,
            source_grounding_mode: SourceGroundingMode::Off,
        }
    }
}

/// Which turn-completion capability serves a persona.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Direct model completion.
    #[default]
    Direct,
    /// Delegated agent invocation.
    Agent,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Agent => write!(f, "agent"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Persona {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub stance: Option<String>,
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
}

impl Persona {
    pub fn new(id: impl Into<String>, name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: role.into(),
            stance: None,
            provider: ProviderKind::Direct,
            model: None,
            agent_id: None,
        }
    }

    /// The moderator, served by the direct provider with the session model.
    pub fn moderator(settings: &DebateSettings) -> Self {
        Self {
            model: settings.model.clone(),
            ..Self::new(MODERATOR_ID, MODERATOR_NAME, "Neutral moderator")
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TurnKind {
    Persona,
    ModeratorSummary,
    ModeratorFinal,
}

impl std::fmt::Display for TurnKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Persona => write!(f, "persona"),
            Self::ModeratorSummary => write!(f, "moderatorSummary"),
            Self::ModeratorFinal => write!(f, "moderatorFinal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    /// Position in the session's turn list.
    pub index: usize,
    pub round: u32,
    pub speaker_id: String,
    pub speaker_name: String,
    pub kind: TurnKind,
    pub text: String,
    #[serde(default)]
    pub model: Option<String>,
    pub latency_ms: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebateProgress {
    pub round: u32,
    pub current_speaker: Option<String>,
    pub message: String,
}

/// Knowledge packs attached to the session and to individual personas.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KnowledgeAssociations {
    pub global: Vec<String>,
    pub per_persona: BTreeMap<String, Vec<String>>,
}

impl KnowledgeAssociations {
    /// Global then persona-specific pack ids, deduplicated in first-seen order.
    pub fn pack_ids_for(&self, persona_id: &str) -> Vec<String> {
        let persona = self.per_persona.get(persona_id).into_iter().flatten();
        let mut ids: Vec<String> = Vec::new();
        for id in self.global.iter().chain(persona) {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }
}

/// A status transition record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: DebateStatus,
    pub to: DebateStatus,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Error for invalid status transitions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition {from} → {to}: {reason}")]
pub struct TransitionError {
    pub from: DebateStatus,
    pub to: DebateStatus,
    pub reason: String,
}

/// A debate session: configuration, status history and the append-only
/// turn list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebateSession {
    pub debate_id: String,
    pub topic: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub settings: DebateSettings,
    /// Speaking order.
    pub personas: Vec<Persona>,
    pub status: DebateStatus,
    #[serde(default)]
    pub progress: DebateProgress,
    #[serde(default)]
    pub turns: Vec<Turn>,
    #[serde(default)]
    pub knowledge: KnowledgeAssociations,
    #[serde(default)]
    pub transitions: Vec<StatusTransition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl DebateSession {
    pub fn new(
        debate_id: impl Into<String>,
        topic: impl Into<String>,
        personas: Vec<Persona>,
        settings: DebateSettings,
    ) -> Self {
        let now = Utc::now();
        Self {
            debate_id: debate_id.into(),
            topic: topic.into(),
            context: String::new(),
            settings,
            personas,
            status: DebateStatus::Queued,
            progress: DebateProgress::default(),
            turns: Vec::new(),
            knowledge: KnowledgeAssociations::default(),
            transitions: Vec::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_knowledge(mut self, knowledge: KnowledgeAssociations) -> Self {
        self.knowledge = knowledge;
        self
    }

    /// Structural checks required before the session can run.
    pub fn validate(&self) -> Result<(), String> {
        if self.personas.is_empty() {
            return Err(format!("debate {} has no personas", self.debate_id));
        }
        if self.settings.rounds == 0 {
            return Err(format!("debate {} has zero rounds", self.debate_id));
        }
        if let Some(p) = self.personas.iter().find(|p| p.id == MODERATOR_ID) {
            return Err(format!("persona id '{}' is reserved", p.id));
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(p) = self.personas.iter().find(|p| !seen.insert(p.id.as_str())) {
            return Err(format!(
                "debate {} has duplicate persona id '{}'",
                self.debate_id, p.id
            ));
        }
        Ok(())
    }

    /// Transition to a new status with a reason.
    pub fn transition(&mut self, to: DebateStatus, reason: &str) -> Result<(), TransitionError> {
        if !self.status.valid_transitions().contains(&to) {
            return Err(TransitionError {
                from: self.status,
                to,
                reason: format!(
                    "not a valid transition (allowed: {:?})",
                    self.status.valid_transitions()
                ),
            });
        }

        let now = Utc::now();
        self.transitions.push(StatusTransition {
            from: self.status,
            to,
            timestamp: now,
            reason: reason.to_string(),
        });
        self.status = to;
        self.updated_at = now;

        match to {
            DebateStatus::Running => {
                self.started_at.get_or_insert(now);
                self.error = None;
            }
            DebateStatus::Completed => self.completed_at = Some(now),
            DebateStatus::Queued | DebateStatus::Failed => {}
        }
        Ok(())
    }

    pub fn set_progress(&mut self, round: u32, speaker: Option<&str>, message: impl Into<String>) {
        self.progress = DebateProgress {
            round,
            current_speaker: speaker.map(str::to_string),
            message: message.into(),
        };
        self.updated_at = Utc::now();
    }

    /// Whether a turn for (round, speaker, kind) already exists.
    pub fn has_turn(&self, round: u32, speaker_id: &str, kind: TurnKind) -> bool {
        self.turns
            .iter()
            .any(|t| t.round == round && t.kind == kind && t.speaker_id == speaker_id)
    }

    /// Append a turn. Its index is its position in the list.
    pub fn push_turn(
        &mut self,
        round: u32,
        speaker: &Persona,
        kind: TurnKind,
        text: String,
        model: Option<String>,
        latency_ms: u64,
    ) -> &Turn {
        let now = Utc::now();
        let index = self.turns.len();
        self.turns.push(Turn {
            index,
            round,
            speaker_id: speaker.id.clone(),
            speaker_name: speaker.name.clone(),
            kind,
            text,
            model,
            latency_ms,
            created_at: now,
        });
        self.updated_at = now;
        &self.turns[index]
    }

    /// Text of the latest moderator round summary from a round before `round`.
    pub fn moderator_summary_before(&self, round: u32) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.kind == TurnKind::ModeratorSummary && t.round < round)
            .map(|t| t.text.as_str())
    }

    /// Persona turns of one round, in speaking order.
    pub fn round_turns(&self, round: u32) -> impl Iterator<Item = &Turn> {
        self.turns
            .iter()
            .filter(move |t| t.round == round && t.kind == TurnKind::Persona)
    }

    pub fn persona(&self, id: &str) -> Option<&Persona> {
        self.personas.iter().find(|p| p.id == id)
    }

    /// Compact status line.
    pub fn status_line(&self) -> String {
        format!(
            "[{}] round {}/{} | {} turns | debate={}",
            self.status,
            self.progress.round,
            self.settings.rounds,
            self.turns.len(),
            self.debate_id
        )
    }
}
