//! Prompt construction for persona and moderator turns.

use std::fmt::Write as _;

use super::knowledge::KnowledgePack;
use super::provider::TurnRequest;
use super::state::{DebateSession, Persona, SourceGroundingMode, Turn, TurnKind};

/// Number of prior responses from other personas shown to a speaker.
pub const RECENT_WINDOW: usize = 2;

/// Characters kept per turn in the final synthesis history.
pub const ABRIDGED_TURN_CHARS: usize = 600;

/// Truncate to at most `max_chars` characters, marking the cut.
pub fn abridge(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", text[..cut].trim_end()),
        None => text.to_string(),
    }
}

fn model_for(session: &DebateSession, persona: &Persona) -> Option<String> {
    persona
        .model
        .clone()
        .or_else(|| session.settings.model.clone())
}

fn grounding_instruction(mode: SourceGroundingMode, has_sources: bool) -> Option<&'static str> {
    match (mode, has_sources) {
        (SourceGroundingMode::Off, _) => None,
        (SourceGroundingMode::Prefer, true) => Some(
            "Prefer claims supported by the reference material above and cite it by title where you rely on it.",
        ),
        (SourceGroundingMode::Strict, true) => Some(
            "Only make factual claims supported by the reference material above, citing it by title. \
             If the material does not cover a point, say so instead of guessing.",
        ),
        (SourceGroundingMode::Prefer, false) => None,
        (SourceGroundingMode::Strict, false) => Some(
            "No reference material is available; avoid specific factual claims you cannot support.",
        ),
    }
}

fn write_header(out: &mut String, session: &DebateSession) {
    let _ = writeln!(out, "Debate topic: {}", session.topic);
    if !session.context.trim().is_empty() {
        let _ = writeln!(out, "\nContext:\n{}", session.context.trim());
    }
}

fn write_turn(out: &mut String, turn: &Turn, max_chars: Option<usize>) {
    let text = match max_chars {
        Some(n) => abridge(&turn.text, n),
        None => turn.text.clone(),
    };
    let _ = writeln!(out, "\n[{} - round {}]\n{}", turn.speaker_name, turn.round, text);
}

/// Prompt for a persona's turn in `round`.
pub fn persona_turn(
    session: &DebateSession,
    persona: &Persona,
    round: u32,
    knowledge: &[KnowledgePack],
    last_moderator_summary: Option<&str>,
) -> TurnRequest {
    let mut system = format!("You are {}, {}.", persona.name, persona.role);
    if let Some(stance) = persona.stance.as_deref() {
        let _ = write!(system, " Your stance: {stance}.");
    }
    system.push_str(" Stay in character and respond in plain prose.");

    let mut prompt = String::new();
    write_header(&mut prompt, session);

    if !knowledge.is_empty() {
        prompt.push_str("\nReference material:\n");
        for pack in knowledge {
            let _ = writeln!(prompt, "\n### {}\n{}", pack.title, pack.content.trim());
        }
    }

    let recent: Vec<&Turn> = session
        .turns
        .iter()
        .rev()
        .filter(|t| t.kind == TurnKind::Persona && t.speaker_id != persona.id)
        .take(RECENT_WINDOW)
        .collect();
    if !recent.is_empty() {
        prompt.push_str("\nRecent responses from other participants:\n");
        for turn in recent.into_iter().rev() {
            write_turn(&mut prompt, turn, None);
        }
    }

    if let Some(summary) = last_moderator_summary {
        let _ = writeln!(prompt, "\nModerator summary of the previous round:\n{summary}");
    }

    let instruction = if round == 1 {
        "Give your opening statement on the topic."
    } else {
        "Respond to the points raised so far: rebut what you disagree with and build on what you accept."
    };
    let _ = writeln!(prompt, "\nRound {round} of {}. {instruction}", session.settings.rounds);
    if let Some(grounding) =
        grounding_instruction(session.settings.source_grounding_mode, !knowledge.is_empty())
    {
        let _ = writeln!(prompt, "{grounding}");
    }
    let _ = write!(
        prompt,
        "Keep your response under {} words.",
        session.settings.max_words_per_turn
    );

    TurnRequest {
        system,
        prompt,
        model: model_for(session, persona),
        temperature: session.settings.temperature,
        max_words: session.settings.max_words_per_turn,
    }
}

/// Prompt for the moderator's summary of `round`.
pub fn round_summary(session: &DebateSession, moderator: &Persona, round: u32) -> TurnRequest {
    let mut prompt = String::new();
    write_header(&mut prompt, session);
    let _ = writeln!(prompt, "\nRound {round} statements:");
    for turn in session.round_turns(round) {
        write_turn(&mut prompt, turn, None);
    }
    let _ = write!(
        prompt,
        "\nSummarize the key points of agreement and disagreement from round {round} \
         in under {} words. Do not take sides.",
        session.settings.max_words_per_turn
    );

    TurnRequest {
        system: "You are a neutral debate moderator.".into(),
        prompt,
        model: model_for(session, moderator),
        temperature: session.settings.temperature,
        max_words: session.settings.max_words_per_turn,
    }
}

/// Prompt for the moderator's closing synthesis over the abridged history.
pub fn final_synthesis(session: &DebateSession, moderator: &Persona) -> TurnRequest {
    let mut prompt = String::new();
    write_header(&mut prompt, session);
    prompt.push_str("\nDebate transcript (abridged):\n");
    for turn in &session.turns {
        write_turn(&mut prompt, turn, Some(ABRIDGED_TURN_CHARS));
    }
    let _ = write!(
        prompt,
        "\nWrite a closing synthesis: the strongest arguments on each side, \
         where the participants converged, and the open questions. Under {} words.",
        session.settings.max_words_per_turn
    );

    TurnRequest {
        system: "You are a neutral debate moderator.".into(),
        prompt,
        model: model_for(session, moderator),
        temperature: session.settings.temperature,
        max_words: session.settings.max_words_per_turn,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debate::state::DebateSettings;

    fn session() -> DebateSession {
        let mut settings = DebateSettings {
            model: Some("gpt-4o-mini".into()),
            ..Default::default()
        };
        settings.rounds = 3;
        DebateSession::new(
            "d1",
            "Remote work",
            vec![
                Persona::new("a", "Ada", "an economist"),
                Persona::new("b", "Bo", "a manager"),
                Persona::new("c", "Cy", "an engineer"),
            ],
            settings,
        )
        .with_context("Post-pandemic offices")
    }

    #[test]
    fn test_opening_round_prompt() {
        let session = session();
        let req = persona_turn(&session, &session.personas[0], 1, &[], None);
        assert!(req.system.contains("Ada"));
        assert!(req.prompt.contains("Remote work"));
        assert!(req.prompt.contains("Post-pandemic offices"));
        assert!(req.prompt.contains("opening statement"));
        assert!(req.prompt.contains("under 220 words"));
        assert_eq!(req.model.as_deref(), Some("gpt-4o-mini"));
    }

    #[test]
    fn test_window_shows_two_latest_other_speakers() {
        let mut session = session();
        let [a, b, c] = [0, 1, 2].map(|i| session.personas[i].clone());
        session.push_turn(1, &a, TurnKind::Persona, "A-one".into(), None, 1);
        session.push_turn(1, &b, TurnKind::Persona, "B-one".into(), None, 1);
        session.push_turn(1, &c, TurnKind::Persona, "C-one".into(), None, 1);

        let req = persona_turn(&session, &a, 2, &[], Some("summary text"));
        assert!(!req.prompt.contains("A-one"));
        assert!(req.prompt.contains("B-one"));
        assert!(req.prompt.contains("C-one"));
        assert!(req.prompt.contains("summary text"));
        assert!(req.prompt.contains("rebut"));
    }

    #[test]
    fn test_persona_model_override() {
        let mut session = session();
        session.personas[1].model = Some("gpt-4.1".into());
        let req = persona_turn(&session, &session.personas[1], 1, &[], None);
        assert_eq!(req.model.as_deref(), Some("gpt-4.1"));
    }

    #[test]
    fn test_grounding_instruction() {
        let mut session = session();
        session.settings.source_grounding_mode = SourceGroundingMode::Strict;
        let packs = vec![KnowledgePack::new("k", "Census 2020", "numbers")];
        let req = persona_turn(&session, &session.personas[0], 1, &packs, None);
        assert!(req.prompt.contains("### Census 2020"));
        assert!(req.prompt.contains("Only make factual claims"));

        session.settings.source_grounding_mode = SourceGroundingMode::Off;
        let req = persona_turn(&session, &session.personas[0], 1, &packs, None);
        assert!(!req.prompt.contains("Only make factual claims"));
    }

    #[test]
    fn test_final_synthesis_abridges_turns() {
        let mut session = session();
        let a = session.personas[0].clone();
        session.push_turn(1, &a, TurnKind::Persona, "x".repeat(2_000), None, 1);
        let moderator = Persona::moderator(&session.settings);
        let req = final_synthesis(&session, &moderator);
        assert!(req.prompt.contains('…'));
        assert!(!req.prompt.contains(&"x".repeat(ABRIDGED_TURN_CHARS + 1)));
    }

    #[test]
    fn test_abridge_short_text_untouched() {
        assert_eq!(abridge("short", 10), "short");
        assert_eq!(abridge("ab cd", 3), "ab…");
    }
}
