//! Append-only event log, segmented by UTC day.
//!
//! Each segment (`events/YYYY-MM-DD.jsonl`) only ever grows: records are
//! written with a single `O_APPEND` write per line and never rewritten.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{NaiveDate, Utc};
use tracing::{debug, warn};

use super::event::EventRecord;
use super::{LedgerError, LedgerResult};

/// Query for [`EventLog::list_events`].
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// Most recent N events. Zero means unlimited.
    pub limit: usize,
    pub run_id: Option<String>,
}

impl EventQuery {
    pub fn for_run(run_id: impl Into<String>) -> Self {
        Self {
            limit: 0,
            run_id: Some(run_id.into()),
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

pub struct EventLog {
    dir: PathBuf,
    append_lock: Mutex<()>,
}

impl EventLog {
    /// Open (or create) the log under `<root>/events`.
    pub fn open(root: impl AsRef<Path>) -> LedgerResult<Self> {
        let dir = root.as_ref().join("events");
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            append_lock: Mutex::new(()),
        })
    }

    /// Segment for the record's UTC day. Falls back to today for
    /// timestamps that do not start with a date.
    fn segment_for(&self, record: &EventRecord) -> PathBuf {
        let day = record
            .timestamp
            .get(..10)
            .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
            .unwrap_or_else(|| Utc::now().date_naive());
        self.dir.join(format!("{}.jsonl", day.format("%Y-%m-%d")))
    }

    /// Append one event. Missing request/run ids are taken from the ambient
    /// run context. Returns the record as written.
    pub fn append_event(&self, record: EventRecord) -> LedgerResult<EventRecord> {
        let record = record.with_ambient_context();
        if record.component.trim().is_empty() {
            return Err(LedgerError::Invalid("event component must not be empty".into()));
        }

        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let path = self.segment_for(&record);
        let _guard = self.append_lock.lock().map_err(|_| LedgerError::LockPoisoned)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;

        debug!(
            event_type = %record.event_type,
            run_id = ?record.run_id,
            component = %record.component,
            "Event appended"
        );
        Ok(record)
    }

    /// Append, logging instead of failing. For events that must not abort
    /// the surrounding work.
    pub fn record(&self, record: EventRecord) {
        let event_type = record.event_type;
        if let Err(e) = self.append_event(record) {
            warn!(%event_type, error = %e, "Failed to append ledger event");
        }
    }

    fn segments(&self) -> LedgerResult<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut segments: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "jsonl"))
            .collect();
        segments.sort();
        Ok(segments)
    }

    fn read_segment(path: &Path, run_id: Option<&str>, out: &mut Vec<EventRecord>) -> LedgerResult<()> {
        let reader = BufReader::new(fs::File::open(path)?);
        for (lineno, line) in reader.split(b'\n').enumerate() {
            let line = line?;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let event = std::str::from_utf8(&line)
                .map_err(|e| e.to_string())
                .and_then(|text| serde_json::from_str::<EventRecord>(text).map_err(|e| e.to_string()));
            match event {
                Ok(event) => {
                    if run_id.map_or(true, |id| event.run_id.as_deref() == Some(id)) {
                        out.push(event);
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), line = lineno + 1, error = %e, "Skipping malformed event line");
                }
            }
        }
        Ok(())
    }

    /// Events matching `query`, ascending by timestamp. With a limit, the
    /// most recent `limit` events are returned (still ascending).
    pub fn list_events(&self, query: &EventQuery) -> LedgerResult<Vec<EventRecord>> {
        let mut events = Vec::new();
        for segment in self.segments()? {
            Self::read_segment(&segment, query.run_id.as_deref(), &mut events)?;
        }
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        if query.limit > 0 && events.len() > query.limit {
            events.drain(..events.len() - query.limit);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunContext;
    use crate::ledger::event::EventType;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn test_append_and_list() {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path()).unwrap();
        log.append_event(EventRecord::new(EventType::RunStarted, "worker").run_id("a"))
            .unwrap();
        log.append_event(EventRecord::new(EventType::RunStarted, "worker").run_id("b"))
            .unwrap();
        log.append_event(EventRecord::new(EventType::RunFinished, "worker").run_id("a"))
            .unwrap();

        let a = log.list_events(&EventQuery::for_run("a")).unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].event_type, EventType::RunStarted);
        assert_eq!(a[1].event_type, EventType::RunFinished);
        assert_eq!(log.list_events(&EventQuery::default()).unwrap().len(), 3);
    }

    #[test]
    fn test_segmented_by_day_and_ordered_across_segments() {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path()).unwrap();
        let day2 = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 1).unwrap();
        let day1 = Utc.with_ymd_and_hms(2024, 3, 1, 23, 59, 59).unwrap();
        log.append_event(EventRecord::new(EventType::RunFinished, "w").run_id("r").at(day2))
            .unwrap();
        log.append_event(EventRecord::new(EventType::RunStarted, "w").run_id("r").at(day1))
            .unwrap();

        assert!(dir.path().join("events/2024-03-01.jsonl").exists());
        assert!(dir.path().join("events/2024-03-02.jsonl").exists());

        let events = log.list_events(&EventQuery::for_run("r")).unwrap();
        assert_eq!(events[0].event_type, EventType::RunStarted);
        assert_eq!(events[1].event_type, EventType::RunFinished);
    }

    #[test]
    fn test_limit_keeps_most_recent() {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path()).unwrap();
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        for i in 0..5 {
            log.append_event(
                EventRecord::new(EventType::ToolInvoked, "w")
                    .run_id("r")
                    .at(base + chrono::Duration::seconds(i))
                    .data(serde_json::json!({ "i": i })),
            )
            .unwrap();
        }
        let events = log.list_events(&EventQuery::for_run("r").limit(2)).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data["i"], 3);
        assert_eq!(events[1].data["i"], 4);
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path()).unwrap();
        let written = log
            .append_event(EventRecord::new(EventType::RunStarted, "w").run_id("r"))
            .unwrap();
        let segment = log.segment_for(&written);
        let mut file = OpenOptions::new().append(true).open(&segment).unwrap();
        writeln!(file, "not json at all").unwrap();
        writeln!(file, "{{\"eventType\": \"Nope\"}}").unwrap();

        let events = log.list_events(&EventQuery::default()).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_undecodable_line_does_not_hide_later_events() {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path()).unwrap();
        let at = Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap();
        let written = log
            .append_event(EventRecord::new(EventType::RunStarted, "w").run_id("r").at(at))
            .unwrap();
        let segment = log.segment_for(&written);
        let mut file = OpenOptions::new().append(true).open(&segment).unwrap();
        file.write_all(b"\xff\xfe garbage\n").unwrap();
        drop(file);
        log.append_event(
            EventRecord::new(EventType::RunFinished, "w")
                .run_id("r")
                .at(at + chrono::Duration::seconds(1)),
        )
        .unwrap();

        let events = log.list_events(&EventQuery::for_run("r")).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_type, EventType::RunFinished);
    }

    #[tokio::test]
    async fn test_ambient_run_id_applied() {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path()).unwrap();
        let written = RunContext::new("ctx-run")
            .scope(async { log.append_event(EventRecord::new(EventType::ToolFinished, "w")) })
            .await
            .unwrap();
        assert_eq!(written.run_id.as_deref(), Some("ctx-run"));
        assert_eq!(log.list_events(&EventQuery::for_run("ctx-run")).unwrap().len(), 1);
    }

    #[test]
    fn test_empty_component_rejected() {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path()).unwrap();
        let err = log
            .append_event(EventRecord::new(EventType::RunStarted, " "))
            .unwrap_err();
        assert!(matches!(err, LedgerError::Invalid(_)));
    }
}
