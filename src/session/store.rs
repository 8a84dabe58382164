//! Durable session storage: one JSON document per session.
//!
//! All writes go to a temporary sibling file and are atomically renamed
//! into place. Reads that hit a damaged file go through corruption
//! recovery rather than failing the audit: missing fields are filled with
//! defaults, mistyped fields are reset with a warning, and an unreadable
//! document starts the session over under the same id.
//!
//! Concurrency: the engine holds a per-session mutex for the duration of a
//! `process_thought` call. Cross-process safety is best-effort via the
//! atomic rename; two servers pointed at one directory are not supported.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::{IterationRecord, SessionState};

/// How a damaged session file was classified during recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptionType {
    MissingFields,
    WrongTypes,
    CompleteLoss,
}

/// Result of an integrity check over a stored session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub is_valid: bool,
    pub issues: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corruption_type: Option<CorruptionType>,
}

pub struct SessionStore {
    state_directory: PathBuf,
}

impl SessionStore {
    /// Open (and create if needed) the state directory.
    pub fn new(state_directory: impl Into<PathBuf>) -> Result<Self> {
        let state_directory = state_directory.into();
        fs::create_dir_all(&state_directory)?;
        Ok(Self { state_directory })
    }

    pub fn state_directory(&self) -> &Path {
        &self.state_directory
    }

    fn path_for(&self, id: &str) -> PathBuf {
        // Session ids come from callers; keep them from escaping the
        // state directory.
        let safe: String = id
            .chars()
            .map(|c| if c == '/' || c == '\\' || c == '.' { '_' } else { c })
            .collect();
        self.state_directory.join(format!("{safe}.json"))
    }

    /// Load a session, running corruption recovery as needed, or create a
    /// fresh one when no file exists.
    pub fn load_or_create(&self, id: &str, loop_id: Option<&str>) -> SessionState {
        let path = self.path_for(id);
        if !path.exists() {
            let state = SessionState::new(id, loop_id.map(String::from));
            debug!(session = id, "created new session");
            return state;
        }

        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(session = id, "session file unreadable ({e}); starting fresh");
                return self.recovered_fresh(id, loop_id);
            }
        };

        match serde_json::from_str::<SessionState>(&raw) {
            Ok(mut state) => {
                // Repair derived fields that drifted (hand-edited files).
                let issues = state.integrity_issues();
                if !issues.is_empty() {
                    warn!(session = id, ?issues, "repairing session invariants");
                    state.current_loop = state.iterations.len() as u32;
                    state.codex_context_active = state.codex_context_id.is_some();
                    let _ = self.save(&state);
                }
                state
            }
            Err(_) => match serde_json::from_str::<Value>(&raw) {
                Ok(value) => {
                    let (state, corruption) = self.recover_from_value(id, loop_id, value);
                    warn!(session = id, ?corruption, "recovered corrupted session");
                    let _ = self.save(&state);
                    state
                }
                Err(e) => {
                    warn!(
                        session = id,
                        "session file is not JSON ({e}); starting fresh"
                    );
                    self.recovered_fresh(id, loop_id)
                }
            },
        }
    }

    fn recovered_fresh(&self, id: &str, loop_id: Option<&str>) -> SessionState {
        let state = SessionState::new(id, loop_id.map(String::from));
        let _ = self.save(&state);
        state
    }

    /// Field-by-field recovery: keep every field that still deserializes,
    /// default the rest.
    fn recover_from_value(
        &self,
        id: &str,
        loop_id: Option<&str>,
        value: Value,
    ) -> (SessionState, CorruptionType) {
        let Some(obj) = value.as_object() else {
            return (
                SessionState::new(id, loop_id.map(String::from)),
                CorruptionType::CompleteLoss,
            );
        };

        let mut state = SessionState::new(id, loop_id.map(String::from));
        let mut wrong_types = false;
        let mut missing = false;

        macro_rules! recover_field {
            ($key:literal, $target:expr, $ty:ty) => {
                match obj.get($key) {
                    Some(raw) => match serde_json::from_value::<$ty>(raw.clone()) {
                        Ok(parsed) => $target = parsed,
                        Err(_) => {
                            warn!(session = id, field = $key, "resetting mistyped field");
                            wrong_types = true;
                        }
                    },
                    None => missing = true,
                }
            };
        }

        recover_field!("loopId", state.loop_id, Option<String>);
        recover_field!("config", state.config, crate::config::SessionConfig);
        recover_field!("iterations", state.iterations, Vec<IterationRecord>);
        recover_field!("codexContextId", state.codex_context_id, Option<String>);
        recover_field!("isComplete", state.is_complete, bool);
        recover_field!(
            "completionReason",
            state.completion_reason,
            Option<crate::models::CompletionReason>
        );
        recover_field!(
            "stagnationInfo",
            state.stagnation_info,
            Option<crate::models::StagnationInfo>
        );
        recover_field!("createdAtMs", state.created_at_ms, i64);

        // Derived fields are recomputed, never trusted.
        state.current_loop = state.iterations.len() as u32;
        state.codex_context_active = state.codex_context_id.is_some();
        if state.is_complete && state.completion_reason.is_none() {
            state.is_complete = false;
        }
        state.touch();

        let corruption = if wrong_types {
            CorruptionType::WrongTypes
        } else if missing {
            CorruptionType::MissingFields
        } else {
            CorruptionType::CompleteLoss
        };
        (state, corruption)
    }

    /// Persist a session atomically: write the temp sibling, then rename.
    pub fn save(&self, state: &SessionState) -> Result<()> {
        let path = self.path_for(&state.id);
        let temp = self
            .state_directory
            .join(format!(".{}.json.tmp", state.id.replace(['/', '\\'], "_")));

        let json = serde_json::to_string_pretty(state)?;
        fs::write(&temp, &json)?;
        fs::rename(&temp, &path)?;
        Ok(())
    }

    /// Load, append one iteration, recompute the loop counter, persist.
    pub fn append_iteration(&self, id: &str, iteration: IterationRecord) -> Result<SessionState> {
        let mut state = self.load_or_create(id, None);
        state.append_iteration(iteration)?;
        self.save(&state)?;
        Ok(state)
    }

    /// Load, apply a mutation, persist.
    pub fn update(&self, id: &str, mutate: impl FnOnce(&mut SessionState)) -> Result<SessionState> {
        let mut state = self.load_or_create(id, None);
        mutate(&mut state);
        state.touch();
        self.save(&state)?;
        Ok(state)
    }

    /// Number of session files currently on disk.
    pub fn session_count(&self) -> usize {
        fs::read_dir(&self.state_directory)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| {
                        e.path().extension().and_then(|x| x.to_str()) == Some("json")
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let path = self.path_for(id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Remove session files idle longer than `max_age_ms`. Returns how
    /// many were removed.
    pub fn sweep(&self, max_age_ms: i64) -> usize {
        let now = chrono::Utc::now().timestamp_millis();
        let Ok(entries) = fs::read_dir(&self.state_directory) else {
            return 0;
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let idle_ms = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| mtime.elapsed().ok())
                .map(|elapsed| elapsed.as_millis() as i64)
                .unwrap_or(0);
            // Fall back to the persisted timestamp when mtime is unusable.
            let idle_ms = if idle_ms > 0 {
                idle_ms
            } else {
                fs::read_to_string(&path)
                    .ok()
                    .and_then(|raw| serde_json::from_str::<SessionState>(&raw).ok())
                    .map(|s| now - s.updated_at_ms)
                    .unwrap_or(0)
            };

            if idle_ms > max_age_ms {
                if fs::remove_file(&path).is_ok() {
                    info!(file = %path.display(), "swept stale session");
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Best-effort terminal write after an engine failure: record the
    /// error and clear the context handle so nothing points at a dead
    /// reviewer context.
    pub fn handle_failure(&self, id: &str, error: &Error) {
        let result = self.update(id, |state| {
            state.last_error = Some(error.to_string());
            state.set_context_handle(None);
        });
        if let Err(e) = result {
            warn!(session = id, "failure record could not be written: {e}");
        }
    }

    /// Check a stored session without mutating it.
    pub fn validate_integrity(&self, id: &str) -> IntegrityReport {
        let path = self.path_for(id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) => {
                return IntegrityReport {
                    is_valid: false,
                    issues: vec![format!("unreadable: {e}")],
                    corruption_type: Some(CorruptionType::CompleteLoss),
                };
            }
        };

        match serde_json::from_str::<SessionState>(&raw) {
            Ok(state) => {
                let issues = state.integrity_issues();
                IntegrityReport {
                    is_valid: issues.is_empty(),
                    corruption_type: None,
                    issues,
                }
            }
            Err(_) => match serde_json::from_str::<Value>(&raw) {
                Ok(value) if value.is_object() => {
                    let required = ["id", "iterations", "createdAtMs", "updatedAtMs"];
                    let missing: Vec<String> = required
                        .iter()
                        .filter(|k| value.get(**k).is_none())
                        .map(|k| format!("missing field '{k}'"))
                        .collect();
                    let corruption = if missing.is_empty() {
                        CorruptionType::WrongTypes
                    } else {
                        CorruptionType::MissingFields
                    };
                    IntegrityReport {
                        is_valid: false,
                        issues: if missing.is_empty() {
                            vec!["one or more fields have the wrong type".to_string()]
                        } else {
                            missing
                        },
                        corruption_type: Some(corruption),
                    }
                }
                _ => IntegrityReport {
                    is_valid: false,
                    issues: vec!["document is not a JSON object".to_string()],
                    corruption_type: Some(CorruptionType::CompleteLoss),
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Review;
    use tempfile::tempdir;

    fn iteration(n: u32) -> IterationRecord {
        IterationRecord {
            thought_number: n,
            code_fingerprint: "f".repeat(64),
            normalized_code: format!("code {n}"),
            review: Review::fallback("t"),
            timestamp_ms: n as i64,
        }
    }

    #[test]
    fn test_load_or_create_roundtrip() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();

        let mut state = store.load_or_create("s1", Some("L1"));
        assert_eq!(state.current_loop, 0);
        state.append_iteration(iteration(1)).unwrap();
        store.save(&state).unwrap();

        let reloaded = store.load_or_create("s1", None);
        assert_eq!(reloaded, state);
    }

    #[test]
    fn test_save_is_atomic_no_temp_left_behind() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        let state = SessionState::new("s1", None);
        store.save(&state).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        assert!(dir.path().join("s1.json").exists());
    }

    #[test]
    fn test_complete_loss_recovery() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        fs::write(dir.path().join("s1.json"), "not json at all {{{").unwrap();

        let state = store.load_or_create("s1", Some("L1"));
        assert_eq!(state.id, "s1");
        assert_eq!(state.current_loop, 0);
        // The fresh state was persisted over the corrupt file
        let report = store.validate_integrity("s1");
        assert!(report.is_valid);
    }

    #[test]
    fn test_missing_fields_recovery_keeps_present_fields() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        // A document with only some fields: parseable JSON, not a full state
        fs::write(
            dir.path().join("s1.json"),
            r#"{"id": "s1", "isComplete": false, "loopId": "L9"}"#,
        )
        .unwrap();

        let state = store.load_or_create("s1", None);
        assert_eq!(state.loop_id.as_deref(), Some("L9"));
        assert!(state.iterations.is_empty());
        assert_eq!(state.current_loop, 0);
    }

    #[test]
    fn test_wrong_types_recovery_resets_field() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        fs::write(
            dir.path().join("s1.json"),
            r#"{"id": "s1", "iterations": "definitely not an array", "loopId": "L1",
                "codexContextId": null, "isComplete": false, "completionReason": null,
                "stagnationInfo": null, "createdAtMs": 5, "config": {}}"#,
        )
        .unwrap();

        let state = store.load_or_create("s1", None);
        assert!(state.iterations.is_empty());
        assert_eq!(state.loop_id.as_deref(), Some("L1"));
        assert_eq!(state.created_at_ms, 5);
    }

    #[test]
    fn test_derived_fields_recomputed_on_load() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        let mut state = SessionState::new("s1", None);
        state.append_iteration(iteration(1)).unwrap();
        state.current_loop = 42; // corrupt the derived field
        store.save(&state).unwrap();

        let reloaded = store.load_or_create("s1", None);
        assert_eq!(reloaded.current_loop, 1);
        assert!(reloaded.integrity_issues().is_empty());
    }

    #[test]
    fn test_append_iteration_persists() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        store.append_iteration("s1", iteration(1)).unwrap();
        let state = store.append_iteration("s1", iteration(2)).unwrap();
        assert_eq!(state.current_loop, 2);

        let reloaded = store.load_or_create("s1", None);
        assert_eq!(reloaded.iterations.len(), 2);
    }

    #[test]
    fn test_delete_and_sweep() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        store.save(&SessionState::new("old", None)).unwrap();
        store.save(&SessionState::new("new", None)).unwrap();

        store.delete("old").unwrap();
        assert!(!dir.path().join("old.json").exists());

        // Everything is fresh; a generous max age sweeps nothing
        assert_eq!(store.sweep(60_000), 0);
        // A zero max age sweeps the remaining file
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(store.sweep(0), 1);
    }

    #[test]
    fn test_handle_failure_records_error_and_clears_context() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        let mut state = SessionState::new("s1", None);
        state.set_context_handle(Some("ctx-1".to_string()));
        store.save(&state).unwrap();

        store.handle_failure("s1", &Error::Parse("boom".to_string()));

        let reloaded = store.load_or_create("s1", None);
        assert!(reloaded.codex_context_id.is_none());
        assert!(!reloaded.codex_context_active);
        assert!(reloaded.last_error.unwrap().contains("boom"));
    }

    #[test]
    fn test_validate_integrity_classifies_missing_fields() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        fs::write(dir.path().join("s1.json"), r#"{"id": "s1"}"#).unwrap();

        let report = store.validate_integrity("s1");
        assert!(!report.is_valid);
        assert_eq!(report.corruption_type, Some(CorruptionType::MissingFields));
    }

    #[test]
    fn test_session_id_cannot_escape_directory() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        let state = store.load_or_create("../escape", None);
        store.save(&state).unwrap();
        // Nothing was written outside the state directory
        assert!(!dir.path().parent().unwrap().join("escape.json").exists());
    }
}
