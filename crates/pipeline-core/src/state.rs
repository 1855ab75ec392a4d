use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

use crate::types::PipelineState;

/// Append-only JSON persistence for run states under
/// `.agent-pipeline/state/runs/<runId>.json`.
///
/// Writes replace the whole file; readers treat a parse failure as a
/// missing state rather than an error, since a reader may observe a
/// partial write.
pub struct StateManager {
    runs_dir: PathBuf,
}

impl StateManager {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            runs_dir: repo_root
                .join(".agent-pipeline")
                .join("state")
                .join("runs"),
        }
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    fn path_for(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(format!("{run_id}.json"))
    }

    pub fn save(&self, state: &PipelineState) -> Result<()> {
        std::fs::create_dir_all(&self.runs_dir)
            .with_context(|| format!("create {}", self.runs_dir.display()))?;
        let json = serde_json::to_string_pretty(state).context("serialize pipeline state")?;
        let path = self.path_for(&state.run_id);
        std::fs::write(&path, json).with_context(|| format!("write {}", path.display()))
    }

    /// Load one run, or `None` when the file is absent or unreadable.
    pub fn load(&self, run_id: &str) -> Option<PipelineState> {
        let path = self.path_for(run_id);
        let raw = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(run_id, "unparseable state file {}: {e}", path.display());
                None
            }
        }
    }

    /// Newest run by file modification time.
    pub fn latest_run(&self) -> Option<PipelineState> {
        let entries = std::fs::read_dir(&self.runs_dir).ok()?;
        let newest = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "json"))
            .filter_map(|e| {
                let mtime = e.metadata().ok()?.modified().ok()?;
                Some((mtime, e.path()))
            })
            .max_by_key(|(mtime, _)| *mtime)?;
        self.load_path(&newest.1)
    }

    /// All runs sorted by trigger timestamp, newest first. Corrupt files
    /// are skipped silently.
    pub fn all_runs(&self) -> Vec<PipelineState> {
        let Ok(entries) = std::fs::read_dir(&self.runs_dir) else {
            return Vec::new();
        };
        let mut runs: Vec<PipelineState> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "json"))
            .filter_map(|e| self.load_path(&e.path()))
            .collect();
        runs.sort_by(|a, b| b.trigger.timestamp.cmp(&a.trigger.timestamp));
        runs
    }

    fn load_path(&self, path: &Path) -> Option<PipelineState> {
        let raw = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use chrono::{Duration, Utc};

    fn make_state(run_id: &str, offset_s: i64) -> PipelineState {
        PipelineState {
            run_id: run_id.to_string(),
            pipeline_config: PipelineConfig {
                name: "demo".into(),
                trigger: TriggerKind::Manual,
                agents: vec![StageConfig::new("a", "agents/a.md")],
                runtime: None,
                settings: Settings::default(),
                git: GitSettings::default(),
                looping: LoopSettings::default(),
                notifications: None,
                handover: None,
            },
            trigger: TriggerInfo {
                kind: TriggerKind::Manual,
                commit_sha: "abc".into(),
                timestamp: Utc::now() + Duration::seconds(offset_s),
            },
            stages: Vec::new(),
            status: PipelineStatus::Running,
            artifacts: Artifacts {
                initial_commit: "abc".into(),
                final_commit: None,
                changed_files: Vec::new(),
                total_duration: 0.0,
                handover_dir: PathBuf::from("/tmp/handover"),
                main_repo_handover_dir: None,
                worktree_path: None,
                pull_request: None,
            },
            loop_context: None,
        }
    }

    #[test]
    fn save_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = StateManager::new(tmp.path());
        let state = make_state("run-1", 0);
        mgr.save(&state).unwrap();

        let loaded = mgr.load("run-1").unwrap();
        assert_eq!(loaded.run_id, "run-1");
        assert_eq!(loaded.status, PipelineStatus::Running);

        // Idempotent: saving the loaded state reproduces it.
        mgr.save(&loaded).unwrap();
        let again = mgr.load("run-1").unwrap();
        assert_eq!(again.run_id, loaded.run_id);
        assert_eq!(again.trigger.commit_sha, loaded.trigger.commit_sha);
    }

    #[test]
    fn missing_run_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = StateManager::new(tmp.path());
        assert!(mgr.load("nope").is_none());
    }

    #[test]
    fn corrupt_file_reads_as_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = StateManager::new(tmp.path());
        std::fs::create_dir_all(mgr.runs_dir()).unwrap();
        std::fs::write(mgr.runs_dir().join("bad.json"), "{ not json").unwrap();
        assert!(mgr.load("bad").is_none());
        assert!(mgr.all_runs().is_empty());
    }

    #[test]
    fn all_runs_sorted_by_trigger_timestamp_desc() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = StateManager::new(tmp.path());
        mgr.save(&make_state("older", -60)).unwrap();
        mgr.save(&make_state("newer", 0)).unwrap();
        let runs = mgr.all_runs();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, "newer");
        assert_eq!(runs[1].run_id, "older");
    }

    #[test]
    fn latest_run_by_mtime() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = StateManager::new(tmp.path());
        mgr.save(&make_state("first", 0)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        mgr.save(&make_state("second", -120)).unwrap();
        // mtime wins over trigger timestamp here.
        assert_eq!(mgr.latest_run().unwrap().run_id, "second");
    }
}
