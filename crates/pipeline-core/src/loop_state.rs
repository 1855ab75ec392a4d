use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;

use crate::types::{IterationRecord, LoopSession, LoopStatus, QueueDirs};

/// Persists loop sessions under `.agent-pipeline/state/loops/` and owns the
/// queue directories of the active session.
pub struct LoopStateManager {
    loops_dir: PathBuf,
}

impl LoopStateManager {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            loops_dir: repo_root
                .join(".agent-pipeline")
                .join("state")
                .join("loops"),
        }
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.loops_dir.join(format!("{session_id}.json"))
    }

    pub fn create_session(&self, session_id: &str, max_iterations: u32) -> Result<LoopSession> {
        let session = LoopSession {
            session_id: session_id.to_string(),
            start_time: Utc::now(),
            end_time: None,
            status: LoopStatus::Running,
            max_iterations,
            total_iterations: 0,
            iterations: Vec::new(),
        };
        self.save_session(&session)?;
        Ok(session)
    }

    pub fn save_session(&self, session: &LoopSession) -> Result<()> {
        std::fs::create_dir_all(&self.loops_dir)
            .with_context(|| format!("create {}", self.loops_dir.display()))?;
        let json = serde_json::to_string_pretty(session).context("serialize loop session")?;
        let path = self.path_for(&session.session_id);
        std::fs::write(&path, json).with_context(|| format!("write {}", path.display()))
    }

    pub fn load_session(&self, session_id: &str) -> Option<LoopSession> {
        let raw = std::fs::read_to_string(self.path_for(session_id)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Replace the record with the given iteration number. Returns false
    /// when no such row exists (session created by another process, or not
    /// yet initialized here); callers then fall back to `append_iteration`.
    pub fn update_iteration(
        &self,
        session_id: &str,
        iteration_number: u32,
        record: IterationRecord,
    ) -> Result<bool> {
        let Some(mut session) = self.load_session(session_id) else {
            return Ok(false);
        };
        let Some(slot) = session
            .iterations
            .iter_mut()
            .find(|r| r.iteration_number == iteration_number)
        else {
            return Ok(false);
        };
        *slot = record;
        self.save_session(&session)?;
        Ok(true)
    }

    pub fn append_iteration(&self, session_id: &str, record: IterationRecord) -> Result<()> {
        let mut session = self
            .load_session(session_id)
            .with_context(|| format!("loop session {session_id} not found"))?;
        session.total_iterations = session.total_iterations.max(record.iteration_number);
        session.iterations.push(record);
        self.save_session(&session)
    }

    /// Record an iteration: update in place when the row exists, append
    /// otherwise.
    pub fn record_iteration(&self, session_id: &str, record: IterationRecord) -> Result<()> {
        if self.update_iteration(session_id, record.iteration_number, record.clone())? {
            return Ok(());
        }
        self.append_iteration(session_id, record)
    }

    pub fn close_session(&self, session_id: &str, status: LoopStatus) -> Result<()> {
        let mut session = self
            .load_session(session_id)
            .with_context(|| format!("loop session {session_id} not found"))?;
        session.status = status;
        session.end_time = Some(Utc::now());
        self.save_session(&session)
    }
}

/// Create the four queue directories, each seeded with a `.gitignore` that
/// ignores everything except itself so queue traffic never lands in git.
pub fn ensure_queue_dirs(repo_root: &Path, dirs: &QueueDirs) -> Result<QueueDirs> {
    let resolved = resolve_queue_dirs(repo_root, dirs);
    for dir in resolved.all() {
        std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        let gitignore = dir.join(".gitignore");
        if !gitignore.exists() {
            std::fs::write(&gitignore, "*\n!.gitignore\n")
                .with_context(|| format!("write {}", gitignore.display()))?;
        }
    }
    Ok(resolved)
}

/// Resolve relative queue directories against the repository root.
pub fn resolve_queue_dirs(repo_root: &Path, dirs: &QueueDirs) -> QueueDirs {
    let resolve = |p: &PathBuf| -> PathBuf {
        if p.is_absolute() {
            p.clone()
        } else {
            repo_root.join(p)
        }
    };
    QueueDirs {
        pending: resolve(&dirs.pending),
        running: resolve(&dirs.running),
        finished: resolve(&dirs.finished),
        failed: resolve(&dirs.failed),
    }
}

/// Oldest YAML file in `pending/` by modification time, if any.
pub fn oldest_pending_yaml(pending: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(pending).ok()?;
    entries
        .filter_map(|e| e.ok())
        .filter(|e| {
            let path = e.path();
            path.is_file()
                && path
                    .extension()
                    .is_some_and(|x| x == "yml" || x == "yaml")
        })
        .filter_map(|e| {
            let mtime = e.metadata().ok()?.modified().ok()?;
            Some((mtime, e.path()))
        })
        .min_by_key(|(mtime, _)| *mtime)
        .map(|(_, path)| path)
}
