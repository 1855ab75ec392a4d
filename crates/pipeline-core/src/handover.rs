use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;

use crate::fsutil::copy_dir_recursive;
use crate::types::short_run_id;

const HANDOVER_FILE: &str = "HANDOVER.md";
const LOG_FILE: &str = "execution-log.md";
const STAGES_DIR: &str = "stages";
const OUTPUT_FILE: &str = "output.md";

/// Built-in context template handed to every agent. User templates replace
/// it wholesale via `settings.instructions.handover`.
const DEFAULT_CONTEXT_TEMPLATE: &str = "\
## Pipeline Context

You are the `{{stageName}}` stage of an automated pipeline. Shared state for
this run lives in `{{handoverDir}}`:

- `HANDOVER.md` — current status snapshot from earlier stages. Read it first.
- `execution-log.md` — chronological log of what already happened.
- Previous stage outputs:
{{previousStagesSection}}

When you finish, write a summary of what you did and anything the next stage
must know to `{{handoverDir}}/stages/{{stageName}}/output.md`.

Generated at {{timestamp}}.
";

/// Owns one run's handover directory and mediates all reads/writes to it.
/// Stage output files are write-partitioned per stage; the consolidated
/// files are only touched by the orchestrator thread.
pub struct HandoverManager {
    dir: PathBuf,
    pipeline_name: String,
    run_id: String,
}

impl HandoverManager {
    /// Create the handover directory for a run and seed its files. The
    /// directory name embeds the run id so concurrent runs never collide,
    /// also when the user supplies a custom base directory.
    pub fn init(
        root: &Path,
        pipeline_name: &str,
        run_id: &str,
        custom_base: Option<&Path>,
    ) -> Result<Self> {
        let leaf = format!("{pipeline_name}-{}", short_run_id(run_id));
        let dir = match custom_base {
            Some(base) if base.is_absolute() => base.join(leaf),
            Some(base) => root.join(base).join(leaf),
            None => root.join(".agent-pipeline").join("runs").join(leaf),
        };

        std::fs::create_dir_all(dir.join(STAGES_DIR))
            .with_context(|| format!("create handover dir {}", dir.display()))?;

        let manager = Self {
            dir,
            pipeline_name: pipeline_name.to_string(),
            run_id: run_id.to_string(),
        };

        let now = Utc::now().to_rfc3339();
        manager.write_file(
            HANDOVER_FILE,
            &format!(
                "# Handover — {pipeline_name}\n\nRun `{run_id}` started at {now}.\nNo stages have completed yet.\n"
            ),
        )?;
        manager.write_file(
            LOG_FILE,
            &format!("# Execution Log — {pipeline_name} ({run_id})\n\nStarted at {now}.\n"),
        )?;

        Ok(manager)
    }

    /// Reopen an existing handover directory (used by the finalizer after
    /// the worktree copy).
    pub fn open(dir: PathBuf, pipeline_name: &str, run_id: &str) -> Self {
        Self {
            dir,
            pipeline_name: pipeline_name.to_string(),
            run_id: run_id.to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_file(&self, name: &str, content: &str) -> Result<()> {
        let path = self.dir.join(name);
        std::fs::write(&path, content).with_context(|| format!("write {}", path.display()))
    }

    // ── Stage outputs ────────────────────────────────────────────────────

    pub fn create_stage_directory(&self, stage: &str) -> Result<PathBuf> {
        let dir = self.dir.join(STAGES_DIR).join(stage);
        std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        Ok(dir)
    }

    pub fn write_stage_output(&self, stage: &str, content: &str) -> Result<PathBuf> {
        let dir = self.create_stage_directory(stage)?;
        let path = dir.join(OUTPUT_FILE);
        std::fs::write(&path, content).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    pub fn read_stage_output(&self, stage: &str) -> Option<String> {
        std::fs::read_to_string(self.dir.join(STAGES_DIR).join(stage).join(OUTPUT_FILE)).ok()
    }

    /// Stage directories present under `stages/`, in filesystem order.
    /// Best-effort: used only for prompt assembly.
    pub fn previous_stages(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.dir.join(STAGES_DIR)) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect()
    }

    // ── Log ──────────────────────────────────────────────────────────────

    /// Append a `---`-delimited entry to `execution-log.md`.
    pub fn append_to_log(
        &self,
        stage: &str,
        status: &str,
        duration_s: f64,
        message: &str,
    ) -> Result<()> {
        let entry = format!(
            "\n---\n\n## {stage} — {status}\n\n- time: {}\n- duration: {duration_s:.1}s\n\n{message}\n",
            Utc::now().to_rfc3339()
        );
        let path = self.dir.join(LOG_FILE);
        let mut log = std::fs::read_to_string(&path).unwrap_or_default();
        log.push_str(&entry);
        std::fs::write(&path, log).with_context(|| format!("append {}", path.display()))
    }

    // ── Context assembly ─────────────────────────────────────────────────

    /// Build the context block injected into a stage's user prompt. A
    /// custom template path replaces the built-in one.
    pub fn build_context_message(
        &self,
        current_stage: &str,
        previous_stages: &[String],
        custom_template: Option<&Path>,
    ) -> Result<String> {
        let template = match custom_template {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("read handover template {}", path.display()))?,
            None => DEFAULT_CONTEXT_TEMPLATE.to_string(),
        };

        let previous_section = if previous_stages.is_empty() {
            "  - none — this is the first stage".to_string()
        } else {
            previous_stages
                .iter()
                .map(|s| format!("  - {}/stages/{s}/{OUTPUT_FILE}", self.dir.display()))
                .collect::<Vec<_>>()
                .join("\n")
        };

        Ok(template
            .replace("{{handoverDir}}", &self.dir.display().to_string())
            .replace("{{stageName}}", current_stage)
            .replace("{{previousStagesSection}}", &previous_section)
            .replace("{{timestamp}}", &Utc::now().to_rfc3339()))
    }

    // ── Consolidation ────────────────────────────────────────────────────

    /// Fold one completed stage into `HANDOVER.md`.
    pub fn copy_stage_to_handover(&self, stage: &str) -> Result<()> {
        self.merge_parallel_outputs(std::slice::from_ref(&stage.to_string()))
    }

    /// Rebuild `HANDOVER.md` from every known stage plus the ones just
    /// completed, newest last, `---` between sections.
    pub fn merge_parallel_outputs(&self, just_completed: &[String]) -> Result<()> {
        let mut ordered = self.previous_stages();
        for stage in just_completed {
            if !ordered.contains(stage) {
                ordered.push(stage.clone());
            }
        }

        let mut doc = format!(
            "# Handover — {}\n\nRun `{}`, updated {}.\n",
            self.pipeline_name,
            self.run_id,
            Utc::now().to_rfc3339()
        );
        for stage in &ordered {
            let body = self
                .read_stage_output(stage)
                .unwrap_or_else(|| "(no output recorded)".to_string());
            doc.push_str(&format!("\n---\n\n## {stage}\n\n{}\n", body.trim_end()));
        }

        self.write_file(HANDOVER_FILE, &doc)
    }

    /// Mirror the whole handover directory into another repository root
    /// (worktree → main repo at finalization). Returns the mirror path.
    pub fn copy_to(&self, dest_root: &Path) -> Result<PathBuf> {
        let leaf = self
            .dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}-{}", self.pipeline_name, short_run_id(&self.run_id)));
        let dest = dest_root.join(".agent-pipeline").join("runs").join(leaf);
        copy_dir_recursive(&self.dir, &dest)?;
        Ok(dest)
    }
}
