//! End-to-end orchestrator tests against real git repositories in temp
//! directories, with a scripted in-process runtime standing in for the
//! agent CLI.

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use pipeline_agent::registry;
use pipeline_core::config::parse_pipeline;
use pipeline_core::runtime::{
    AgentRuntime, ExecutionRequest, ExecutionResult, RuntimeCapabilities, ValidationReport,
};
use pipeline_core::types::{PipelineConfig, PipelineStatus, StageStatus};
use pipeline_engine::Orchestrator;

// ── Fake runtime ─────────────────────────────────────────────────────────

/// Per-stage behavior keyed by a marker in the system prompt (the agent
/// file contents), since the runtime only sees prompts.
#[derive(Default)]
struct Script {
    /// Markers whose stages fail every attempt.
    fail_markers: Vec<&'static str>,
    /// Marker → artificial latency.
    delays: HashMap<&'static str, Duration>,
}

struct FakeRuntime {
    tag: &'static str,
    script: Script,
    attempts: AtomicU32,
}

impl FakeRuntime {
    fn new(tag: &'static str, script: Script) -> Self {
        Self {
            tag,
            script,
            attempts: AtomicU32::new(0),
        }
    }

    fn marker(request: &ExecutionRequest) -> String {
        let first = request.system_prompt.lines().next().unwrap_or("").trim();
        let sanitized: String = first
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .take(40)
            .collect();
        if sanitized.is_empty() {
            "agent".to_string()
        } else {
            sanitized
        }
    }
}

#[async_trait]
impl AgentRuntime for FakeRuntime {
    fn type_tag(&self) -> &str {
        self.tag
    }

    fn name(&self) -> &str {
        "scripted fake"
    }

    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        let marker = Self::marker(&request);

        if let Some(delay) = self
            .script
            .delays
            .iter()
            .find(|(m, _)| marker.contains(**m))
            .map(|(_, d)| *d)
        {
            tokio::time::sleep(delay).await;
        }

        if self.script.fail_markers.iter().any(|m| marker.contains(m)) {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            bail!("E{n}");
        }

        // Leave a change in the execution tree so auto-commit has work.
        if let Some(cwd) = request
            .options
            .runtime_options
            .get("cwd")
            .and_then(serde_json::Value::as_str)
        {
            let file = Path::new(cwd).join(format!("{marker}.txt"));
            std::fs::write(file, format!("output of {marker}"))?;
        }

        Ok(ExecutionResult {
            text_output: format!("{marker} done"),
            ..ExecutionResult::default()
        })
    }

    fn capabilities(&self) -> RuntimeCapabilities {
        RuntimeCapabilities {
            supports_streaming: false,
            supports_token_tracking: false,
            supports_mcp: false,
            supports_context_reduction: false,
            available_models: Vec::new(),
            permission_modes: Vec::new(),
        }
    }

    async fn validate(&self) -> ValidationReport {
        ValidationReport::ok()
    }
}

// ── Git fixture ──────────────────────────────────────────────────────────

fn git(repo: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(args)
        .output()
        .expect("spawn git");
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// Fresh repo on branch `main` with one commit and the given agent files.
fn init_repo(agent_markers: &[&str]) -> tempfile::TempDir {
    let tmp = tempfile::tempdir().unwrap();
    let repo = tmp.path();
    git(repo, &["init", "-b", "main"]);
    git(repo, &["config", "user.name", "pipeline-test"]);
    git(repo, &["config", "user.email", "pipeline-test@example.invalid"]);

    let agents = repo.join(".agent-pipeline/agents");
    std::fs::create_dir_all(&agents).unwrap();
    for marker in agent_markers {
        std::fs::write(agents.join(format!("{marker}.md")), marker).unwrap();
    }
    std::fs::write(repo.join("README.md"), "fixture\n").unwrap();
    git(repo, &["add", "-A"]);
    git(repo, &["commit", "-m", "initial"]);
    tmp
}

fn pipeline_yaml(name: &str, runtime_tag: &str, body: &str) -> PipelineConfig {
    parse_pipeline(&format!(
        "name: {name}\nruntime:\n  type: {runtime_tag}\n{body}"
    ))
    .unwrap()
}

// ── Scenario: linear pipeline, all succeed ───────────────────────────────

#[tokio::test]
async fn linear_pipeline_succeeds_in_order() {
    registry::register(Arc::new(FakeRuntime::new("fake-linear", Script::default()))).unwrap();
    let repo = init_repo(&["alpha", "beta"]);

    let config = pipeline_yaml(
        "linear",
        "fake-linear",
        "agents:\n  - name: alpha\n    agent: .agent-pipeline/agents/alpha.md\n  - name: beta\n    agent: .agent-pipeline/agents/beta.md\n    dependsOn: [alpha]\n",
    );

    let state = Orchestrator::new(repo.path())
        .run(config, None)
        .await
        .unwrap();

    assert_eq!(state.status, PipelineStatus::Completed);
    let names: Vec<&str> = state.stages.iter().map(|s| s.stage_name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "beta"]);
    assert!(state.stages.iter().all(|s| s.status == StageStatus::Success));

    // One commit per stage, and the final commit is beta's.
    let alpha_sha = state.stages[0].commit_sha.clone().unwrap();
    let beta_sha = state.stages[1].commit_sha.clone().unwrap();
    assert_ne!(alpha_sha, beta_sha);
    assert_eq!(state.artifacts.final_commit.as_deref(), Some(beta_sha.as_str()));

    // The handover snapshot references both stages.
    let handover = std::fs::read_to_string(state.artifacts.handover_dir.join("HANDOVER.md")).unwrap();
    assert!(handover.contains("alpha"));
    assert!(handover.contains("beta"));

    // Worktree isolation: the main repo HEAD never moved.
    assert_eq!(git(repo.path(), &["rev-parse", "HEAD"]), state.artifacts.initial_commit);
}

// ── Scenario: parallel fan-in ────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_fan_in_completes_before_join_stage() {
    let script = Script {
        delays: HashMap::from([
            ("rr", Duration::from_millis(80)),
            ("ss", Duration::from_millis(10)),
            ("qq", Duration::from_millis(40)),
        ]),
        ..Script::default()
    };
    registry::register(Arc::new(FakeRuntime::new("fake-fanin", script))).unwrap();
    let repo = init_repo(&["rr", "ss", "qq", "uu"]);

    let config = pipeline_yaml(
        "fanin",
        "fake-fanin",
        "agents:\n  - name: rr\n    agent: .agent-pipeline/agents/rr.md\n  - name: ss\n    agent: .agent-pipeline/agents/ss.md\n  - name: qq\n    agent: .agent-pipeline/agents/qq.md\n  - name: uu\n    agent: .agent-pipeline/agents/uu.md\n    dependsOn: [rr, ss, qq]\n",
    );

    let plan = pipeline_core::dag::plan(&config).unwrap();
    assert_eq!(plan.max_parallelism, 3);

    let state = Orchestrator::new(repo.path())
        .run(config, None)
        .await
        .unwrap();

    assert_eq!(state.status, PipelineStatus::Completed);
    assert_eq!(state.stages.len(), 4);
    assert_eq!(state.stages[3].stage_name, "uu");
    let first_three: Vec<&str> = state.stages[..3].iter().map(|s| s.stage_name.as_str()).collect();
    for name in ["rr", "ss", "qq"] {
        assert!(first_three.contains(&name), "{name} missing from first group");
    }
    // Appended in completion order: the quickest stage lands first.
    assert_eq!(state.stages[0].stage_name, "ss");
}

// ── Scenario: failure with continue ──────────────────────────────────────

#[tokio::test]
async fn failed_dependency_skips_downstream_and_completes() {
    let script = Script {
        fail_markers: vec!["xx"],
        ..Script::default()
    };
    registry::register(Arc::new(FakeRuntime::new("fake-continue", script))).unwrap();
    let repo = init_repo(&["xx", "yy"]);

    let config = pipeline_yaml(
        "soft-fail",
        "fake-continue",
        "settings:\n  failureStrategy: continue\nagents:\n  - name: xx\n    agent: .agent-pipeline/agents/xx.md\n  - name: yy\n    agent: .agent-pipeline/agents/yy.md\n    dependsOn: [xx]\n",
    );

    let state = Orchestrator::new(repo.path())
        .run(config, None)
        .await
        .unwrap();

    assert_eq!(state.status, PipelineStatus::Completed);
    let xx = state.stage_execution("xx").unwrap();
    assert_eq!(xx.status, StageStatus::Failed);
    assert!(xx.error.is_some());
    let yy = state.stage_execution("yy").unwrap();
    assert_eq!(yy.status, StageStatus::Skipped);
    assert!(yy.error.as_ref().unwrap().message.contains("xx"));
}

// ── Scenario: stop strategy halts the pipeline ───────────────────────────

#[tokio::test]
async fn stop_strategy_fails_pipeline_and_halts_downstream() {
    let script = Script {
        fail_markers: vec!["broken"],
        ..Script::default()
    };
    registry::register(Arc::new(FakeRuntime::new("fake-stop", script))).unwrap();
    let repo = init_repo(&["broken", "after"]);

    let config = pipeline_yaml(
        "hard-fail",
        "fake-stop",
        "agents:\n  - name: broken\n    agent: .agent-pipeline/agents/broken.md\n  - name: after\n    agent: .agent-pipeline/agents/after.md\n    dependsOn: [broken]\n",
    );

    let state = Orchestrator::new(repo.path())
        .run(config, None)
        .await
        .unwrap();

    assert_eq!(state.status, PipelineStatus::Failed);
    // Downstream group never started; only the failed stage is recorded.
    assert_eq!(state.stages.len(), 1);
    assert_eq!(state.stages[0].stage_name, "broken");
}

// ── Scenario: retry exhausted ────────────────────────────────────────────

#[tokio::test]
async fn retry_exhaustion_records_last_error_and_attempts() {
    let script = Script {
        fail_markers: vec!["flaky"],
        ..Script::default()
    };
    registry::register(Arc::new(FakeRuntime::new("fake-retry", script))).unwrap();
    let repo = init_repo(&["flaky"]);

    let config = pipeline_yaml(
        "retry",
        "fake-retry",
        "settings:\n  failureStrategy: continue\nagents:\n  - name: flaky\n    agent: .agent-pipeline/agents/flaky.md\n    retry:\n      maxAttempts: 3\n      backoff: exponential\n      initialDelay: 100\n      maxDelay: 30000\n",
    );

    let started = std::time::Instant::now();
    let state = Orchestrator::new(repo.path())
        .run(config, None)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    let flaky = state.stage_execution("flaky").unwrap();
    assert_eq!(flaky.status, StageStatus::Failed);
    assert_eq!(flaky.retry_attempt, 3);
    assert_eq!(flaky.max_retries, 3);
    assert!(flaky.error.as_ref().unwrap().message.contains("E3"));
    // Backoff slept 100ms then 200ms before the final attempt.
    assert!(elapsed >= Duration::from_millis(300), "elapsed {elapsed:?}");
}

// ── Scenario: loop with one queued pipeline ──────────────────────────────

#[tokio::test]
async fn loop_drains_pending_queue_then_completes() {
    registry::register(Arc::new(FakeRuntime::new("fake-loop", Script::default()))).unwrap();
    let repo = init_repo(&["work"]);

    // Queue a follow-up pipeline before the loop starts.
    let mut config = pipeline_yaml(
        "looped",
        "fake-loop",
        "agents:\n  - name: work\n    agent: .agent-pipeline/agents/work.md\n",
    );
    config.looping.enabled = true;
    config.looping.max_iterations = 3;
    config.git.worktree.enabled = false;

    let pending = repo.path().join(".agent-pipeline/loops/default/pending");
    std::fs::create_dir_all(&pending).unwrap();
    std::fs::write(
        pending.join("next.yml"),
        "name: queued\nruntime:\n  type: fake-loop\nagents:\n  - name: work\n    agent: .agent-pipeline/agents/work.md\n",
    )
    .unwrap();

    let state = Orchestrator::new(repo.path())
        .run(config, None)
        .await
        .unwrap();

    // The queued file travelled pending -> running -> finished.
    let loops = repo.path().join(".agent-pipeline/loops/default");
    assert!(pipeline_core::loop_state::oldest_pending_yaml(&pending).is_none());
    let finished: Vec<_> = std::fs::read_dir(loops.join("finished"))
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".yml"))
        .collect();
    assert_eq!(finished, vec!["next.yml"]);
    assert!(std::fs::read_dir(loops.join("running"))
        .unwrap()
        .filter_map(|e| e.ok())
        .all(|e| e.file_name() == ".gitignore"));

    // Both iterations ran the synthetic loop stage.
    assert!(state.stages.iter().any(|s| s.stage_name.starts_with("loop-agent")));
    assert_eq!(
        state.loop_context.as_ref().unwrap().termination_reason,
        Some(pipeline_core::types::TerminationReason::Natural)
    );

    // Session record: two iterations, completed.
    let sessions_dir = repo.path().join(".agent-pipeline/state/loops");
    let session_file = std::fs::read_dir(&sessions_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .find(|e| e.path().extension().is_some_and(|x| x == "json"))
        .unwrap();
    let session: pipeline_core::types::LoopSession =
        serde_json::from_str(&std::fs::read_to_string(session_file.path()).unwrap()).unwrap();
    assert_eq!(session.status, pipeline_core::types::LoopStatus::Completed);
    assert_eq!(session.total_iterations, 2);
    assert!(session.iterations[0].triggered_next);
    assert!(!session.iterations[1].triggered_next);
}

// ── Scenario: worktree + unique-and-delete ───────────────────────────────

#[tokio::test]
async fn unique_and_delete_merges_and_cleans_up() {
    registry::register(Arc::new(FakeRuntime::new("fake-cleanup", Script::default()))).unwrap();
    let repo = init_repo(&["work"]);
    // Park the main repo on a side branch so `main` is free to merge into.
    git(repo.path(), &["checkout", "-b", "parked"]);
    let parked_head = git(repo.path(), &["rev-parse", "HEAD"]);

    let mut config = pipeline_yaml(
        "cleanup",
        "fake-cleanup",
        "agents:\n  - name: work\n    agent: .agent-pipeline/agents/work.md\n",
    );
    config.git.branch_strategy = pipeline_core::types::BranchStrategy::UniqueAndDelete;
    config.git.merge_strategy = pipeline_core::types::MergeStrategy::LocalMerge;

    let state = Orchestrator::new(repo.path())
        .run(config, None)
        .await
        .unwrap();

    assert_eq!(state.status, PipelineStatus::Completed);

    // Worktree and branch are gone.
    let worktree = state.artifacts.worktree_path.clone().unwrap();
    assert!(!worktree.exists());
    let branches = git(repo.path(), &["branch", "--list"]);
    assert!(!branches.contains("pipeline/cleanup"), "branches: {branches}");

    // The parked branch never moved; main received the merge.
    assert_eq!(git(repo.path(), &["rev-parse", "HEAD"]), parked_head);
    let main_files = git(repo.path(), &["ls-tree", "--name-only", "main"]);
    assert!(main_files.contains("work.txt"), "main tree: {main_files}");

    // Handover was mirrored into the main repo before disposal.
    let mirror = state.artifacts.main_repo_handover_dir.clone().unwrap();
    assert!(mirror.join("HANDOVER.md").exists());

    // Commit causality: the stage commit is reachable from main.
    let stage_sha = state.stages[0].commit_sha.clone().unwrap();
    let out = Command::new("git")
        .arg("-C")
        .arg(repo.path())
        .args(["merge-base", "--is-ancestor", &stage_sha, "main"])
        .status()
        .unwrap();
    assert!(out.success());
}

// ── Scenario: disabled stage is transparent ──────────────────────────────

#[tokio::test]
async fn disabled_stage_is_skipped_but_dependents_run() {
    registry::register(Arc::new(FakeRuntime::new("fake-disabled", Script::default()))).unwrap();
    let repo = init_repo(&["first", "second"]);

    let config = pipeline_yaml(
        "disabled",
        "fake-disabled",
        "agents:\n  - name: first\n    agent: .agent-pipeline/agents/first.md\n    enabled: false\n  - name: second\n    agent: .agent-pipeline/agents/second.md\n    dependsOn: [first]\n",
    );

    let state = Orchestrator::new(repo.path())
        .run(config, None)
        .await
        .unwrap();

    assert_eq!(state.status, PipelineStatus::Completed);
    assert_eq!(state.stage_execution("first").unwrap().status, StageStatus::Skipped);
    assert_eq!(state.stage_execution("second").unwrap().status, StageStatus::Success);
}

// ── State persistence along the way ──────────────────────────────────────

#[tokio::test]
async fn state_file_is_persisted_and_loadable() {
    registry::register(Arc::new(FakeRuntime::new("fake-state", Script::default()))).unwrap();
    let repo = init_repo(&["only"]);

    let config = pipeline_yaml(
        "stateful",
        "fake-state",
        "agents:\n  - name: only\n    agent: .agent-pipeline/agents/only.md\n",
    );

    let state = Orchestrator::new(repo.path())
        .run(config, None)
        .await
        .unwrap();

    let mgr = pipeline_core::state::StateManager::new(repo.path());
    let loaded = mgr.load(&state.run_id).unwrap();
    assert_eq!(loaded.run_id, state.run_id);
    assert_eq!(loaded.status, PipelineStatus::Completed);
    assert_eq!(loaded.stages.len(), 1);
    assert_eq!(loaded.artifacts.final_commit, state.artifacts.final_commit);
    assert_eq!(mgr.latest_run().unwrap().run_id, state.run_id);
}
