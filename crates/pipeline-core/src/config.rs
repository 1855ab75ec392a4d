use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::dag::validate_stages;
use crate::template;
use crate::types::{BranchStrategy, MergeStrategy, PipelineConfig};

/// Result of config validation: errors block execution, warnings are
/// surfaced to the caller and logged.
#[derive(Debug, Clone, Default)]
pub struct ConfigReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ConfigReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Parse a pipeline definition from YAML text.
pub fn parse_pipeline(yaml: &str) -> Result<PipelineConfig> {
    serde_yaml::from_str(yaml).context("parse pipeline YAML")
}

/// Load a pipeline definition from an explicit file path.
pub fn load_pipeline_file(path: &Path) -> Result<PipelineConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read pipeline file {}", path.display()))?;
    parse_pipeline(&raw).with_context(|| format!("in {}", path.display()))
}

/// Resolve a pipeline by name under `.agent-pipeline/pipelines/`, trying
/// both `.yml` and `.yaml`.
pub fn find_pipeline(repo_root: &Path, name: &str) -> Result<PathBuf> {
    let base = repo_root.join(".agent-pipeline").join("pipelines");
    for ext in ["yml", "yaml"] {
        let candidate = base.join(format!("{name}.{ext}"));
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    bail!("no pipeline named {name} under {}", base.display())
}

/// Structural and policy validation of a loaded config. Graph problems are
/// errors; style problems are warnings.
pub fn validate_config(config: &PipelineConfig) -> ConfigReport {
    let mut report = ConfigReport::default();

    let graph = validate_stages(&config.agents);
    report.errors.extend(graph.errors);
    report.warnings.extend(graph.warnings);

    if config.git.branch_strategy == BranchStrategy::UniqueAndDelete {
        if config.git.merge_strategy == MergeStrategy::None {
            report.errors.push(
                "branchStrategy unique-and-delete with mergeStrategy none would delete \
                 the branch without merging it; the run's work would be lost"
                    .to_string(),
            );
        }
        if config.looping.enabled {
            report.errors.push(
                "branchStrategy unique-and-delete cannot be combined with looping; \
                 each iteration would delete the branch the next one builds on"
                    .to_string(),
            );
        }
    }

    let prefix = &config.settings.commit_prefix;
    if !template::references_known_variable(prefix) {
        report.warnings.push(format!(
            "commitPrefix {prefix:?} references no template variable; every commit will share it verbatim"
        ));
    }
    let unknown = template::unknown_variables(prefix);
    if !unknown.is_empty() {
        report.warnings.push(format!(
            "commitPrefix references unknown template variables: {}",
            unknown.join(", ")
        ));
    }
    for tmpl in [&config.git.pull_request.title, &config.git.pull_request.body]
        .into_iter()
        .flatten()
    {
        let unknown = template::unknown_variables(tmpl);
        if !unknown.is_empty() {
            report.warnings.push(format!(
                "pullRequest template references unknown variables: {}",
                unknown.join(", ")
            ));
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;

    const SAMPLE: &str = r#"
name: nightly
trigger: manual
agents:
  - name: plan
    agent: .agent-pipeline/agents/plan.md
  - name: build
    agent: .agent-pipeline/agents/build.md
    dependsOn: [plan]
    timeout: 1200
    retry:
      maxAttempts: 3
      backoff: exponential
      initialDelay: 100
      maxDelay: 30000
  - name: review
    agent: .agent-pipeline/agents/review.md
    dependsOn: [build]
    onFail: warn
runtime:
  type: claude-code-headless
  options:
    allowedTools: "Read,Write,Edit,Bash"
settings:
  failureStrategy: continue
  commitPrefix: "pipeline({{pipelineName}}): {{stage}}"
git:
  baseBranch: main
  branchStrategy: unique-per-run
  mergeStrategy: pull-request
  pullRequest:
    title: "{{pipelineName}} run {{runId}}"
    draft: true
looping:
  enabled: false
"#;

    #[test]
    fn sample_yaml_parses_fully() {
        let config = parse_pipeline(SAMPLE).unwrap();
        assert_eq!(config.name, "nightly");
        assert_eq!(config.agents.len(), 3);
        assert_eq!(config.agents[1].depends_on, vec!["plan"]);
        assert_eq!(config.agents[1].timeout, Some(1200));
        let retry = config.agents[1].retry.as_ref().unwrap();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(config.settings.failure_strategy, FailureStrategy::Continue);
        assert_eq!(config.git.branch_strategy, BranchStrategy::UniquePerRun);
        assert_eq!(config.git.merge_strategy, MergeStrategy::PullRequest);
        assert!(config.git.pull_request.draft);
        assert_eq!(
            config.runtime.as_ref().unwrap().type_tag,
            "claude-code-headless"
        );
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let config = parse_pipeline("name: tiny\nagents:\n  - name: a\n    agent: a.md\n").unwrap();
        assert_eq!(config.settings.failure_strategy, FailureStrategy::Stop);
        assert!(config.settings.auto_commit);
        assert_eq!(config.git.base_branch, "main");
        assert_eq!(config.git.branch_prefix, "pipeline");
        assert_eq!(config.looping.max_iterations, DEFAULT_MAX_ITERATIONS);
        assert!(config.git.worktree.enabled);
    }

    #[test]
    fn zero_agents_is_an_error() {
        let config = parse_pipeline("name: empty\nagents: []\n").unwrap();
        let report = validate_config(&config);
        assert!(!report.is_valid());
    }

    #[test]
    fn unique_and_delete_with_merge_none_is_rejected() {
        let mut config = parse_pipeline("name: x\nagents:\n  - name: a\n    agent: a.md\n").unwrap();
        config.git.branch_strategy = BranchStrategy::UniqueAndDelete;
        config.git.merge_strategy = MergeStrategy::None;
        let report = validate_config(&config);
        assert!(report.errors.iter().any(|e| e.contains("lost")));
    }

    #[test]
    fn unique_and_delete_with_looping_is_rejected() {
        let mut config = parse_pipeline("name: x\nagents:\n  - name: a\n    agent: a.md\n").unwrap();
        config.git.branch_strategy = BranchStrategy::UniqueAndDelete;
        config.git.merge_strategy = MergeStrategy::LocalMerge;
        config.looping.enabled = true;
        let report = validate_config(&config);
        assert!(report.errors.iter().any(|e| e.contains("looping")));
    }

    #[test]
    fn static_commit_prefix_warns() {
        let mut config = parse_pipeline("name: x\nagents:\n  - name: a\n    agent: a.md\n").unwrap();
        config.settings.commit_prefix = "static prefix".into();
        let report = validate_config(&config);
        assert!(report.is_valid());
        assert!(report.warnings.iter().any(|w| w.contains("no template variable")));
    }

    #[test]
    fn unknown_template_variables_are_named() {
        let mut config = parse_pipeline("name: x\nagents:\n  - name: a\n    agent: a.md\n").unwrap();
        config.settings.commit_prefix = "{{stage}} {{typo}}".into();
        let report = validate_config(&config);
        assert!(report.is_valid());
        assert!(report.warnings.iter().any(|w| w.contains("typo")));
    }

    #[test]
    fn find_pipeline_tries_both_extensions() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(".agent-pipeline/pipelines");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("night.yaml"), "name: night\nagents: []\n").unwrap();
        let found = find_pipeline(tmp.path(), "night").unwrap();
        assert!(found.ends_with("night.yaml"));
        assert!(find_pipeline(tmp.path(), "missing").is_err());
    }
}
