use std::collections::{HashMap, HashSet};

use anyhow::{bail, Result};

use crate::types::{ExecutionMode, PipelineConfig, StageConfig};

/// Chains deeper than this draw a warning.
const DEEP_CHAIN_DEPTH: usize = 6;

/// Levels wider than this draw a rate-limit warning.
const WIDE_LEVEL_SIZE: usize = 10;

/// Ordered execution plan: groups of stage names by topological level.
/// Stages inside a group keep the config's declaration order.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub groups: Vec<Vec<String>>,
    pub levels: HashMap<String, usize>,
    pub total_stages: usize,
    pub max_parallelism: usize,
    pub is_sequential: bool,
    pub warnings: Vec<String>,
}

impl ExecutionPlan {
    pub fn level_of(&self, stage: &str) -> Option<usize> {
        self.levels.get(stage).copied()
    }
}

/// Structural validation outcome, separate from planning so callers can
/// render all problems at once.
#[derive(Debug, Clone, Default)]
pub struct GraphValidation {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl GraphValidation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Check that the stages form a DAG: unique names, resolvable dependencies,
/// no self-dependency, no cycle.
pub fn validate_stages(stages: &[StageConfig]) -> GraphValidation {
    let mut out = GraphValidation::default();

    if stages.is_empty() {
        out.errors.push("pipeline declares no agents".to_string());
        return out;
    }

    let mut seen = HashSet::new();
    for stage in stages {
        if !seen.insert(stage.name.as_str()) {
            out.errors.push(format!("duplicate stage name: {}", stage.name));
        }
    }

    let names: HashSet<&str> = stages.iter().map(|s| s.name.as_str()).collect();
    for stage in stages {
        for dep in &stage.depends_on {
            if dep == &stage.name {
                out.errors.push(format!("stage {} depends on itself", stage.name));
            } else if !names.contains(dep.as_str()) {
                out.errors.push(format!(
                    "stage {} depends on unknown stage {dep}",
                    stage.name
                ));
            }
        }
    }

    if !out.errors.is_empty() {
        return out;
    }

    if let Some(cycle) = find_cycle(stages) {
        out.errors.push(format!("dependency cycle: {}", cycle.join(" -> ")));
    }

    out
}

/// Walk the dependency edges depth-first; the first back edge yields the
/// cycle members (at least two).
fn find_cycle(stages: &[StageConfig]) -> Option<Vec<String>> {
    let deps: HashMap<&str, &[String]> = stages
        .iter()
        .map(|s| (s.name.as_str(), s.depends_on.as_slice()))
        .collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        InProgress,
        Done,
    }

    fn visit<'a>(
        node: &'a str,
        deps: &HashMap<&'a str, &'a [String]>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match marks.get(node) {
            Some(Mark::Done) => return None,
            Some(Mark::InProgress) => {
                let start = stack.iter().position(|n| *n == node).unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(node.to_string());
                return Some(cycle);
            }
            None => {}
        }
        marks.insert(node, Mark::InProgress);
        stack.push(node);
        if let Some(node_deps) = deps.get(node) {
            for dep in node_deps.iter() {
                if let Some(cycle) = visit(dep.as_str(), deps, marks, stack) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        marks.insert(node, Mark::Done);
        None
    }

    let mut marks = HashMap::new();
    let mut stack = Vec::new();
    for stage in stages {
        if let Some(cycle) = visit(stage.name.as_str(), &deps, &mut marks, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

/// Build the execution plan for a pipeline. Sequential execution mode
/// flattens every group to a single stage while keeping topological order.
pub fn plan(config: &PipelineConfig) -> Result<ExecutionPlan> {
    let validation = validate_stages(&config.agents);
    if !validation.is_valid() {
        bail!("invalid pipeline graph: {}", validation.errors.join("; "));
    }

    let mut plan = plan_stages(&config.agents)?;
    plan.warnings.extend(validation.warnings);

    if config.settings.execution_mode == ExecutionMode::Sequential {
        plan.groups = plan
            .groups
            .into_iter()
            .flat_map(|group| group.into_iter().map(|s| vec![s]))
            .collect();
        plan.max_parallelism = 1;
        plan.is_sequential = true;
    }

    Ok(plan)
}

/// Topological grouping: `level(s) = 1 + max(level(d))`, 0 with no deps.
pub fn plan_stages(stages: &[StageConfig]) -> Result<ExecutionPlan> {
    let deps: HashMap<&str, &[String]> = stages
        .iter()
        .map(|s| (s.name.as_str(), s.depends_on.as_slice()))
        .collect();

    fn level_of<'a>(
        node: &'a str,
        deps: &HashMap<&'a str, &'a [String]>,
        memo: &mut HashMap<&'a str, usize>,
    ) -> usize {
        if let Some(level) = memo.get(node) {
            return *level;
        }
        let level = deps
            .get(node)
            .into_iter()
            .flat_map(|d| d.iter())
            .map(|dep| level_of(dep.as_str(), deps, memo) + 1)
            .max()
            .unwrap_or(0);
        memo.insert(node, level);
        level
    }

    let mut memo: HashMap<&str, usize> = HashMap::new();
    let mut levels: HashMap<String, usize> = HashMap::new();
    let mut depth = 0usize;
    for stage in stages {
        let level = level_of(stage.name.as_str(), &deps, &mut memo);
        depth = depth.max(level + 1);
        levels.insert(stage.name.clone(), level);
    }

    // Declaration order within a level is preserved by this pass.
    let mut groups: Vec<Vec<String>> = vec![Vec::new(); depth];
    for stage in stages {
        let level = levels[&stage.name];
        groups[level].push(stage.name.clone());
    }

    let mut warnings = Vec::new();
    if depth >= DEEP_CHAIN_DEPTH {
        warnings.push(format!(
            "deep dependency chain: {depth} levels; consider flattening"
        ));
    }
    let max_parallelism = groups.iter().map(Vec::len).max().unwrap_or(0);
    if let Some(wide) = groups.iter().find(|g| g.len() > WIDE_LEVEL_SIZE) {
        warnings.push(format!(
            "{} stages would run concurrently in one level; agent rate limits may throttle this",
            wide.len()
        ));
    }

    Ok(ExecutionPlan {
        total_stages: stages.len(),
        max_parallelism,
        is_sequential: max_parallelism <= 1,
        levels,
        groups,
        warnings,
    })
}
