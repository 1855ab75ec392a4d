use std::sync::OnceLock;

use regex::Regex;

/// Variables available to commit-prefix and pull-request templates.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateVars<'a> {
    pub stage: &'a str,
    pub pipeline_name: &'a str,
    pub run_id: &'a str,
    pub branch: &'a str,
}

const KNOWN_VARS: [&str; 4] = ["stage", "pipelineName", "runId", "branch"];

fn var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{\s*(\w+)\s*\}\}").unwrap_or_else(|_| unreachable!()))
}

/// Substitute `{{stage}}`, `{{pipelineName}}`, `{{runId}}` and `{{branch}}`.
/// Unknown variables render as the empty string.
pub fn render(template: &str, vars: &TemplateVars<'_>) -> String {
    var_pattern()
        .replace_all(template, |caps: &regex::Captures<'_>| match &caps[1] {
            "stage" => vars.stage.to_string(),
            "pipelineName" => vars.pipeline_name.to_string(),
            "runId" => vars.run_id.to_string(),
            "branch" => vars.branch.to_string(),
            _ => String::new(),
        })
        .into_owned()
}

/// Template variables referenced but not in the known set.
pub fn unknown_variables(template: &str) -> Vec<String> {
    var_pattern()
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .filter(|name| !KNOWN_VARS.contains(&name.as_str()))
        .collect()
}

/// True when the template references at least one known variable.
pub fn references_known_variable(template: &str) -> bool {
    var_pattern()
        .captures_iter(template)
        .any(|c| KNOWN_VARS.contains(&&c[1]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> TemplateVars<'static> {
        TemplateVars {
            stage: "build",
            pipeline_name: "nightly",
            run_id: "abc123",
            branch: "pipeline/nightly",
        }
    }

    #[test]
    fn substitutes_all_known_variables() {
        let out = render("{{pipelineName}}:{{stage}}@{{runId}} on {{branch}}", &vars());
        assert_eq!(out, "nightly:build@abc123 on pipeline/nightly");
    }

    #[test]
    fn unknown_variables_render_empty() {
        let out = render("x{{bogus}}y", &vars());
        assert_eq!(out, "xy");
    }

    #[test]
    fn whitespace_inside_braces_is_tolerated() {
        let out = render("{{ stage }}", &vars());
        assert_eq!(out, "build");
    }

    #[test]
    fn reports_unknown_variables_by_name() {
        let unknown = unknown_variables("{{stage}} {{foo}} {{bar}}");
        assert_eq!(unknown, vec!["foo", "bar"]);
    }

    #[test]
    fn detects_templates_without_known_variables() {
        assert!(!references_known_variable("static prefix"));
        assert!(!references_known_variable("{{unknownOnly}}"));
        assert!(references_known_variable("{{runId}}"));
    }
}
