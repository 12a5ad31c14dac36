//! Keyword routing: map a plan step's skill and sub-query to the
//! subprocess command and parameter object.
//!
//! Policy is an ordered rule list: the first matching rule wins, in
//! the order declared here.  The function is pure so every rule is
//! individually testable.

use std::sync::OnceLock;

use anyhow::bail;
use serde_json::{json, Value};

/// Knobs that gate or shape routing decisions.
#[derive(Debug, Clone)]
pub struct RoutingOptions {
    /// When set, the shell-helper skill refuses arbitrary command
    /// execution.
    pub safe_mode: bool,
    /// Cap injected into file-search operations.
    pub max_find_results: usize,
}

impl Default for RoutingOptions {
    fn default() -> Self {
        Self { safe_mode: true, max_find_results: 50 }
    }
}

/// Infer the `(command, parameters)` pair for one plan step.
///
/// Well-known skills map to their canonical command; the shell-helper
/// skill routes on sub-query keywords; anything else falls through to
/// `skill_name` with `-` folded to `_` and the sub-query passed as
/// `query`.
pub fn infer_command_and_params(
    skill_name: &str,
    sub_query: &str,
    opts: &RoutingOptions,
) -> anyhow::Result<(String, Value)> {
    match skill_name {
        "calendar-assistant" => Ok((
            "natural_language_to_ics".to_string(),
            json!({ "query": sub_query }),
        )),
        "nvidia-ideagen" => Ok((
            "generate_ideas".to_string(),
            json!({
                "topic": extract_topic(sub_query),
                "num_ideas": extract_num_ideas(sub_query),
            }),
        )),
        "shell-commands" => shell_route(sub_query, opts),
        other => Ok((other.replace('-', "_"), json!({ "query": sub_query }))),
    }
}

/// Ordered rules for the shell-helper skill.  First match wins.
fn shell_route(sub_query: &str, opts: &RoutingOptions) -> anyhow::Result<(String, Value)> {
    let q = sub_query.to_lowercase();

    // 1. Arbitrary command execution, gated by SAFE_MODE.
    if q.starts_with("run ")
        || q.starts_with("execute ")
        || q.contains("run the command")
        || q.contains("execute the command")
    {
        if opts.safe_mode {
            bail!("arbitrary command execution is disabled by SAFE_MODE");
        }
        let command = sub_query
            .trim()
            .strip_prefix("run ")
            .or_else(|| sub_query.trim().strip_prefix("execute "))
            .unwrap_or(sub_query)
            .trim();
        return Ok(("run_command".to_string(), json!({ "command": command })));
    }

    // 2. File location.
    if contains_any(&q, &["find ", "locate", "where is", "identify where"]) {
        return Ok((
            "find_files".to_string(),
            json!({
                "pattern": extract_file_pattern(sub_query),
                "search_path": ".",
                "max_results": opts.max_find_results,
            }),
        ));
    }

    // 3. Searching inside a file.
    if contains_any(&q, &["grep", "search", "extract", "section"]) {
        return Ok((
            "grep_in_file".to_string(),
            json!({
                "filepath": extract_filename(sub_query).unwrap_or_else(|| "README.md".to_string()),
                "pattern": extract_section_keywords(&q),
            }),
        ));
    }

    // 4. Directory listing.
    if contains_any(&q, &["list ", "ls ", "show files", "directory"]) {
        return Ok(("list_directory".to_string(), json!({ "path": "." })));
    }

    // 5. File content.
    if contains_any(&q, &["cat ", "show ", "display", "read ", "view "]) {
        return Ok((
            "cat_file".to_string(),
            json!({
                "filepath": extract_filename(sub_query).unwrap_or_else(|| "README.md".to_string()),
            }),
        ));
    }

    // 6. File metadata.
    if contains_any(&q, &["info", "details", "statistics"]) {
        return Ok((
            "get_file_info".to_string(),
            json!({
                "filepath": extract_filename(sub_query).unwrap_or_else(|| "README.md".to_string()),
            }),
        ));
    }

    // 7. Default: treat as a location query.
    Ok((
        "find_files".to_string(),
        json!({
            "pattern": extract_file_pattern(sub_query),
            "search_path": ".",
            "max_results": opts.max_find_results,
        }),
    ))
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

fn filename_pattern() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"([\w./-]+\.[A-Za-z0-9]+)").expect("filename pattern compiles")
    })
}

/// First filename-looking token of the sub-query.
fn extract_filename(sub_query: &str) -> Option<String> {
    if sub_query.to_lowercase().contains("readme") {
        return Some("README.md".to_string());
    }
    filename_pattern()
        .captures(sub_query)
        .map(|c| c[1].to_string())
}

/// Glob pattern for a file-location query; `*` when nothing concrete
/// was named.
fn extract_file_pattern(sub_query: &str) -> String {
    extract_filename(sub_query).unwrap_or_else(|| "*".to_string())
}

const SECTION_KEYWORDS: &[&str] = &[
    "performance",
    "architecture",
    "speed",
    "optimization",
    "implementation",
    "latency",
    "throughput",
];

/// Alternation of the known section keywords present in the query;
/// falls back to the query text itself.
fn extract_section_keywords(q: &str) -> String {
    let hits: Vec<&str> = SECTION_KEYWORDS
        .iter()
        .copied()
        .filter(|k| q.contains(k))
        .collect();
    if hits.is_empty() {
        q.trim().to_string()
    } else {
        hits.join("|")
    }
}

fn num_ideas_pattern() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"(\d+)\s+ideas?").expect("num ideas pattern compiles"))
}

/// Requested idea count, clamped to 1–10, defaulting to 5.
fn extract_num_ideas(sub_query: &str) -> u32 {
    num_ideas_pattern()
        .captures(&sub_query.to_lowercase())
        .and_then(|c| c[1].parse::<u32>().ok())
        .filter(|n| (1..=10).contains(n))
        .unwrap_or(5)
}

/// Topic with generation verbs and idea counts stripped out.
fn extract_topic(sub_query: &str) -> String {
    static VERBS: OnceLock<regex::Regex> = OnceLock::new();
    static COUNT: OnceLock<regex::Regex> = OnceLock::new();
    let verbs = VERBS.get_or_init(|| {
        regex::Regex::new(r"(?i)generate|brainstorm|give me|create|come up with|i need")
            .expect("verbs pattern compiles")
    });
    let count = COUNT.get_or_init(|| {
        regex::Regex::new(r"(?i)\d+\s+ideas?\s*(for|about|on)?\s*")
            .expect("count pattern compiles")
    });
    let verbs_stripped = verbs.replace_all(sub_query, "");
    let stripped = count.replace_all(&verbs_stripped, "");
    let topic = stripped.trim();
    if topic.is_empty() {
        sub_query.to_string()
    } else {
        topic.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calendar_passes_query_verbatim() {
        let (cmd, params) = infer_command_and_params(
            "calendar-assistant",
            "schedule a meeting tomorrow at 2pm",
            &RoutingOptions::default(),
        )
        .unwrap();
        assert_eq!(cmd, "natural_language_to_ics");
        assert_eq!(params["query"], "schedule a meeting tomorrow at 2pm");
    }

    #[test]
    fn ideagen_extracts_count_and_topic() {
        let (cmd, params) = infer_command_and_params(
            "nvidia-ideagen",
            "generate 7 ideas for a weekend hackathon",
            &RoutingOptions::default(),
        )
        .unwrap();
        assert_eq!(cmd, "generate_ideas");
        assert_eq!(params["num_ideas"], 7);
        assert_eq!(params["topic"], "a weekend hackathon");
    }

    #[test]
    fn ideagen_count_clamps_to_default() {
        let (_, params) = infer_command_and_params(
            "nvidia-ideagen",
            "generate 50 ideas for lunch",
            &RoutingOptions::default(),
        )
        .unwrap();
        assert_eq!(params["num_ideas"], 5);
    }

    #[test]
    fn shell_find_rule_wins_over_grep() {
        // Both "identify where" and "extract" appear: the earlier rule
        // in declaration order wins.
        let (cmd, params) = infer_command_and_params(
            "shell-commands",
            "identify where the README.md file is located so we can extract it",
            &RoutingOptions::default(),
        )
        .unwrap();
        assert_eq!(cmd, "find_files");
        assert_eq!(params["pattern"], "README.md");
        assert_eq!(params["search_path"], ".");
    }

    #[test]
    fn shell_grep_extracts_section_keywords() {
        let (cmd, params) = infer_command_and_params(
            "shell-commands",
            "extract the performance and architecture sections from README.md",
            &RoutingOptions::default(),
        )
        .unwrap();
        assert_eq!(cmd, "grep_in_file");
        assert_eq!(params["filepath"], "README.md");
        assert_eq!(params["pattern"], "performance|architecture");
    }

    #[test]
    fn shell_default_is_find_files() {
        let (cmd, params) = infer_command_and_params(
            "shell-commands",
            "something unrecognisable",
            &RoutingOptions::default(),
        )
        .unwrap();
        assert_eq!(cmd, "find_files");
        assert_eq!(params["pattern"], "*");
    }

    #[test]
    fn max_find_results_injected() {
        let opts = RoutingOptions { max_find_results: 7, ..RoutingOptions::default() };
        let (_, params) =
            infer_command_and_params("shell-commands", "find the notes.txt file", &opts).unwrap();
        assert_eq!(params["max_results"], 7);
    }

    #[test]
    fn safe_mode_refuses_run_command() {
        let err = infer_command_and_params(
            "shell-commands",
            "run rm -rf /tmp/scratch",
            &RoutingOptions::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("SAFE_MODE"));
    }

    #[test]
    fn run_command_allowed_when_safe_mode_off() {
        let opts = RoutingOptions { safe_mode: false, ..RoutingOptions::default() };
        let (cmd, params) =
            infer_command_and_params("shell-commands", "run echo hello", &opts).unwrap();
        assert_eq!(cmd, "run_command");
        assert_eq!(params["command"], "echo hello");
    }

    #[test]
    fn unknown_skill_falls_through_to_snake_case() {
        let (cmd, params) = infer_command_and_params(
            "nvidia-vlm",
            "describe this image",
            &RoutingOptions::default(),
        )
        .unwrap();
        assert_eq!(cmd, "nvidia_vlm");
        assert_eq!(params["query"], "describe this image");
    }
}
