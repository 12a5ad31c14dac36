//! Skill registry — discovers and indexes subprocess-backed skills.
//!
//! A skill is a directory holding a `SKILL.md` manifest (YAML
//! front-matter between `---` fences, markdown body = instructions) and
//! a `scripts/` subdirectory with exactly one entry script named
//! `<something>_skill.<ext>`.  An optional `config.yaml` beside the
//! manifest overrides front-matter values field by field.
//!
//! Discovery walks the configured base directory two levels deep, so
//! both `skills/foo/` and `skills/group/foo/` layouts work.  Malformed
//! skill directories are logged and skipped; a duplicate skill name is
//! a startup error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::executor::SubprocessExecutor;

// ── Types ───────────────────────────────────────────────────

/// A named operation a skill exposes over the subprocess protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the command's `parameters` object.
    #[serde(default = "default_schema", alias = "parameter_schema")]
    pub parameters: serde_json::Value,
    /// When true, the tool's output is returned to the user verbatim.
    #[serde(default)]
    pub return_direct: bool,
}

fn default_schema() -> serde_json::Value {
    json!({ "type": "object", "properties": {} })
}

/// Front-matter parsed from a `SKILL.md` manifest.
///
/// The canonical field is `name`; the legacy `id` alias is accepted.
#[derive(Debug, Clone, Deserialize)]
struct Manifest {
    #[serde(alias = "id")]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default = "default_skill_type")]
    skill_type: String,
    /// Empty means public; otherwise at least one group must match.
    #[serde(default)]
    access_groups: Vec<String>,
    #[serde(default)]
    tools: Vec<ToolDescriptor>,
}

/// Optional `config.yaml` overlay; only present fields override.
#[derive(Debug, Clone, Default, Deserialize)]
struct ManifestOverride {
    name: Option<String>,
    description: Option<String>,
    version: Option<String>,
    skill_type: Option<String>,
    access_groups: Option<Vec<String>>,
    tools: Option<Vec<ToolDescriptor>>,
}

fn default_version() -> String {
    "0.1".into()
}
fn default_skill_type() -> String {
    "subprocess".into()
}

/// A discovered skill, immutable after startup (tool descriptors may be
/// filled in once by [`SkillRegistry::refresh_tool_descriptors`]).
#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub version: String,
    pub skill_type: String,
    /// Skill directory root.
    pub path: PathBuf,
    /// The executable speaking the JSON-over-stdin/stdout protocol.
    pub entry_script: PathBuf,
    pub access_groups: Vec<String>,
    pub tools: Vec<ToolDescriptor>,
    /// Markdown body of the manifest.
    pub instructions: String,
}

impl Skill {
    /// Whether a caller with `user_groups` may see this skill.
    pub fn accessible_to(&self, user_groups: Option<&[String]>) -> bool {
        if self.access_groups.is_empty() {
            return true;
        }
        user_groups
            .map(|groups| self.access_groups.iter().any(|g| groups.contains(g)))
            .unwrap_or(false)
    }
}

// ── Registry ────────────────────────────────────────────────

/// Owns the name → skill index.  Listing order is deterministic (by
/// name); lookups are O(1).
#[derive(Debug, Default)]
pub struct SkillRegistry {
    skills: HashMap<String, Skill>,
}

impl SkillRegistry {
    /// Walk `base` (depth ≤ 2) and index every well-formed skill
    /// directory, suppressing names in `exclude`.
    ///
    /// Malformed directories are logged and skipped; duplicate skill
    /// names across directories abort startup.
    pub fn discover(base: &Path, exclude: &[String]) -> anyhow::Result<Self> {
        let mut registry = SkillRegistry::default();
        if !base.is_dir() {
            warn!(path = %base.display(), "skills directory does not exist");
            return Ok(registry);
        }

        let mut candidates: Vec<PathBuf> = Vec::new();
        for entry in std::fs::read_dir(base)
            .with_context(|| format!("reading skills dir {}", base.display()))?
        {
            let dir = entry?.path();
            if !dir.is_dir() {
                continue;
            }
            if dir.join("SKILL.md").is_file() {
                candidates.push(dir);
            } else if let Ok(nested) = std::fs::read_dir(&dir) {
                for sub in nested.flatten() {
                    let sub = sub.path();
                    if sub.is_dir() && sub.join("SKILL.md").is_file() {
                        candidates.push(sub);
                    }
                }
            }
        }

        for dir in candidates {
            let skill = match load_skill_dir(&dir) {
                Ok(skill) => skill,
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "skipping malformed skill directory");
                    continue;
                }
            };
            if exclude.iter().any(|x| x == &skill.name) {
                debug!(skill = %skill.name, "skill excluded by configuration");
                continue;
            }
            if let Some(existing) = registry.skills.get(&skill.name) {
                bail!(
                    "duplicate skill name '{}' in {} and {}",
                    skill.name,
                    existing.path.display(),
                    skill.path.display()
                );
            }
            info!(skill = %skill.name, path = %dir.display(), "loaded skill");
            registry.skills.insert(skill.name.clone(), skill);
        }

        Ok(registry)
    }

    /// Skills visible to `user_groups`, sorted by name.
    pub fn list_skills(&self, user_groups: Option<&[String]>) -> Vec<&Skill> {
        let mut skills: Vec<&Skill> = self
            .skills
            .values()
            .filter(|s| s.accessible_to(user_groups))
            .collect();
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        skills
    }

    /// O(1) lookup by name.
    pub fn get_skill(&self, name: &str) -> Option<&Skill> {
        self.skills.get(name)
    }

    /// Newline-delimited `- <name>: <description>` block for the
    /// decomposer prompt.  Byte-stable for identical inputs.
    pub fn skills_description(&self, user_groups: Option<&[String]>) -> String {
        let skills = self.list_skills(user_groups);
        if skills.is_empty() {
            return "No skills available.".to_string();
        }
        skills
            .iter()
            .map(|s| {
                let desc = if s.description.trim().is_empty() {
                    "No description available"
                } else {
                    s.description.trim()
                };
                format!("- {}: {desc}", s.name)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Number of indexed skills.
    pub fn len(&self) -> usize {
        self.skills.len()
    }

    /// `true` when no skills were discovered.
    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    /// Query entry scripts with the `describe` command to fill in tool
    /// descriptors for skills whose manifest declared none.
    ///
    /// Failures are logged and leave the skill without descriptors.
    pub async fn refresh_tool_descriptors(&mut self, executor: &SubprocessExecutor) {
        let pending: Vec<String> = self
            .skills
            .values()
            .filter(|s| s.tools.is_empty())
            .map(|s| s.name.clone())
            .collect();

        for name in pending {
            let Some(skill) = self.skills.get(&name).cloned() else {
                continue;
            };
            let result = match executor
                .execute(
                    &skill,
                    "describe",
                    json!({}),
                    Some(std::time::Duration::from_secs(10)),
                    &CancellationToken::new(),
                )
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    warn!(skill = %name, error = %e, "describe query failed");
                    continue;
                }
            };
            if !result.success {
                warn!(skill = %name, error = ?result.error, "describe query unsuccessful");
                continue;
            }
            let Some(tools) = result.output.get("tools").cloned() else {
                debug!(skill = %name, "describe output carries no tools table");
                continue;
            };
            match serde_json::from_value::<Vec<ToolDescriptor>>(tools) {
                Ok(descriptors) if !descriptors.is_empty() => {
                    info!(skill = %name, tools = descriptors.len(), "tool descriptors refreshed");
                    if let Some(entry) = self.skills.get_mut(&name) {
                        entry.tools = descriptors;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(skill = %name, error = %e, "describe output failed to parse");
                }
            }
        }
    }
}

// ── Manifest loading ─────────────────────────────────────────

/// Parse a `SKILL.md` into `(yaml_front_matter, markdown_body)`.
pub fn parse_manifest(content: &str) -> anyhow::Result<(String, String)> {
    let trimmed = content.trim_start();
    if !trimmed.starts_with("---") {
        bail!("SKILL.md must begin with YAML front-matter (---)")
    }
    let after_open = &trimmed[3..];
    let after_open = after_open.strip_prefix('\n').unwrap_or(after_open);

    let close_pos = after_open
        .find("\n---")
        .context("missing closing --- in SKILL.md front-matter")?;

    let yaml = after_open[..close_pos].to_string();
    let rest = &after_open[close_pos + 4..];
    let body = rest.strip_prefix('\n').unwrap_or(rest).to_string();

    Ok((yaml, body))
}

/// Load one qualifying skill directory.
fn load_skill_dir(dir: &Path) -> anyhow::Result<Skill> {
    // Absolute paths, so spawning with the skill dir as cwd stays sound.
    let dir = &dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    let manifest_path = dir.join("SKILL.md");
    let raw = std::fs::read_to_string(&manifest_path)
        .with_context(|| format!("reading {}", manifest_path.display()))?;
    let (yaml, instructions) =
        parse_manifest(&raw).with_context(|| format!("parsing {}", manifest_path.display()))?;
    let mut manifest: Manifest = serde_yaml::from_str(&yaml)
        .with_context(|| format!("parsing front-matter in {}", manifest_path.display()))?;

    // Optional structured-config overlay.
    let config_path = dir.join("config.yaml");
    if config_path.is_file() {
        let raw = std::fs::read_to_string(&config_path)
            .with_context(|| format!("reading {}", config_path.display()))?;
        let overlay: ManifestOverride = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing {}", config_path.display()))?;
        if let Some(v) = overlay.name {
            manifest.name = v;
        }
        if let Some(v) = overlay.description {
            manifest.description = v;
        }
        if let Some(v) = overlay.version {
            manifest.version = v;
        }
        if let Some(v) = overlay.skill_type {
            manifest.skill_type = v;
        }
        if let Some(v) = overlay.access_groups {
            manifest.access_groups = v;
        }
        if let Some(v) = overlay.tools {
            manifest.tools = v;
        }
    }

    let entry_script = locate_entry_script(dir)?;

    Ok(Skill {
        name: manifest.name,
        description: manifest.description,
        version: manifest.version,
        skill_type: manifest.skill_type,
        path: dir.to_path_buf(),
        entry_script,
        access_groups: manifest.access_groups,
        tools: manifest.tools,
        instructions,
    })
}

/// Find the single `scripts/<something>_skill.<ext>` entry script.
fn locate_entry_script(dir: &Path) -> anyhow::Result<PathBuf> {
    let scripts = dir.join("scripts");
    if !scripts.is_dir() {
        bail!("no scripts/ directory");
    }
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(&scripts)
        .with_context(|| format!("reading {}", scripts.display()))?
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.file_stem()
                    .and_then(|s| s.to_str())
                    .is_some_and(|s| s.ends_with("_skill"))
        })
        .collect();
    match candidates.len() {
        0 => bail!("no *_skill.* entry script in {}", scripts.display()),
        1 => Ok(candidates.remove(0)),
        n => bail!("{n} candidate entry scripts in {}, expected exactly one", scripts.display()),
    }
}
