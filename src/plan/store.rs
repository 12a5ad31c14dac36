//! Anchor-delimited plan file store.
//!
//! The plan file is a single UTF-8 text file designed so that `grep` and
//! stream-edit tooling can locate and mutate individual fields:
//!
//! ```text
//! <<<PLAN:000001>>>
//! @PLAN_ID:6f9c…@
//! @PLAN_NUMBER:000001@
//! …
//! >>>STEPS:000001>>>
//!
//! ---STEP:001:000001---
//! @STEP_NR:1@
//! @SKILL_NAME:calendar-assistant@
//! @STATUS:pending@
//! @RESULT:@
//! ---END_STEP:001:000001---
//! <<<STEPS:000001<<<
//! <<<END_PLAN:000001>>>
//! ```
//!
//! Every anchor is `@KEY:value@`; `@` is reserved and values are
//! sanitized before write.  Mutations are pure in-process substitutions
//! followed by an atomic write-to-temp-then-rename; `create` appends the
//! whole block with a single write call.  All writers serialize behind a
//! mutex, readers go straight to the file.

use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    clamp_result, sanitize_anchor_value, Plan, PlanDraft, PlanStep, PlanSummary, StepStatus,
    MAX_STEP_NR,
};

const RULE: &str =
    "================================================================================";

/// Flat-file store for decomposition plans.  Exclusively owns the file;
/// all mutations go through it.
pub struct PlanStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl PlanStore {
    /// Open (or create) the plan file at `<plans_dir>/<file_name>`.
    pub async fn open(plans_dir: &Path, file_name: &str) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(plans_dir)
            .await
            .with_context(|| format!("create plans dir {}", plans_dir.display()))?;
        let path = plans_dir.join(file_name);

        let store = PlanStore {
            path: path.clone(),
            write_lock: Mutex::new(()),
        };

        if !path.exists() {
            let ts = now_iso8601();
            let header = format!(
                "{RULE}\n                    QUERY DECOMPOSITION PLANS\n{RULE}\n\n\
                 @FILE_CREATED:{ts}@\n\
                 @LAST_UPDATED:{ts}@\n\
                 @TOTAL_PLANS:0@\n\n\
                 This file stores query decomposition plans in a grep-friendly anchor format.\n\
                 Each plan can be easily searched, modified, or have steps added/updated.\n\n\
                 {RULE}\n\n"
            );
            tokio::fs::write(&path, header)
                .await
                .with_context(|| format!("create plan file {}", path.display()))?;
            info!(path = %path.display(), "created plan file");
        }

        Ok(store)
    }

    /// Path of the underlying plan file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current `@TOTAL_PLANS:` header value.
    pub async fn total_plans(&self) -> anyhow::Result<usize> {
        let content = self.read().await?;
        let v = anchor_value(&content, "TOTAL_PLANS")
            .context("plan file header missing @TOTAL_PLANS:@")?;
        v.parse()
            .with_context(|| format!("malformed @TOTAL_PLANS:{v}@"))
    }

    // -- create -------------------------------------------------------------

    /// Append a new plan block and return its `plan_id`.
    ///
    /// The block is written with a single append call; the header's
    /// `TOTAL_PLANS` / `LAST_UPDATED` are refreshed afterwards.
    pub async fn create(
        &self,
        user_query: &str,
        draft: &PlanDraft,
        context: Option<&[(String, String)]>,
    ) -> anyhow::Result<String> {
        let _guard = self.write_lock.lock().await;

        let content = self.read().await?;
        let serial = content.matches("<<<PLAN:").count() + 1;
        let num = format!("{serial:06}");
        let plan_id = uuid::Uuid::new_v4().to_string();
        let ts = now_iso8601();
        let multi_steps = draft.output_steps.len() > 1;

        let mut block = format!("\n<<<PLAN:{num}>>>\n");
        block.push_str(&format!("@PLAN_ID:{plan_id}@\n"));
        block.push_str(&format!("@PLAN_NUMBER:{num}@\n"));
        block.push_str(&format!("@TIMESTAMP:{ts}@\n"));
        block.push_str(&format!("@MULTI_STEPS:{multi_steps}@\n"));
        block.push_str(&format!("@TOTAL_STEPS:{}@\n", draft.output_steps.len()));
        block.push_str(&format!(
            "\n>>>QUERY:{num}>>>\n{user_query}\n<<<QUERY:{num}<<<\n"
        ));

        if let Some(ctx) = context {
            let anchors: Vec<String> = ctx
                .iter()
                .filter(|(_, v)| !v.is_empty())
                .map(|(k, v)| {
                    format!("@{}:{}@\n", k.to_uppercase(), sanitize_anchor_value(v))
                })
                .collect();
            if !anchors.is_empty() {
                block.push_str(&format!("\n>>>CONTEXT:{num}>>>\n"));
                for a in anchors {
                    block.push_str(&a);
                }
                block.push_str(&format!("<<<CONTEXT:{num}<<<\n"));
            }
        }

        block.push_str(&format!("\n>>>STEPS:{num}>>>\n"));
        for step in &draft.output_steps {
            block.push_str(&format_step_block(
                &num,
                step.step_nr,
                &step.skill_name,
                &step.rationale,
                &step.sub_query,
                StepStatus::Pending,
                "",
            ));
        }
        block.push_str(&format!("<<<STEPS:{num}<<<\n"));
        block.push_str(&format!("\n<<<END_PLAN:{num}>>>\n"));
        block.push_str(&format!("\n{RULE}\n"));

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("open plan file {}", self.path.display()))?;
        file.write_all(block.as_bytes())
            .await
            .context("append plan block")?;
        file.flush().await.context("flush plan block")?;
        drop(file);

        // Refresh header counters.
        let mut updated = self.read().await?;
        replace_anchor_value(&mut updated, "LAST_UPDATED", &now_iso8601(), None)?;
        replace_anchor_value(&mut updated, "TOTAL_PLANS", &serial.to_string(), None)?;
        self.write_atomic(&updated).await?;

        info!(plan = %num, plan_id = %plan_id, steps = draft.output_steps.len(), "plan written");
        Ok(plan_id)
    }

    // -- read ---------------------------------------------------------------

    /// Retrieve a plan by id, parsing its entire block.
    pub async fn get(&self, plan_id: &str) -> anyhow::Result<Option<Plan>> {
        let content = self.read().await?;
        let Some((num, body)) = find_plan_body(&content, plan_id) else {
            return Ok(None);
        };
        Ok(Some(parse_plan(plan_id, &num, &content[body])?))
    }

    /// Header metadata of every plan, in file order.
    pub async fn list(&self) -> anyhow::Result<Vec<PlanSummary>> {
        let content = self.read().await?;
        let mut out = Vec::new();
        for (num, body) in scan_blocks(&content) {
            let body = &content[body];
            out.push(PlanSummary {
                plan_number: num.clone(),
                plan_id: anchor_value(body, "PLAN_ID").unwrap_or_default().to_string(),
                timestamp: anchor_value(body, "TIMESTAMP")
                    .unwrap_or_default()
                    .to_string(),
                query: extract_query(body, &num).unwrap_or_default(),
                multi_steps: anchor_value(body, "MULTI_STEPS") == Some("true"),
                total_steps: anchor_value(body, "TOTAL_STEPS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
            });
        }
        Ok(out)
    }

    /// Find plan ids whose stored query matches `text`.
    ///
    /// Case-insensitive substring match unless `exact`.
    pub async fn find_by_query(&self, text: &str, exact: bool) -> anyhow::Result<Vec<String>> {
        let content = self.read().await?;
        let needle = text.to_lowercase();
        let mut out = Vec::new();
        for (num, body) in scan_blocks(&content) {
            let body = &content[body];
            let Some(query) = extract_query(body, &num) else {
                continue;
            };
            let stored = query.to_lowercase();
            let hit = if exact {
                stored == needle
            } else {
                stored.contains(&needle)
            };
            if hit {
                if let Some(id) = anchor_value(body, "PLAN_ID") {
                    out.push(id.to_string());
                }
            }
        }
        Ok(out)
    }

    // -- mutate -------------------------------------------------------------

    /// Rewrite a step's `@STATUS:` (and optionally `@RESULT:`) in place.
    ///
    /// Only the targeted anchor values change; every other byte of the
    /// file is preserved verbatim.
    pub async fn update_step_status(
        &self,
        plan_id: &str,
        step_nr: u32,
        status: StepStatus,
        result: Option<&str>,
    ) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut content = self.read().await?;

        let step = locate_step(&content, plan_id, step_nr)?;
        let span = anchor_value_span(&content, "STATUS", Some(step.clone()))
            .context("step block missing @STATUS:@")?;
        content.replace_range(span, status.as_str());

        if let Some(result) = result {
            // Offsets moved with the status edit; re-locate the step.
            let step = locate_step(&content, plan_id, step_nr)?;
            let span = anchor_value_span(&content, "RESULT", Some(step))
                .context("step block missing @RESULT:@")?;
            content.replace_range(span, &clamp_result(result));
        }

        self.write_atomic(&content).await?;
        debug!(plan_id = %plan_id, step = step_nr, status = %status, "step status updated");
        Ok(())
    }

    /// Append a new step to an existing plan, bumping `@TOTAL_STEPS:`.
    pub async fn add_step(
        &self,
        plan_id: &str,
        skill_name: &str,
        rationale: &str,
        sub_query: &str,
        status: StepStatus,
    ) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut content = self.read().await?;
        let (num, body) = find_plan_body(&content, plan_id)
            .with_context(|| format!("no plan with id {plan_id}"))?;

        let total: u32 = anchor_value(&content[body.clone()], "TOTAL_STEPS")
            .and_then(|v| v.parse().ok())
            .context("plan block missing @TOTAL_STEPS:@")?;
        let new_nr = total + 1;
        if new_nr > MAX_STEP_NR {
            bail!("plan {plan_id} already at the {MAX_STEP_NR}-step ceiling");
        }

        // Insert the new step immediately before the STEPS closer.
        let closer = format!("<<<STEPS:{num}<<<");
        let closer_at = content[body.clone()]
            .find(&closer)
            .map(|i| body.start + i)
            .context("plan block missing steps closer")?;
        let step_block =
            format_step_block(&num, new_nr, skill_name, rationale, sub_query, status, "");
        content.insert_str(closer_at, &step_block);

        // Counters live before the insertion point, so spans are re-found
        // on the mutated content.
        let (_, body) = find_plan_body(&content, plan_id)
            .with_context(|| format!("no plan with id {plan_id}"))?;
        let span = anchor_value_span(&content, "TOTAL_STEPS", Some(body.clone()))
            .context("plan block missing @TOTAL_STEPS:@")?;
        content.replace_range(span, &new_nr.to_string());

        if new_nr > 1 {
            let (_, body) = find_plan_body(&content, plan_id)
                .with_context(|| format!("no plan with id {plan_id}"))?;
            let span = anchor_value_span(&content, "MULTI_STEPS", Some(body))
                .context("plan block missing @MULTI_STEPS:@")?;
            content.replace_range(span, "true");
        }

        replace_anchor_value(&mut content, "LAST_UPDATED", &now_iso8601(), None)?;
        self.write_atomic(&content).await?;
        info!(plan_id = %plan_id, step = new_nr, skill = %skill_name, "step appended");
        Ok(())
    }

    // -- helpers ------------------------------------------------------------

    async fn read(&self) -> anyhow::Result<String> {
        tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("read plan file {}", self.path.display()))
    }

    /// Write the full content to a sibling temp file, then rename over
    /// the plan file.
    async fn write_atomic(&self, content: &str) -> anyhow::Result<()> {
        let mut tmp = self.path.as_os_str().to_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, content)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("rename {} over {}", tmp.display(), self.path.display()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Block formatting / scanning
// ---------------------------------------------------------------------------

fn now_iso8601() -> String {
    chrono::Local::now()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

fn format_step_block(
    num: &str,
    step_nr: u32,
    skill_name: &str,
    rationale: &str,
    sub_query: &str,
    status: StepStatus,
    result: &str,
) -> String {
    let mmm = format!("{step_nr:03}");
    let mut s = format!("\n---STEP:{mmm}:{num}---\n");
    s.push_str(&format!("@STEP_NR:{step_nr}@\n"));
    s.push_str(&format!(
        "@SKILL_NAME:{}@\n",
        sanitize_anchor_value(skill_name)
    ));
    s.push_str(&format!("@RATIONALE:{}@\n", sanitize_anchor_value(rationale)));
    if !sub_query.is_empty() {
        s.push_str(&format!("@SUB_QUERY:{}@\n", sanitize_anchor_value(sub_query)));
    }
    s.push_str(&format!("@STATUS:{status}@\n"));
    s.push_str(&format!("@RESULT:{result}@\n"));
    s.push_str(&format!("---END_STEP:{mmm}:{num}---\n"));
    s
}

/// Scan `<<<PLAN:NNNNNN>>>` … `<<<END_PLAN:NNNNNN>>>` pairs, returning
/// each plan number and the byte range of the block body between the
/// markers.
fn scan_blocks(content: &str) -> Vec<(String, Range<usize>)> {
    const OPEN: &str = "<<<PLAN:";
    let mut out = Vec::new();
    let mut pos = 0;
    while let Some(i) = content[pos..].find(OPEN) {
        let at = pos + i;
        let num_start = at + OPEN.len();
        let Some(num) = content.get(num_start..num_start + 6) else {
            break;
        };
        if !num.bytes().all(|b| b.is_ascii_digit())
            || content.get(num_start + 6..num_start + 9) != Some(">>>")
        {
            pos = num_start;
            continue;
        }
        let body_start = num_start + 9;
        let closer = format!("<<<END_PLAN:{num}>>>");
        let Some(rel) = content[body_start..].find(&closer) else {
            pos = body_start;
            continue;
        };
        let body_end = body_start + rel;
        out.push((num.to_string(), body_start..body_end));
        pos = body_end + closer.len();
    }
    out
}

/// Locate the body range of the plan carrying `plan_id`.
fn find_plan_body(content: &str, plan_id: &str) -> Option<(String, Range<usize>)> {
    let needle = format!("@PLAN_ID:{plan_id}@");
    scan_blocks(content)
        .into_iter()
        .find(|(_, body)| content[body.clone()].contains(&needle))
}

/// Byte range of the step block `step_nr` inside the plan `plan_id`,
/// markers included.
fn locate_step(content: &str, plan_id: &str, step_nr: u32) -> anyhow::Result<Range<usize>> {
    let (num, body) = find_plan_body(content, plan_id)
        .with_context(|| format!("no plan with id {plan_id}"))?;
    let mmm = format!("{step_nr:03}");
    let opener = format!("---STEP:{mmm}:{num}---");
    let closer = format!("---END_STEP:{mmm}:{num}---");
    let start = content[body.clone()]
        .find(&opener)
        .map(|i| body.start + i)
        .with_context(|| format!("plan {plan_id} has no step {step_nr}"))?;
    let end = content[start..body.end]
        .find(&closer)
        .map(|i| start + i + closer.len())
        .with_context(|| format!("step {step_nr} of plan {plan_id} missing end marker"))?;
    Ok(start..end)
}

/// Value of the first `@key:value@` anchor in `hay`.
fn anchor_value<'a>(hay: &'a str, key: &str) -> Option<&'a str> {
    let tag = format!("@{key}:");
    let start = hay.find(&tag)? + tag.len();
    let end = hay[start..].find('@')? + start;
    Some(&hay[start..end])
}

/// Byte range of an anchor's value, optionally restricted to `within`.
fn anchor_value_span(
    content: &str,
    key: &str,
    within: Option<Range<usize>>,
) -> Option<Range<usize>> {
    let range = within.unwrap_or(0..content.len());
    let tag = format!("@{key}:");
    let start = content[range.clone()].find(&tag)? + range.start + tag.len();
    let end = content[start..range.end].find('@')? + start;
    Some(start..end)
}

/// In-place substitution of an anchor value.
fn replace_anchor_value(
    content: &mut String,
    key: &str,
    new_value: &str,
    within: Option<Range<usize>>,
) -> anyhow::Result<()> {
    let span = anchor_value_span(content, key, within)
        .with_context(|| format!("missing @{key}:@ anchor"))?;
    content.replace_range(span, new_value);
    Ok(())
}

/// Raw user query between the `>>>QUERY:` markers.
fn extract_query(body: &str, num: &str) -> Option<String> {
    let open = format!(">>>QUERY:{num}>>>\n");
    let close = format!("\n<<<QUERY:{num}<<<");
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(body[start..end].to_string())
}

fn parse_plan(plan_id: &str, num: &str, body: &str) -> anyhow::Result<Plan> {
    let mut steps = Vec::new();

    let steps_open = format!(">>>STEPS:{num}>>>");
    let steps_close = format!("<<<STEPS:{num}<<<");
    let steps_body = match (body.find(&steps_open), body.find(&steps_close)) {
        (Some(a), Some(b)) if b > a => &body[a + steps_open.len()..b],
        _ => bail!("plan {plan_id} missing steps block"),
    };

    let mut pos = 0;
    const STEP_OPEN: &str = "---STEP:";
    while let Some(i) = steps_body[pos..].find(STEP_OPEN) {
        let at = pos + i;
        let mmm_start = at + STEP_OPEN.len();
        let Some(mmm) = steps_body.get(mmm_start..mmm_start + 3) else {
            break;
        };
        let closer = format!("---END_STEP:{mmm}:{num}---");
        let Some(rel) = steps_body[mmm_start..].find(&closer) else {
            break;
        };
        let step_body = &steps_body[mmm_start..mmm_start + rel];
        steps.push(PlanStep {
            step_nr: anchor_value(step_body, "STEP_NR")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            skill_name: anchor_value(step_body, "SKILL_NAME")
                .unwrap_or("N/A")
                .to_string(),
            rationale: anchor_value(step_body, "RATIONALE")
                .unwrap_or_default()
                .to_string(),
            sub_query: anchor_value(step_body, "SUB_QUERY")
                .unwrap_or_default()
                .to_string(),
            status: StepStatus::parse(anchor_value(step_body, "STATUS").unwrap_or("pending")),
            result: anchor_value(step_body, "RESULT").unwrap_or_default().to_string(),
        });
        pos = mmm_start + rel + closer.len();
    }

    let mut context = Vec::new();
    let ctx_open = format!(">>>CONTEXT:{num}>>>");
    let ctx_close = format!("<<<CONTEXT:{num}<<<");
    if let (Some(a), Some(b)) = (body.find(&ctx_open), body.find(&ctx_close)) {
        if b > a {
            for line in body[a + ctx_open.len()..b].lines() {
                let line = line.trim();
                if let Some(stripped) = line.strip_prefix('@').and_then(|l| l.strip_suffix('@')) {
                    if let Some((k, v)) = stripped.split_once(':') {
                        context.push((k.to_string(), v.to_string()));
                    }
                }
            }
        }
    }

    Ok(Plan {
        plan_id: plan_id.to_string(),
        plan_number: num.to_string(),
        timestamp: anchor_value(body, "TIMESTAMP").unwrap_or_default().to_string(),
        multi_steps: anchor_value(body, "MULTI_STEPS") == Some("true"),
        total_steps: anchor_value(body, "TOTAL_STEPS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        user_query: extract_query(body, num).unwrap_or_default(),
        context,
        steps,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::DraftStep;
    use tempfile::TempDir;

    fn draft(steps: &[(&str, &str, &str)]) -> PlanDraft {
        PlanDraft {
            multi_steps: steps.len() > 1,
            output_steps: steps
                .iter()
                .enumerate()
                .map(|(i, (skill, rationale, sub))| DraftStep {
                    step_nr: (i + 1) as u32,
                    skill_name: skill.to_string(),
                    rationale: rationale.to_string(),
                    sub_query: sub.to_string(),
                })
                .collect(),
        }
    }

    async fn temp_store() -> (TempDir, PlanStore) {
        let dir = TempDir::new().unwrap();
        let store = PlanStore::open(dir.path(), "stepwised_plan.txt").await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn new_file_has_header() {
        let (_dir, store) = temp_store().await;
        let content = std::fs::read_to_string(store.path()).unwrap();
        assert!(content.contains("@FILE_CREATED:"));
        assert!(content.contains("@TOTAL_PLANS:0@"));
        assert_eq!(store.total_plans().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let (_dir, store) = temp_store().await;
        let d = draft(&[(
            "calendar-assistant",
            "User wants to book a calendar event",
            "schedule a meeting tomorrow at 2pm",
        )]);
        let id = store
            .create("schedule a meeting tomorrow at 2pm", &d, None)
            .await
            .unwrap();

        let plan = store.get(&id).await.unwrap().expect("plan present");
        assert_eq!(plan.plan_number, "000001");
        assert_eq!(plan.user_query, "schedule a meeting tomorrow at 2pm");
        assert!(!plan.multi_steps);
        assert_eq!(plan.total_steps, 1);
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].skill_name, "calendar-assistant");
        assert_eq!(plan.steps[0].status, StepStatus::Pending);
        assert_eq!(plan.steps[0].result, "");

        assert_eq!(store.total_plans().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn header_count_matches_plan_markers() {
        let (_dir, store) = temp_store().await;
        for i in 0..3 {
            store
                .create(&format!("query {i}"), &draft(&[("none", "r", "")]), None)
                .await
                .unwrap();
        }
        let content = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(content.matches("<<<PLAN:").count(), 3);
        assert_eq!(store.total_plans().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn update_step_status_touches_only_target_bytes() {
        let (_dir, store) = temp_store().await;
        let d = draft(&[
            ("calendar-assistant", "book it", "book 1 hour tomorrow"),
            ("nvidia-ideagen", "ideas", "generate ideas"),
        ]);
        let id = store.create("book and brainstorm", &d, None).await.unwrap();
        let before = std::fs::read_to_string(store.path()).unwrap();

        store
            .update_step_status(&id, 2, StepStatus::Completed, Some("five ideas generated"))
            .await
            .unwrap();
        let after = std::fs::read_to_string(store.path()).unwrap();

        // The only differences are inside step 002's block.
        let step_open = "---STEP:002:";
        let cut_before = before.find(step_open).unwrap();
        let cut_after = after.find(step_open).unwrap();
        assert_eq!(&before[..cut_before], &after[..cut_after]);
        let end_before = before.find("---END_STEP:002:").unwrap();
        let end_after = after.find("---END_STEP:002:").unwrap();
        assert_eq!(&before[end_before..], &after[end_after..]);

        let plan = store.get(&id).await.unwrap().unwrap();
        assert_eq!(plan.steps[0].status, StepStatus::Pending);
        assert_eq!(plan.steps[1].status, StepStatus::Completed);
        assert_eq!(plan.steps[1].result, "five ideas generated");
    }

    #[tokio::test]
    async fn update_step_status_is_idempotent() {
        let (_dir, store) = temp_store().await;
        let id = store
            .create("q", &draft(&[("none", "r", "s")]), None)
            .await
            .unwrap();
        store
            .update_step_status(&id, 1, StepStatus::Completed, Some("done"))
            .await
            .unwrap();
        let first = std::fs::read_to_string(store.path()).unwrap();
        store
            .update_step_status(&id, 1, StepStatus::Completed, Some("done"))
            .await
            .unwrap();
        let second = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn result_with_at_sign_is_escaped() {
        let (_dir, store) = temp_store().await;
        let id = store
            .create("q", &draft(&[("none", "r", "s")]), None)
            .await
            .unwrap();
        store
            .update_step_status(&id, 1, StepStatus::Failed, Some("mail me @ home\nnow"))
            .await
            .unwrap();
        let plan = store.get(&id).await.unwrap().unwrap();
        assert_eq!(plan.steps[0].result, "mail me (at) home now");
        assert!(!plan.steps[0].result.contains('@'));
    }

    #[tokio::test]
    async fn long_result_is_clamped() {
        let (_dir, store) = temp_store().await;
        let id = store
            .create("q", &draft(&[("none", "r", "s")]), None)
            .await
            .unwrap();
        store
            .update_step_status(&id, 1, StepStatus::Completed, Some(&"y".repeat(800)))
            .await
            .unwrap();
        let plan = store.get(&id).await.unwrap().unwrap();
        assert_eq!(plan.steps[0].result.chars().count(), 501);
        assert!(plan.steps[0].result.ends_with('…'));
    }

    #[tokio::test]
    async fn add_step_bumps_totals_and_multi_flag() {
        let (_dir, store) = temp_store().await;
        let id = store
            .create("q", &draft(&[("calendar-assistant", "r", "s")]), None)
            .await
            .unwrap();

        store
            .add_step(&id, "final_response", "wrap up", "summarize", StepStatus::Pending)
            .await
            .unwrap();

        let plan = store.get(&id).await.unwrap().unwrap();
        assert_eq!(plan.total_steps, 2);
        assert!(plan.multi_steps);
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[1].step_nr, 2);
        assert_eq!(plan.steps[1].skill_name, "final_response");

        // Steps closer still present exactly once for this plan.
        let content = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(content.matches("<<<STEPS:000001<<<").count(), 1);
    }

    #[tokio::test]
    async fn find_by_query_substring_and_exact() {
        let (_dir, store) = temp_store().await;
        let a = store
            .create(
                "schedule a meeting tomorrow",
                &draft(&[("calendar-assistant", "r", "s")]),
                None,
            )
            .await
            .unwrap();
        let _b = store
            .create("generate ideas", &draft(&[("nvidia-ideagen", "r", "s")]), None)
            .await
            .unwrap();

        let hits = store.find_by_query("MEETING", false).await.unwrap();
        assert_eq!(hits, vec![a.clone()]);

        let exact = store
            .find_by_query("schedule a meeting tomorrow", true)
            .await
            .unwrap();
        assert_eq!(exact, vec![a]);

        assert!(store.find_by_query("pizza", false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_returns_file_order_summaries() {
        let (_dir, store) = temp_store().await;
        store
            .create("first", &draft(&[("none", "r", "")]), None)
            .await
            .unwrap();
        store
            .create(
                "second",
                &draft(&[("calendar-assistant", "a", "b"), ("final_response", "c", "d")]),
                None,
            )
            .await
            .unwrap();

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].plan_number, "000001");
        assert_eq!(all[0].query, "first");
        assert!(!all[0].multi_steps);
        assert_eq!(all[1].plan_number, "000002");
        assert_eq!(all[1].total_steps, 2);
        assert!(all[1].multi_steps);
    }

    #[tokio::test]
    async fn context_block_round_trips() {
        let (_dir, store) = temp_store().await;
        let ctx = vec![
            ("memory_summary".to_string(), "likes mornings".to_string()),
            ("history_summary".to_string(), String::new()),
        ];
        let id = store
            .create("q", &draft(&[("none", "r", "")]), Some(&ctx))
            .await
            .unwrap();
        let plan = store.get(&id).await.unwrap().unwrap();
        assert_eq!(
            plan.context,
            vec![("MEMORY_SUMMARY".to_string(), "likes mornings".to_string())]
        );
    }

    #[tokio::test]
    async fn three_digit_step_numbers_round_trip() {
        let (_dir, store) = temp_store().await;
        let steps: Vec<DraftStep> = (1..=12)
            .map(|n| DraftStep {
                step_nr: n,
                skill_name: "shell-commands".into(),
                rationale: format!("step {n}"),
                sub_query: format!("do thing {n}"),
            })
            .collect();
        let d = PlanDraft { multi_steps: true, output_steps: steps };
        let id = store.create("many steps", &d, None).await.unwrap();
        store
            .update_step_status(&id, 11, StepStatus::Completed, Some("ok"))
            .await
            .unwrap();
        let plan = store.get(&id).await.unwrap().unwrap();
        assert_eq!(plan.steps[10].step_nr, 11);
        assert_eq!(plan.steps[10].status, StepStatus::Completed);
        assert_eq!(plan.steps[9].status, StepStatus::Pending);
    }
}
