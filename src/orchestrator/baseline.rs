//! Baseline orchestrator: the traditional tool-using agent loop.
//!
//! After decomposition the LM sees a system prompt embedding the FULL
//! current plan text (all steps, statuses, results) plus the tool list,
//! regenerated before every call.  Kept as the reference execution
//! policy for prompt-stability comparison: because the plan text
//! changes every turn, the prompt prefix never stays identical and the
//! LM's prefix cache keeps missing.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::decompose::Decomposer;
use crate::executor::SubprocessExecutor;
use crate::models::{
    Cancelled, ChatMessage, ChatOptions, LmClient, RetryPolicy, ToolChatReply,
};
use crate::plan::store::PlanStore;
use crate::plan::{Plan, StepStatus};
use crate::skills::{Skill, SkillRegistry};
use crate::utils::{json_to_display, truncate_str};

use super::RunReport;

/// Hard cap on LM round-trips per request; prevents runaway loops.
pub const DEFAULT_MAX_LM_CALLS: usize = 12;

const PREAMBLE: &str = "You are a helpful assistant that completes the user's request \
using the available tools. Inspect the current plan below, call tools to make progress, \
and reply with plain text once the request is fully handled.";

/// Reference tool-loop orchestrator.
pub struct BaselineOrchestrator {
    registry: Arc<SkillRegistry>,
    store: Arc<PlanStore>,
    lm: Arc<dyn LmClient>,
    executor: Arc<SubprocessExecutor>,
    decomposer: Decomposer,
    retry: RetryPolicy,
    user_groups: Option<Vec<String>>,
    max_lm_calls: usize,
    step_timeout: Duration,
}

impl BaselineOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<SkillRegistry>,
        store: Arc<PlanStore>,
        lm: Arc<dyn LmClient>,
        executor: Arc<SubprocessExecutor>,
        decomposer: Decomposer,
        user_groups: Option<Vec<String>>,
        max_lm_calls: usize,
        step_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            lm,
            executor,
            decomposer,
            retry: RetryPolicy::default(),
            user_groups,
            max_lm_calls: max_lm_calls.max(1),
            step_timeout,
        }
    }

    /// Override the LM retry policy (shorter delays in tests).
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run the tool loop for `user_query`.
    pub async fn run(
        &self,
        user_query: &str,
        cancel: CancellationToken,
    ) -> anyhow::Result<RunReport> {
        let (draft, plan_id) = self
            .decomposer
            .decompose(self.store.as_ref(), user_query, "", "", &cancel)
            .await?;
        info!(plan_id = %plan_id, steps = draft.output_steps.len(), "baseline loop starting");

        let tools = self.build_tool_defs();
        let mut messages = vec![
            ChatMessage::new("system", String::new()),
            ChatMessage::new("user", user_query.to_string()),
        ];
        let options = ChatOptions::with_cancel(cancel.clone());

        let mut final_text: Option<String> = None;
        let mut cancelled = false;
        let mut lm_calls = 0usize;

        while lm_calls < self.max_lm_calls {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            // Re-inject the full current plan text each turn.
            let plan = self.store.get(&plan_id).await?;
            messages[0] = ChatMessage::new("system", self.system_prompt(plan.as_ref()));

            let reply = match self
                .retry
                .chat_with_tools(self.lm.as_ref(), &messages, &tools, &options)
                .await
            {
                Ok(reply) => reply,
                Err(e) if e.downcast_ref::<Cancelled>().is_some() => {
                    cancelled = true;
                    break;
                }
                Err(e) => return Err(e),
            };
            lm_calls += 1;

            match reply {
                ToolChatReply::Final(r) => {
                    final_text = Some(r.content);
                    break;
                }
                ToolChatReply::ToolCalls(calls) => {
                    // Echo the assistant's tool_calls turn.
                    let call_entries: Vec<(String, String, String)> = calls
                        .iter()
                        .map(|c| {
                            let id = if c.id.is_empty() {
                                format!("call_{}", uuid::Uuid::new_v4().simple())
                            } else {
                                c.id.clone()
                            };
                            (id, c.name.clone(), c.arguments.clone())
                        })
                        .collect();
                    let tc_json: Vec<Value> = call_entries
                        .iter()
                        .map(|(id, name, args)| {
                            json!({
                                "id": id,
                                "type": "function",
                                "function": { "name": name, "arguments": args }
                            })
                        })
                        .collect();
                    messages.push(ChatMessage {
                        role: "assistant".into(),
                        content: String::new(),
                        tool_calls: Some(tc_json),
                        tool_call_id: None,
                    });

                    for (id, name, arguments) in call_entries {
                        let result_json = self
                            .dispatch_tool_call(&plan_id, &name, &arguments, &cancel)
                            .await?;
                        messages.push(ChatMessage {
                            role: "tool".into(),
                            content: result_json,
                            tool_calls: None,
                            tool_call_id: Some(id),
                        });
                    }
                }
            }
        }

        // Close out a pending synthesis step with the final reply.
        if let Some(ref text) = final_text {
            if let Some(plan) = self.store.get(&plan_id).await? {
                if let Some(step) = plan
                    .steps
                    .iter()
                    .find(|s| s.skill_name == "final_response" && s.status == StepStatus::Pending)
                {
                    self.store
                        .update_step_status(
                            &plan_id,
                            step.step_nr,
                            StepStatus::Completed,
                            Some(text),
                        )
                        .await?;
                }
            }
        }

        let failed_step_count = match self.store.get(&plan_id).await? {
            Some(plan) => plan
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Failed)
                .count(),
            None => 0,
        };

        let output = final_text
            .unwrap_or_else(|| format!("[tool loop exhausted after {lm_calls} model calls]"));
        info!(plan_id = %plan_id, lm_calls, cancelled, "baseline loop finished");

        Ok(RunReport {
            output,
            plan_id,
            step_count: draft.output_steps.len(),
            failed_step_count,
            cancelled: cancelled || cancel.is_cancelled(),
        })
    }

    fn system_prompt(&self, plan: Option<&Plan>) -> String {
        let plan_text = plan.map(format_plan_text).unwrap_or_default();
        format!("{PREAMBLE}\n{plan_text}")
    }

    /// One function definition per tool descriptor; skills without
    /// descriptors get a single query-shaped tool under the skill name.
    fn build_tool_defs(&self) -> Vec<Value> {
        let mut defs = Vec::new();
        for skill in self.registry.list_skills(self.user_groups.as_deref()) {
            if skill.tools.is_empty() {
                defs.push(json!({
                    "name": skill.name,
                    "description": skill.description,
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "query": { "type": "string", "description": "natural language request" }
                        },
                        "required": ["query"]
                    }
                }));
            } else {
                for tool in &skill.tools {
                    defs.push(json!({
                        "name": format!("{}__{}", skill.name, tool.name),
                        "description": format!("{}: {}", skill.name, tool.description),
                        "parameters": tool.parameters.clone(),
                    }));
                }
            }
        }
        defs
    }

    /// Resolve `tool_name` back to a registry skill and command.
    fn resolve_call(&self, tool_name: &str) -> Option<(&Skill, String)> {
        if let Some((skill_name, command)) = tool_name.split_once("__") {
            self.registry
                .get_skill(skill_name)
                .map(|s| (s, command.to_string()))
        } else {
            self.registry
                .get_skill(tool_name)
                .map(|s| (s, tool_name.replace('-', "_")))
        }
    }

    /// Run one tool call, record it on the plan, and return the JSON
    /// string appended to the message trail.  Resolution failures are
    /// fed back to the model as error data.
    async fn dispatch_tool_call(
        &self,
        plan_id: &str,
        tool_name: &str,
        arguments: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        let Some((skill, command)) = self.resolve_call(tool_name) else {
            warn!(tool = %tool_name, "model requested unknown tool");
            return Ok(json!({ "error": format!("unknown tool '{tool_name}'") }).to_string());
        };

        let parameters: Value = serde_json::from_str(arguments).unwrap_or_else(|_| json!({}));
        debug!(tool = %tool_name, command = %command, "dispatching tool call");

        let result = self
            .executor
            .execute(skill, &command, parameters, Some(self.step_timeout), cancel)
            .await?;

        let result_text = if result.success {
            json_to_display(&result.output)
        } else {
            format!(
                "Error: {}",
                result.error.clone().unwrap_or_else(|| "unknown error".into())
            )
        };
        self.record_on_plan(plan_id, &skill.name, result.success, &result_text)
            .await?;

        Ok(if result.success {
            serde_json::to_string(&result.output)?
        } else {
            json!({ "error": result_text }).to_string()
        })
    }

    /// Mark the first matching pending step, or append a new one when
    /// the model called a tool the plan never anticipated.
    async fn record_on_plan(
        &self,
        plan_id: &str,
        skill_name: &str,
        success: bool,
        result_text: &str,
    ) -> anyhow::Result<()> {
        let status = if success { StepStatus::Completed } else { StepStatus::Failed };
        let Some(plan) = self.store.get(plan_id).await? else {
            return Ok(());
        };

        if let Some(step) = plan
            .steps
            .iter()
            .find(|s| s.skill_name == skill_name && s.status == StepStatus::Pending)
        {
            self.store
                .update_step_status(plan_id, step.step_nr, status, Some(result_text))
                .await?;
            return Ok(());
        }

        self.store
            .add_step(
                plan_id,
                skill_name,
                "Tool call made by the model",
                "",
                StepStatus::Pending,
            )
            .await?;
        let new_nr = plan.total_steps as u32 + 1;
        self.store
            .update_step_status(plan_id, new_nr, status, Some(result_text))
            .await?;
        Ok(())
    }
}

/// Render a plan the way the baseline system prompt embeds it.
fn format_plan_text(plan: &Plan) -> String {
    let mut text = format!("\n=== CURRENT PLAN ({} steps) ===\n", plan.steps.len());
    for step in &plan.steps {
        text.push_str(&format!("\nStep {}: {}\n", step.step_nr, step.skill_name));
        text.push_str(&format!("  Rationale: {}\n", step.rationale));
        text.push_str(&format!("  Sub-query: {}\n", step.sub_query));
        text.push_str(&format!("  Status: {}\n", step.status));
        if !step.result.is_empty() {
            text.push_str(&format!("  Result: {}\n", truncate_str(&step.result, 500)));
        }
    }
    text.push_str("\n=== END PLAN ===\n");
    text
}
