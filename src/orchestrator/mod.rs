//! Stable-prompt orchestrator.
//!
//! Executes a decomposed plan end-to-end with minimal LM involvement:
//! skill steps run as subprocesses, step outcomes land in the plan file,
//! and the LM is invoked only for synthesis steps.  Every synthesis
//! prompt within a request shares the same byte-identical prefix (the
//! decomposer prompt plus a plan-file reference line) so the LM's
//! prefix cache keeps hitting.

pub mod baseline;
pub mod routing;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::decompose::Decomposer;
use crate::executor::SubprocessExecutor;
use crate::models::{Cancelled, ChatMessage, ChatOptions, LmClient, RetryPolicy};
use crate::plan::store::PlanStore;
use crate::plan::{DraftStep, Plan, StepStatus};
use crate::skills::SkillRegistry;
use crate::utils::json_to_display;

use routing::{infer_command_and_params, RoutingOptions};

/// Structured result of one orchestrated request.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Final reply: the last synthesis result, or joined step summaries.
    pub output: String,
    pub plan_id: String,
    pub step_count: usize,
    pub failed_step_count: usize,
    /// Set when the overall deadline or an explicit cancel fired;
    /// remaining steps stay `pending` in the plan file.
    pub cancelled: bool,
}

/// Drives plan execution against one registry / store / LM triple.
pub struct Orchestrator {
    registry: Arc<SkillRegistry>,
    store: Arc<PlanStore>,
    lm: Arc<dyn LmClient>,
    executor: Arc<SubprocessExecutor>,
    decomposer: Decomposer,
    retry: RetryPolicy,
    routing: RoutingOptions,
    step_timeout: Duration,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<SkillRegistry>,
        store: Arc<PlanStore>,
        lm: Arc<dyn LmClient>,
        executor: Arc<SubprocessExecutor>,
        decomposer: Decomposer,
        routing: RoutingOptions,
        step_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            lm,
            executor,
            decomposer,
            retry: RetryPolicy::default(),
            routing,
            step_timeout,
        }
    }

    /// Override the LM retry policy (shorter delays in tests).
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Execute `user_query` end-to-end.
    ///
    /// `deadline` bounds the whole request; on expiry (or when `cancel`
    /// fires) the in-flight subprocess is terminated, remaining steps
    /// stay `pending`, and the report comes back flagged cancelled.
    pub async fn run(
        &self,
        user_query: &str,
        deadline: Option<Duration>,
        cancel: CancellationToken,
    ) -> anyhow::Result<RunReport> {
        let run_cancel = cancel.child_token();
        let watchdog = deadline.map(|d| {
            let token = run_cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(d).await;
                token.cancel();
            })
        });

        let result = self.run_inner(user_query, &run_cancel).await;

        if let Some(handle) = watchdog {
            handle.abort();
        }
        result
    }

    async fn run_inner(
        &self,
        user_query: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<RunReport> {
        let (draft, plan_id) = self
            .decomposer
            .decompose(self.store.as_ref(), user_query, "", "", cancel)
            .await?;
        info!(plan_id = %plan_id, steps = draft.output_steps.len(), "executing plan");

        let mut failed = 0usize;
        let mut cancelled = false;
        let mut final_reply: Option<String> = None;
        let mut summaries: Vec<String> = Vec::new();

        for step in &draft.output_steps {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let sub_query = if step.sub_query.trim().is_empty() {
                user_query
            } else {
                step.sub_query.as_str()
            };

            self.store
                .update_step_status(&plan_id, step.step_nr, StepStatus::InProgress, None)
                .await?;
            debug!(plan_id = %plan_id, step = step.step_nr, skill = %step.skill_name, "step started");

            let outcome = match step.skill_name.as_str() {
                "chitchat" => {
                    let reply = if sub_query.trim().is_empty() {
                        "Hello! What can I do for you?".to_string()
                    } else {
                        sub_query.to_string()
                    };
                    self.store
                        .update_step_status(
                            &plan_id,
                            step.step_nr,
                            StepStatus::Completed,
                            Some(&reply),
                        )
                        .await?;
                    reply
                }
                "final_response" => {
                    match self.synthesize(user_query, &plan_id, step, sub_query, cancel).await {
                        Ok(content) => {
                            self.store
                                .update_step_status(
                                    &plan_id,
                                    step.step_nr,
                                    StepStatus::Completed,
                                    Some(&content),
                                )
                                .await?;
                            final_reply = Some(content.clone());
                            content
                        }
                        Err(e) if e.downcast_ref::<Cancelled>().is_some() => {
                            cancelled = true;
                            break;
                        }
                        Err(e) => return Err(e),
                    }
                }
                "none" => {
                    let msg =
                        "Error: cannot fulfill this request with the available skills".to_string();
                    failed += 1;
                    self.store
                        .update_step_status(&plan_id, step.step_nr, StepStatus::Failed, Some(&msg))
                        .await?;
                    msg
                }
                skill_name => {
                    match self
                        .run_skill_step(&plan_id, step, skill_name, sub_query, cancel)
                        .await?
                    {
                        SkillStepOutcome::Completed(text) => text,
                        SkillStepOutcome::Failed(text) => {
                            failed += 1;
                            text
                        }
                        SkillStepOutcome::Cancelled => {
                            cancelled = true;
                            break;
                        }
                    }
                }
            };

            summaries.push(format!(
                "Step {} ({}): {}",
                step.step_nr, step.skill_name, outcome
            ));
        }

        let cancelled = cancelled || cancel.is_cancelled();
        let output = final_reply.unwrap_or_else(|| summaries.join("\n"));
        info!(
            plan_id = %plan_id,
            failed,
            cancelled,
            "plan execution finished"
        );

        Ok(RunReport {
            output,
            plan_id,
            step_count: draft.output_steps.len(),
            failed_step_count: failed,
            cancelled,
        })
    }

    /// Synthesis step: constant prompt prefix + plan-file reference,
    /// accumulated step results in the (varying) user suffix.
    async fn synthesize(
        &self,
        user_query: &str,
        plan_id: &str,
        step: &DraftStep,
        sub_query: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        let system = format!(
            "{}\n\nPlan tracking file: {}\nPlan ID: {}\n",
            self.decomposer.request_prompt("", "", user_query),
            self.store.path().display(),
            plan_id,
        );

        let mut user = sub_query.to_string();
        if let Some(plan) = self.store.get(plan_id).await? {
            let results = collect_step_results(&plan, step.step_nr);
            if !results.is_empty() {
                user.push_str("\n\nResults from previous steps:\n");
                user.push_str(&results);
            }
        }

        let messages = vec![
            ChatMessage::new("system", system),
            ChatMessage::new("user", user),
        ];
        let options = ChatOptions::with_cancel(cancel.clone());
        let reply = self.retry.chat(self.lm.as_ref(), &messages, &options).await?;
        Ok(reply.content)
    }

    async fn run_skill_step(
        &self,
        plan_id: &str,
        step: &DraftStep,
        skill_name: &str,
        sub_query: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<SkillStepOutcome> {
        let Some(skill) = self.registry.get_skill(skill_name) else {
            let msg = format!("Error: skill '{skill_name}' is not available");
            warn!(plan_id = %plan_id, step = step.step_nr, skill = %skill_name, "skill not in registry");
            self.store
                .update_step_status(plan_id, step.step_nr, StepStatus::Failed, Some(&msg))
                .await?;
            return Ok(SkillStepOutcome::Failed(msg));
        };

        let (command, parameters) =
            match infer_command_and_params(skill_name, sub_query, &self.routing) {
                Ok(pair) => pair,
                Err(e) => {
                    let msg = format!("Error: {e}");
                    self.store
                        .update_step_status(plan_id, step.step_nr, StepStatus::Failed, Some(&msg))
                        .await?;
                    return Ok(SkillStepOutcome::Failed(msg));
                }
            };

        let result = self
            .executor
            .execute(skill, &command, parameters, Some(self.step_timeout), cancel)
            .await
            .with_context(|| format!("executing skill '{skill_name}'"))?;

        if result.error.as_deref() == Some("cancelled") {
            return Ok(SkillStepOutcome::Cancelled);
        }

        if result.success {
            let text = json_to_display(&result.output);
            self.store
                .update_step_status(plan_id, step.step_nr, StepStatus::Completed, Some(&text))
                .await?;
            Ok(SkillStepOutcome::Completed(text))
        } else {
            let msg = format!(
                "Error: {}",
                result.error.unwrap_or_else(|| "unknown error".to_string())
            );
            self.store
                .update_step_status(plan_id, step.step_nr, StepStatus::Failed, Some(&msg))
                .await?;
            Ok(SkillStepOutcome::Failed(msg))
        }
    }
}

enum SkillStepOutcome {
    Completed(String),
    Failed(String),
    Cancelled,
}

/// Render the recorded results of steps before `current_step_nr` for the
/// synthesis suffix.
fn collect_step_results(plan: &Plan, current_step_nr: u32) -> String {
    plan.steps
        .iter()
        .filter(|s| s.step_nr < current_step_nr && !s.result.is_empty())
        .map(|s| format!("Step {} ({}): {}", s.step_nr, s.skill_name, s.result))
        .collect::<Vec<_>>()
        .join("\n")
}
