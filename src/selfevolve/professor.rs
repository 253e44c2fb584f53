//! Professor orchestrator: delegation to graduate specialists through
//! structured tool calls.
//!
//! The professor is a generator whose output is produced indirectly: it
//! presents the problem to the provider with a single registered tool
//! (`consult_graduate_specialist`), runs each requested consultation as its
//! own specialist Self-Evolve loop, and synthesizes the aggregate into a
//! final answer.  Providers without native function calling are supported
//! through a relaxed textual parse of the response.
//!
//! Specialists are created per consultation and dropped after synthesis;
//! nothing in the professor retains them, so there is no reference cycle
//! between the professor and the engines it spawns.

use crate::selfevolve::agent::{
    context_keys, Agent, AgentContext, AgentError, AgentMetadata, AgentResult, SpecialistAgent,
};
use crate::selfevolve::config::Settings;
use crate::selfevolve::engine::{extract_answer_tag, Problem, SelfEvolve, Solution};
use crate::selfevolve::evaluator::EvaluatorAgent;
use crate::selfevolve::prompts;
use crate::selfevolve::provider::{CompletionOptions, Provider, ToolSpec};
use crate::selfevolve::providers::lenient::{find_braced_object, parse_relaxed_str};
use crate::selfevolve::refiner::RefinerAgent;
use crate::selfevolve::store::JobStore;
use async_trait::async_trait;
use lazy_static::lazy_static;
use log::{error, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// The single tool the professor registers with the provider.
pub const CONSULT_TOOL_NAME: &str = "consult_graduate_specialist";

lazy_static! {
    static ref CALL_LINE_RE: Regex =
        Regex::new(r"consult_graduate_specialist\s*\((.*)\)").unwrap();
    static ref FENCE_RE: Regex = Regex::new(r"```(?:json)?[ \t]*\n((?s).*?)```").unwrap();
    static ref SLUG_RE: Regex = Regex::new(r"[^a-z0-9_]+").unwrap();
}

/// Per-iteration projection of a specialist run, for UI display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationSummary {
    /// One-based iteration index.
    pub iteration: usize,
    /// Generator reasoning summary for the iteration.
    #[serde(default)]
    pub reasoning_summary: String,
    /// Evaluator reasoning summary for the iteration.
    #[serde(default)]
    pub evaluator_reasoning_summary: String,
    /// Refiner reasoning summary for the iteration.
    #[serde(default)]
    pub refiner_reasoning_summary: String,
    /// Reasoning tokens across all three roles.
    #[serde(default)]
    pub reasoning_tokens: usize,
    /// The iteration's answer; truncated except for the final iteration.
    #[serde(default)]
    pub answer: String,
    /// Evaluator feedback for the iteration.
    #[serde(default)]
    pub evaluation_feedback: String,
}

/// The outcome of a single specialist consultation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialistConsultation {
    /// Specialization tag the professor requested.
    pub specialization: String,
    /// Task text delegated to the specialist.
    pub task: String,
    /// Context the professor forwarded.
    #[serde(default)]
    pub context: String,
    /// Constraints the specialist had to honour.
    #[serde(default)]
    pub constraints: String,
    /// The full memorandum sent as the specialist's problem statement.
    #[serde(default)]
    pub enhanced_task: String,
    /// The specialist's full solution, absent when the consultation failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution: Option<Solution>,
    /// The consultation output text (solution output, or a failure notice).
    pub output: String,
    /// Content between answer tags in the final answer, or the full answer
    /// when no tags were present.
    #[serde(default)]
    pub final_answer_value: String,
    /// Evaluator feedback from the specialist's last iteration.
    #[serde(default)]
    pub final_evaluation: String,
    /// Formatted block for embedding into the professor's next prompt.
    #[serde(default)]
    pub formatted_result: String,
    /// Iterations the specialist performed.
    #[serde(default)]
    pub iterations: usize,
    /// Total tokens consumed by the specialist run.
    #[serde(default)]
    pub total_tokens: usize,
    /// Reasoning tokens consumed by the specialist run.
    #[serde(default)]
    pub reasoning_tokens: usize,
    /// Whether the specialist run converged.
    #[serde(default)]
    pub converged: bool,
    /// Per-iteration projections for UI display.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub session_details: Vec<IterationSummary>,
    /// Context-pressure flag propagated from the specialist run.
    #[serde(default)]
    pub context_truncated: bool,
    /// Error text when the consultation failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Phase of a professor run, for progress reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsultationPhase {
    /// Initial tool-call analysis of the problem.
    Analysis,
    /// Sequential specialist consultations.
    Consultations,
    /// Synthesis of the aggregate.
    Synthesis,
}

/// Progress datum emitted during a professor run.
#[derive(Debug, Clone)]
pub struct ConsultationUpdate {
    /// Current phase.
    pub phase: ConsultationPhase,
    /// Fraction of the current phase completed, in `[0, 1]`.
    pub fraction: f64,
    /// Human-readable detail line.
    pub detail: String,
    /// Reasoning tokens observed so far, when freshly updated.
    pub reasoning_tokens: Option<usize>,
}

/// Progress callback for professor runs.
pub type ConsultationProgress = Arc<dyn Fn(&ConsultationUpdate) + Send + Sync>;

/// Deterministic job id for a specialist run under `parent_job_id`.
///
/// Pure in its inputs: equal `{parent, specialization, task}` triples yield
/// equal ids, so retries of the same consultation reuse the same lock
/// namespace while never colliding with the parent's.
pub fn derive_specialist_job_id(parent_job_id: &str, specialization: &str, task: &str) -> String {
    let slug = SLUG_RE
        .replace_all(&specialization.to_lowercase().replace(' ', "_"), "")
        .into_owned();
    let mut hasher = Sha256::new();
    hasher.update(task.as_bytes());
    let digest = hasher.finalize();
    let hash8: String = digest[..4].iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}:spec:{}:{}", parent_job_id, slug, hash8)
}

/// Normalised four-field consultation request.
#[derive(Debug, Clone)]
struct NormalizedCall {
    specialization: String,
    specific_task: String,
    context_for_specialist: String,
    problem_constraints: String,
}

/// The professor agent.
pub struct ProfessorAgent {
    provider: Arc<dyn Provider>,
    system_prompt: String,
    temperature: f32,
    settings: Settings,
    parent_job_id: Option<String>,
    store: Option<Arc<dyn JobStore>>,
    progress: Option<ConsultationProgress>,
}

impl ProfessorAgent {
    /// Create a professor over the given provider with default settings.
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            system_prompt: prompts::professor_system_prompt(),
            temperature: 0.7,
            settings: Settings::default(),
            parent_job_id: None,
            store: None,
            progress: None,
        }
    }

    /// Replace the settings used for specialist runs (builder pattern).
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Bind the parent job id and store so specialist runs persist partial
    /// results under derived child ids (builder pattern).
    pub fn with_job_binding(mut self, job_id: impl Into<String>, store: Arc<dyn JobStore>) -> Self {
        self.parent_job_id = Some(job_id.into());
        self.store = Some(store);
        self
    }

    /// Attach a progress callback (builder pattern).
    pub fn with_progress(mut self, progress: ConsultationProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Override the sampling temperature (builder pattern).
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// The tool specification registered with the provider.
    pub fn specialist_tool() -> ToolSpec {
        ToolSpec {
            name: CONSULT_TOOL_NAME.to_string(),
            description: "Delegate a well-scoped task to a graduate specialist with the named \
                          expertise. The specialist solves it independently and reports back."
                .to_string(),
            parameters_schema: json!({
                "type": "object",
                "properties": {
                    "specialization": {
                        "type": "string",
                        "description": "Field of expertise required, e.g. 'number theory'"
                    },
                    "specific_task": {
                        "type": "string",
                        "description": "The exact task the specialist must complete"
                    },
                    "context_for_specialist": {
                        "type": "string",
                        "description": "Background the specialist needs"
                    },
                    "problem_constraints": {
                        "type": "string",
                        "description": "Constraints the specialist must honour"
                    }
                },
                "required": [
                    "specialization",
                    "specific_task",
                    "context_for_specialist",
                    "problem_constraints"
                ]
            }),
            strict: true,
        }
    }

    fn report(&self, phase: ConsultationPhase, fraction: f64, detail: String, reasoning: Option<usize>) {
        if let Some(progress) = &self.progress {
            progress(&ConsultationUpdate {
                phase,
                fraction: fraction.max(0.0).min(1.0),
                detail,
                reasoning_tokens: reasoning,
            });
        }
    }

    /// Map the many argument shapes models produce onto the four-field
    /// schema, accepting the common aliases.
    fn normalize_args(raw: &Value, global_constraints: &str) -> Option<NormalizedCall> {
        let obj = raw.as_object()?;
        let get = |keys: &[&str]| -> String {
            for key in keys {
                if let Some(v) = obj.get(*key).and_then(|v| v.as_str()) {
                    if !v.trim().is_empty() {
                        return v.trim().to_string();
                    }
                }
            }
            String::new()
        };

        let specialization = {
            let s = get(&["specialization", "expertise", "domain"]);
            if s.is_empty() {
                "general".to_string()
            } else {
                s
            }
        };
        let specific_task = get(&["specific_task", "task", "task_description", "query"]);
        let context_for_specialist = get(&["context_for_specialist", "query"]);
        let problem_constraints = {
            let c = get(&["problem_constraints", "verification_requirements"]);
            if c.is_empty() {
                global_constraints.to_string()
            } else {
                c
            }
        };

        Some(NormalizedCall {
            specialization,
            specific_task,
            context_for_specialist,
            problem_constraints,
        })
    }

    /// Pull consultation argument objects out of an arbitrary JSON value:
    /// direct argument maps, `{tool|function|name, arguments|parameters}`
    /// wrappers, and nested `consultations`/`calls` arrays.
    fn collect_calls_from_value(value: &Value) -> Vec<Value> {
        match value {
            Value::Array(items) => items
                .iter()
                .flat_map(Self::collect_calls_from_value)
                .collect(),
            Value::Object(obj) => {
                for key in &["consultations", "calls"] {
                    if let Some(nested) = obj.get(*key) {
                        return Self::collect_calls_from_value(nested);
                    }
                }

                let named_tool = ["tool", "function", "name"].iter().any(|key| {
                    obj.get(*key)
                        .and_then(|v| v.as_str())
                        .map(|s| s == CONSULT_TOOL_NAME)
                        .unwrap_or(false)
                }) || obj
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .and_then(|v| v.as_str())
                    .map(|s| s == CONSULT_TOOL_NAME)
                    .unwrap_or(false);

                if named_tool {
                    let args = obj
                        .get("arguments")
                        .or_else(|| obj.get("parameters"))
                        .or_else(|| obj.get("args"))
                        .or_else(|| obj.get("function").and_then(|f| f.get("arguments")));
                    if let Some(args) = args {
                        if args.is_object() {
                            return vec![args.clone()];
                        }
                        if let Some(s) = args.as_str() {
                            if let (Some(parsed), _) = parse_relaxed_str(s) {
                                return vec![parsed];
                            }
                        }
                    }
                    return Vec::new();
                }

                let looks_like_args = [
                    "specialization",
                    "expertise",
                    "domain",
                    "specific_task",
                    "task",
                    "task_description",
                ]
                .iter()
                .any(|key| obj.contains_key(*key));
                if looks_like_args {
                    vec![value.clone()]
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    /// Relaxed textual extraction of consultation calls, used when the
    /// provider did not return structured tool calls.
    fn parse_text_consultations(text: &str) -> Vec<Value> {
        let mut calls = Vec::new();

        // One-line call syntax: consult_graduate_specialist({...})
        for line in text.lines() {
            if let Some(caps) = CALL_LINE_RE.captures(line.trim()) {
                if let (Some(parsed), strategy) = parse_relaxed_str(&caps[1]) {
                    info!("Detected specialist call in text (strategy: {})", strategy);
                    calls.push(parsed);
                }
            }
        }

        // Whole response as a JSON document (array, wrapper object, or
        // nested consultations/calls).
        if calls.is_empty() {
            if let Ok(doc) = serde_json::from_str::<Value>(text.trim()) {
                calls = Self::collect_calls_from_value(&doc);
            }
        }

        // Fenced code blocks.
        if calls.is_empty() {
            for caps in FENCE_RE.captures_iter(text) {
                let block = caps[1].trim();
                if let Ok(doc) = serde_json::from_str::<Value>(block) {
                    calls.extend(Self::collect_calls_from_value(&doc));
                } else if let (Some(parsed), _) = parse_relaxed_str(block) {
                    calls.extend(Self::collect_calls_from_value(&parsed));
                }
            }
        }

        // Brace-matched JSON adjacent to a tool-name mention.
        if calls.is_empty() {
            let mut search = 0usize;
            while let Some(pos) = text[search..].find(CONSULT_TOOL_NAME) {
                let anchor = search + pos;
                let after = anchor + CONSULT_TOOL_NAME.len();
                match find_braced_object(text, after) {
                    Some((start, end)) => {
                        if let (Some(parsed), _) = parse_relaxed_str(&text[start..end]) {
                            calls.extend(Self::collect_calls_from_value(&parsed));
                        }
                        search = end;
                    }
                    None => search = after,
                }
            }
        }

        if calls.is_empty() && text.contains(CONSULT_TOOL_NAME) {
            info!("Saw a consult_graduate_specialist mention but no parsable arguments");
        }
        calls
    }

    async fn execute_consultation(
        &self,
        call: &NormalizedCall,
        original_problem: &str,
        index: usize,
        total: usize,
    ) -> SpecialistConsultation {
        let reasoning_context = prompts::build_reasoning_context(
            original_problem,
            &call.context_for_specialist,
            &call.problem_constraints,
        );
        let memo =
            prompts::build_specialist_memo(&call.specialization, &call.specific_task, &reasoning_context);

        info!(
            "Consulting {} specialist for task: {}",
            call.specialization,
            call.specific_task.chars().take(100).collect::<String>()
        );

        let specialist = SpecialistAgent::new(call.specialization.clone(), self.provider.clone());
        let evaluator = EvaluatorAgent::with_stop_token(
            self.provider.clone(),
            self.settings.stop_token.clone(),
        );
        let refiner = RefinerAgent::new(self.provider.clone());

        let mut engine = SelfEvolve::new(Arc::new(specialist), Arc::new(evaluator), Arc::new(refiner))
            .with_settings(self.settings.clone())
            .with_max_iters(self.settings.specialist_max_iters);

        if let (Some(parent), Some(store)) = (&self.parent_job_id, &self.store) {
            let child_id =
                derive_specialist_job_id(parent, &call.specialization, &call.specific_task);
            engine = engine.with_job_binding(child_id, store.clone());
        }

        if let Some(progress) = &self.progress {
            let progress = progress.clone();
            let specialization = call.specialization.clone();
            engine = engine.with_progress(Arc::new(move |current, max, phase| {
                let sub = if max > 0 {
                    (current.saturating_sub(1)) as f64 / max as f64
                } else {
                    0.0
                };
                let overall = (index as f64 + sub) / total.max(1) as f64;
                progress(&ConsultationUpdate {
                    phase: ConsultationPhase::Consultations,
                    fraction: overall,
                    detail: format!(
                        "Specialist {}/{} ({}): {}",
                        index + 1,
                        total,
                        specialization,
                        phase
                    ),
                    reasoning_tokens: None,
                });
            }));
        }

        let mut problem = Problem::new(memo.clone())
            .with_metadata("specialization", call.specialization.clone())
            .with_metadata("from_professor", "true");
        if !call.context_for_specialist.is_empty() {
            problem = problem.with_context(call.context_for_specialist.clone());
        }
        if !call.problem_constraints.is_empty() {
            problem = problem.with_constraints(call.problem_constraints.clone());
        }

        match engine.solve(&problem).await {
            Ok(solution) => self.consultation_from_solution(call, memo, solution),
            Err(e) => {
                error!("Specialist consultation failed: {}", e);
                SpecialistConsultation {
                    specialization: call.specialization.clone(),
                    task: call.specific_task.clone(),
                    context: call.context_for_specialist.clone(),
                    constraints: call.problem_constraints.clone(),
                    enhanced_task: memo,
                    solution: None,
                    output: format!("Specialist consultation failed: {}", e),
                    final_answer_value: String::new(),
                    final_evaluation: String::new(),
                    formatted_result: format!(
                        "SPECIALIST CONSULTATION — {}\nTask: {}\n\nFAILED: {}",
                        call.specialization, call.specific_task, e
                    ),
                    iterations: 0,
                    total_tokens: 0,
                    reasoning_tokens: 0,
                    converged: false,
                    session_details: Vec::new(),
                    context_truncated: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    fn consultation_from_solution(
        &self,
        call: &NormalizedCall,
        memo: String,
        solution: Solution,
    ) -> SpecialistConsultation {
        let final_answer = solution.output.clone();
        let final_answer_value = extract_answer_tag(&final_answer, &self.settings.answer_tag)
            .unwrap_or_else(|| final_answer.clone());
        let final_evaluation = solution
            .evolution_history
            .last()
            .map(|r| r.feedback.clone())
            .unwrap_or_else(|| "Evaluation completed successfully.".to_string());

        let history_len = solution.evolution_history.len();
        let mut reasoning_section = String::new();
        let mut session_details = Vec::with_capacity(history_len);
        if history_len > 0 {
            reasoning_section.push_str("\n\nCOMPLETE REASONING PROCESS FROM SPECIALIST:\n");
        }
        for (i, record) in solution.evolution_history.iter().enumerate() {
            let is_final = i + 1 == history_len;
            reasoning_section.push_str(&format!("\n--- Iteration {} Reasoning ---\n", i + 1));
            if is_final && !record.output.is_empty() {
                reasoning_section
                    .push_str(&format!("Final Specialist Answer:\n{}\n\n", record.output));
            }
            let generator_reasoning = record
                .metadata
                .generator
                .reasoning_summary
                .clone()
                .unwrap_or_default();
            let evaluator_reasoning = record
                .metadata
                .evaluator
                .reasoning_summary
                .clone()
                .unwrap_or_default();
            let refiner_reasoning = record
                .metadata
                .refiner
                .as_ref()
                .and_then(|r| r.reasoning_summary.clone())
                .unwrap_or_default();
            if !generator_reasoning.is_empty() {
                reasoning_section
                    .push_str(&format!("Generator Reasoning:\n{}\n\n", generator_reasoning));
            }
            if !evaluator_reasoning.is_empty() {
                reasoning_section
                    .push_str(&format!("Evaluator Reasoning:\n{}\n\n", evaluator_reasoning));
            }
            if !record.feedback.is_empty() {
                reasoning_section
                    .push_str(&format!("Evaluator Feedback:\n{}\n\n", record.feedback));
            }
            if !refiner_reasoning.is_empty() {
                reasoning_section
                    .push_str(&format!("Prompt Refiner Reasoning:\n{}\n\n", refiner_reasoning));
            }

            let answer = if is_final {
                record.output.clone()
            } else {
                let truncated: String = record.output.chars().take(100).collect();
                if record.output.chars().count() > 100 {
                    format!("{}...", truncated)
                } else {
                    truncated
                }
            };
            session_details.push(IterationSummary {
                iteration: i + 1,
                reasoning_summary: generator_reasoning,
                evaluator_reasoning_summary: evaluator_reasoning,
                refiner_reasoning_summary: refiner_reasoning,
                reasoning_tokens: record.metadata.generator.reasoning_tokens
                    + record.metadata.evaluator.reasoning_tokens
                    + record
                        .metadata
                        .refiner
                        .as_ref()
                        .map(|r| r.reasoning_tokens)
                        .unwrap_or(0),
                answer,
                evaluation_feedback: record.feedback.clone(),
            });
        }

        let formatted_result = prompts::build_consultation_block(
            &call.specialization,
            &call.specific_task,
            &final_answer,
            solution.iterations,
            &final_evaluation,
            &reasoning_section,
        );

        SpecialistConsultation {
            specialization: call.specialization.clone(),
            task: call.specific_task.clone(),
            context: call.context_for_specialist.clone(),
            constraints: call.problem_constraints.clone(),
            enhanced_task: memo,
            output: solution.output.clone(),
            final_answer_value,
            final_evaluation,
            formatted_result,
            iterations: solution.iterations,
            total_tokens: solution.total_tokens,
            reasoning_tokens: solution.metadata.reasoning_tokens,
            converged: solution.metadata.converged,
            session_details,
            context_truncated: solution.metadata.context_truncated,
            error: None,
            solution: Some(solution),
        }
    }

    /// Plain completion on the original problem, used when delegation
    /// produced nothing usable.  The result carries no specialist state:
    /// the consultation count is zero even if consultations were attempted
    /// and failed on the way here.
    async fn plain_fallback(
        &self,
        question: &str,
        error_text: Option<String>,
    ) -> Result<AgentResult, AgentError> {
        let fallback_prompt = format!("Analyze and provide solution for: {}", question);
        let output = self
            .provider
            .complete(
                &fallback_prompt,
                &self.system_prompt,
                self.temperature,
                &CompletionOptions::default(),
            )
            .await?;
        let tokens_used =
            self.provider.count_tokens(&fallback_prompt) + self.provider.count_tokens(&output);
        Ok(AgentResult {
            output,
            feedback: None,
            metadata: AgentMetadata {
                fallback: true,
                error: error_text,
                ..Default::default()
            },
            tokens_used,
        })
    }
}

#[async_trait]
impl Agent for ProfessorAgent {
    fn role(&self) -> &str {
        "professor"
    }

    async fn run(&self, context: &AgentContext) -> Result<AgentResult, AgentError> {
        info!(
            "Professor analyzing problem: {}",
            context.prompt.chars().take(100).collect::<String>()
        );

        let constraints = context.extra(context_keys::CONSTRAINTS).unwrap_or("");
        let context_text = context.extra(context_keys::CONTEXT).unwrap_or("");
        let initial_prompt =
            prompts::build_analysis_prompt(&context.prompt, context_text, constraints);

        let response = match self
            .provider
            .complete_with_functions(
                &initial_prompt,
                &self.system_prompt,
                self.temperature,
                &[Self::specialist_tool()],
            )
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!("Professor analysis failed: {}; falling back to plain completion", e);
                return self.plain_fallback(&context.prompt, Some(e.to_string())).await;
            }
        };

        let mut reasoning_tokens = self.provider.last_reasoning_tokens().await;
        let reasoning_summary = self.provider.last_reasoning_summary().await;
        self.report(
            ConsultationPhase::Analysis,
            1.0,
            "Professor analysis complete".to_string(),
            if reasoning_tokens > 0 {
                Some(reasoning_tokens)
            } else {
                None
            },
        );

        let mut tokens_used = self.provider.count_tokens(&initial_prompt)
            + self.provider.count_tokens(&response.content);

        // Collect pending consultation requests: structured calls first,
        // then the relaxed textual parse.
        let mut pending: Vec<Value> = response
            .function_calls
            .iter()
            .filter(|call| call.name == CONSULT_TOOL_NAME && call.arguments.is_object())
            .map(|call| call.arguments.clone())
            .collect();
        if pending.is_empty() && !response.content.is_empty() {
            pending = Self::parse_text_consultations(&response.content);
        }

        let calls: Vec<NormalizedCall> = pending
            .iter()
            .filter_map(|raw| Self::normalize_args(raw, constraints))
            .filter(|call| !call.specific_task.is_empty())
            .collect();

        if !calls.is_empty() {
            info!("Professor making {} specialist consultation(s)", calls.len());
        }

        let total = calls.len();
        let mut consultations: Vec<SpecialistConsultation> = Vec::with_capacity(total);
        for (index, call) in calls.iter().enumerate() {
            self.report(
                ConsultationPhase::Consultations,
                index as f64 / total.max(1) as f64,
                format!(
                    "Specialist {}/{} ({}): starting",
                    index + 1,
                    total,
                    call.specialization
                ),
                None,
            );
            let consultation = self
                .execute_consultation(call, &context.prompt, index, total)
                .await;
            reasoning_tokens += consultation.reasoning_tokens;
            tokens_used += consultation.total_tokens;
            consultations.push(consultation);
        }

        let successes = consultations.iter().filter(|c| c.error.is_none()).count();
        let context_truncated = consultations.iter().any(|c| c.context_truncated);

        let output = if successes > 0 {
            self.report(
                ConsultationPhase::Synthesis,
                0.0,
                format!("Synthesizing {} specialist result(s)", consultations.len()),
                None,
            );
            let blocks: Vec<String> = consultations
                .iter()
                .map(|c| c.formatted_result.clone())
                .collect();
            let synthesis_prompt =
                prompts::build_synthesis_prompt(&context.prompt, constraints, &blocks);
            match self
                .provider
                .complete(
                    &synthesis_prompt,
                    &self.system_prompt,
                    0.5,
                    &CompletionOptions::default(),
                )
                .await
            {
                Ok(synthesis) => {
                    tokens_used += self.provider.count_tokens(&synthesis_prompt)
                        + self.provider.count_tokens(&synthesis);
                    reasoning_tokens += self.provider.last_reasoning_tokens().await;
                    synthesis.trim().to_string()
                }
                Err(e) => {
                    error!("Synthesis failed: {}; concatenating specialist results", e);
                    format!("Combined specialist results:\n\n{}", blocks.join("\n\n"))
                }
            }
        } else if !response.content.trim().is_empty() {
            // No usable consultations but the model answered directly.
            response.content.trim().to_string()
        } else {
            warn!("No successful consultations and no direct answer; using plain completion");
            return self.plain_fallback(&context.prompt, None).await;
        };

        info!(
            "Professor completed analysis with {} specialist consultation(s), tokens: {}",
            consultations.len(),
            tokens_used
        );

        let consultation_count = consultations.len();
        Ok(AgentResult {
            output,
            feedback: None,
            metadata: AgentMetadata {
                reasoning_summary: if reasoning_summary.is_empty() {
                    None
                } else {
                    Some(reasoning_summary)
                },
                reasoning_tokens,
                specialist_consultations: consultation_count,
                specialist_results: consultations,
                context_truncated,
                ..Default::default()
            },
            tokens_used,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_job_ids_are_deterministic_and_namespaced() {
        let a = derive_specialist_job_id("job-1", "Number Theory", "classify solutions");
        let b = derive_specialist_job_id("job-1", "Number Theory", "classify solutions");
        let c = derive_specialist_job_id("job-1", "Number Theory", "different task");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("job-1:spec:number_theory:"));
        let hash = a.rsplit(':').next().unwrap();
        assert_eq!(hash.len(), 8);
    }

    #[test]
    fn aliases_normalise_to_the_four_field_schema() {
        let raw = json!({
            "expertise": "graph theory",
            "task": "count spanning trees",
            "verification_requirements": "show the Kirchhoff step"
        });
        let call = ProfessorAgent::normalize_args(&raw, "global constraints").unwrap();
        assert_eq!(call.specialization, "graph theory");
        assert_eq!(call.specific_task, "count spanning trees");
        assert_eq!(call.problem_constraints, "show the Kirchhoff step");
    }

    #[test]
    fn missing_constraints_inherit_the_global_ones() {
        let raw = json!({"specific_task": "integrate by parts"});
        let call = ProfessorAgent::normalize_args(&raw, "no numerics").unwrap();
        assert_eq!(call.specialization, "general");
        assert_eq!(call.problem_constraints, "no numerics");
    }

    #[test]
    fn one_line_call_syntax_parses() {
        let text = r#"I need help.
consult_graduate_specialist({"specialization": "algebra", "specific_task": "factor it"})
That should do."#;
        let calls = ProfessorAgent::parse_text_consultations(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["specialization"], "algebra");
    }

    #[test]
    fn top_level_arrays_and_wrappers_parse() {
        let array = r#"[{"tool": "consult_graduate_specialist", "arguments": {"specific_task": "t1"}},
                        {"tool": "consult_graduate_specialist", "arguments": {"specific_task": "t2"}}]"#;
        assert_eq!(ProfessorAgent::parse_text_consultations(array).len(), 2);

        let nested = r#"{"consultations": [{"specialization": "logic", "specific_task": "prove"}]}"#;
        let calls = ProfessorAgent::parse_text_consultations(nested);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["specialization"], "logic");
    }

    #[test]
    fn fenced_blocks_parse() {
        let text = "Here is my plan:\n```json\n{\"tool\": \"consult_graduate_specialist\", \
                    \"arguments\": {\"specific_task\": \"verify bound\"}}\n```\nDone.";
        let calls = ProfessorAgent::parse_text_consultations(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["specific_task"], "verify bound");
    }

    #[test]
    fn adjacent_braced_json_parses() {
        let text = "I will invoke consult_graduate_specialist with \
                    {\"specialization\": \"analysis\", \"specific_task\": \"bound the error term\"} now.";
        let calls = ProfessorAgent::parse_text_consultations(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["specific_task"], "bound the error term");
    }
}
