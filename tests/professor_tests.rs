use async_trait::async_trait;
use selfevolve::agent::{context_keys, Agent, AgentContext};
use selfevolve::config::Settings;
use selfevolve::professor::ProfessorAgent;
use selfevolve::provider::{
    approx_token_count, CompletionOptions, FunctionCall, Provider, ProviderError,
    ProviderResponse, ToolSpec,
};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

const SPECIALIST_ANSWER: &str = "After classifying the residues modulo nine the only solution \
                                 class remaining is the trivial one, so the count is \
                                 <answer>42</answer> as required.";
const SYNTHESIS_TEXT: &str = "Integrating the specialist's classification, the final answer to \
                              the original problem is 42, derived from the residue analysis.";
const EVAL_STOP: &str = "The classification is rigorous and complete. <stop>";

/// Provider that answers `complete` by substring rules and serves scripted
/// structured responses for `complete_with_functions`.
struct RuleProvider {
    rules: Vec<(String, String)>,
    default_response: String,
    function_responses: Mutex<VecDeque<ProviderResponse>>,
    log: Mutex<Vec<String>>,
}

impl RuleProvider {
    fn new(rules: Vec<(&str, &str)>, default_response: &str) -> Self {
        Self {
            rules: rules
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            default_response: default_response.to_string(),
            function_responses: Mutex::new(VecDeque::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    fn with_function_response(self, response: ProviderResponse) -> Self {
        self.function_responses
            .try_lock()
            .expect("unused provider")
            .push_back(response);
        self
    }

    async fn logged_prompts(&self) -> Vec<String> {
        self.log.lock().await.clone()
    }
}

#[async_trait]
impl Provider for RuleProvider {
    async fn complete(
        &self,
        prompt: &str,
        _system_prompt: &str,
        _temperature: f32,
        _options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        self.log.lock().await.push(prompt.to_string());
        for (needle, response) in &self.rules {
            if prompt.contains(needle.as_str()) {
                return Ok(response.clone());
            }
        }
        Ok(self.default_response.clone())
    }

    async fn complete_with_functions(
        &self,
        prompt: &str,
        system_prompt: &str,
        temperature: f32,
        _tools: &[ToolSpec],
    ) -> Result<ProviderResponse, ProviderError> {
        if let Some(response) = self.function_responses.lock().await.pop_front() {
            self.log.lock().await.push(prompt.to_string());
            return Ok(response);
        }
        let content = self
            .complete(prompt, system_prompt, temperature, &CompletionOptions::default())
            .await?;
        Ok(ProviderResponse {
            content,
            function_calls: Vec::new(),
        })
    }

    fn model_name(&self) -> &str {
        "rule-model"
    }

    fn provider_name(&self) -> &str {
        "rule"
    }
}

fn consult_call(args: serde_json::Value) -> FunctionCall {
    FunctionCall {
        name: "consult_graduate_specialist".to_string(),
        arguments: args,
        parse_strategy: "structured".to_string(),
    }
}

fn specialist_rules() -> Vec<(&'static str, &'static str)> {
    vec![
        ("Evaluate the following answer", EVAL_STOP),
        ("As the supervising professor, synthesize", SYNTHESIS_TEXT),
        ("PROFESSOR'S MEMORANDUM", SPECIALIST_ANSWER),
    ]
}

#[tokio::test]
async fn consultation_flows_through_specialist_and_synthesis() {
    let provider = Arc::new(
        RuleProvider::new(specialist_rules(), "unexpected prompt").with_function_response(
            ProviderResponse {
                content: String::new(),
                function_calls: vec![consult_call(json!({
                    "specialization": "number theory",
                    "specific_task": "classify solutions",
                    "context_for_specialist": "the equation from the main problem",
                    "problem_constraints": "prove every step"
                }))],
            },
        ),
    );

    let professor = ProfessorAgent::new(provider.clone())
        .with_settings(Settings::default().with_specialist_max_iters(4));
    let context = AgentContext::from_prompt("How many integer solutions does the equation have?")
        .with_extra(context_keys::CONSTRAINTS, "prove every step");

    let result = professor.run(&context).await.unwrap();

    assert_eq!(result.metadata.specialist_consultations, 1);
    let consultation = &result.metadata.specialist_results[0];
    assert_eq!(consultation.specialization, "number theory");
    assert_eq!(consultation.task, "classify solutions");
    assert_eq!(consultation.final_answer_value, "42");
    assert!(consultation.converged);
    assert_eq!(consultation.iterations, 1);
    assert!(consultation.error.is_none());
    assert!(consultation.solution.is_some());
    assert_eq!(result.output, SYNTHESIS_TEXT);

    // Aggregate tokens: the professor's own calls plus the specialist run.
    let prompts = provider.logged_prompts().await;
    let analysis_prompt = &prompts[0];
    let synthesis_prompt = prompts.last().unwrap();
    let professor_own = approx_token_count(analysis_prompt)
        + approx_token_count(synthesis_prompt)
        + approx_token_count(SYNTHESIS_TEXT);
    assert_eq!(
        result.tokens_used,
        professor_own + consultation.total_tokens
    );
}

#[tokio::test]
async fn failed_consultation_is_recorded_and_others_proceed() {
    // The first specialist's memo mentions a poisoned task marker; its
    // generator output stays empty, so that consultation fails while the
    // second one succeeds and synthesis still runs.  The evaluation and
    // synthesis rules come first so the marker only poisons the memo.
    let rules = vec![
        ("Evaluate the following answer", EVAL_STOP),
        ("As the supervising professor, synthesize", SYNTHESIS_TEXT),
        ("diverge forever", ""),
        ("PROFESSOR'S MEMORANDUM", SPECIALIST_ANSWER),
    ];
    let provider = Arc::new(RuleProvider::new(rules, "unexpected prompt").with_function_response(
        ProviderResponse {
            content: String::new(),
            function_calls: vec![
                consult_call(json!({
                    "specialization": "chaos theory",
                    "specific_task": "diverge forever",
                    "context_for_specialist": "",
                    "problem_constraints": ""
                })),
                consult_call(json!({
                    "specialization": "number theory",
                    "specific_task": "classify solutions",
                    "context_for_specialist": "",
                    "problem_constraints": ""
                })),
            ],
        },
    ));

    let professor = ProfessorAgent::new(provider)
        .with_settings(Settings::default().with_specialist_max_iters(2));
    let result = professor
        .run(&AgentContext::from_prompt("A two-part problem"))
        .await
        .unwrap();

    assert_eq!(result.metadata.specialist_consultations, 2);
    let failed = &result.metadata.specialist_results[0];
    assert!(failed.error.is_some());
    assert!(failed.output.starts_with("Specialist consultation failed:"));
    let succeeded = &result.metadata.specialist_results[1];
    assert!(succeeded.error.is_none());
    assert_eq!(succeeded.final_answer_value, "42");
    assert_eq!(result.output, SYNTHESIS_TEXT);
}

#[tokio::test]
async fn zero_consultations_with_direct_answer_uses_the_answer() {
    let direct = "The problem decomposes trivially and the answer is forty-two by inspection of \
                  the residues involved.";
    let provider = Arc::new(RuleProvider::new(vec![], "unused").with_function_response(
        ProviderResponse {
            content: direct.to_string(),
            function_calls: Vec::new(),
        },
    ));

    let professor = ProfessorAgent::new(provider);
    let result = professor
        .run(&AgentContext::from_prompt("A simple problem"))
        .await
        .unwrap();

    assert_eq!(result.metadata.specialist_consultations, 0);
    assert!(result.metadata.specialist_results.is_empty());
    assert_eq!(result.output, direct);
    assert!(!result.metadata.fallback);
}

#[tokio::test]
async fn zero_consultations_and_no_answer_fall_back_to_plain_completion() {
    let plain = "Direct analysis shows the construction is impossible, because the parity \
                 argument rules out every candidate configuration.";
    let provider = Arc::new(
        RuleProvider::new(vec![("Analyze and provide solution for", plain)], "unused")
            .with_function_response(ProviderResponse {
                content: String::new(),
                function_calls: Vec::new(),
            }),
    );

    let professor = ProfessorAgent::new(provider);
    let result = professor
        .run(&AgentContext::from_prompt("An empty-response problem"))
        .await
        .unwrap();

    assert!(result.metadata.fallback);
    assert_eq!(result.metadata.specialist_consultations, 0);
    assert_eq!(result.output, plain);
}

#[tokio::test]
async fn failed_consultations_with_no_answer_fall_back_with_zero_count() {
    // A consultation is attempted but its specialist never produces valid
    // output, and the analysis turn carried no direct text either.  The
    // plain-completion fallback must not report the failed attempt: the
    // consultation count is zero and no consultation records survive.
    let plain = "Attacking the problem directly, the modular obstruction rules out every \
                 nontrivial solution candidate.";
    let provider = Arc::new(
        RuleProvider::new(
            vec![
                ("diverge forever", ""),
                ("Analyze and provide solution for", plain),
            ],
            "unexpected prompt",
        )
        .with_function_response(ProviderResponse {
            content: String::new(),
            function_calls: vec![consult_call(json!({
                "specialization": "chaos theory",
                "specific_task": "diverge forever",
                "context_for_specialist": "",
                "problem_constraints": ""
            }))],
        }),
    );

    let professor = ProfessorAgent::new(provider)
        .with_settings(Settings::default().with_specialist_max_iters(2));
    let result = professor
        .run(&AgentContext::from_prompt("A doomed delegation problem"))
        .await
        .unwrap();

    assert!(result.metadata.fallback);
    assert_eq!(result.metadata.specialist_consultations, 0);
    assert!(result.metadata.specialist_results.is_empty());
    assert_eq!(result.output, plain);
}

#[tokio::test]
async fn textual_tool_calls_are_recovered_when_structured_calls_are_absent() {
    let textual = "I will delegate this.\n\
                   consult_graduate_specialist({\"specialization\": \"number theory\", \
                   \"specific_task\": \"classify solutions\"})";
    let provider = Arc::new(
        RuleProvider::new(specialist_rules(), "unexpected prompt").with_function_response(
            ProviderResponse {
                content: textual.to_string(),
                function_calls: Vec::new(),
            },
        ),
    );

    let professor = ProfessorAgent::new(provider)
        .with_settings(Settings::default().with_specialist_max_iters(2));
    let result = professor
        .run(&AgentContext::from_prompt("A delegated problem"))
        .await
        .unwrap();

    assert_eq!(result.metadata.specialist_consultations, 1);
    assert_eq!(
        result.metadata.specialist_results[0].specialization,
        "number theory"
    );
    assert_eq!(result.output, SYNTHESIS_TEXT);
}
