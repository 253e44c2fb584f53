//! Prompt text for the agent roles.
//!
//! Strings are data: the builders here are pure functions over the problem
//! pieces, and nothing in the engine depends on their wording.  Role system
//! prompts live next to the builders that compose per-call user prompts.

/// System prompt for the generator role.
pub fn generator_system_prompt() -> String {
    "You are an expert problem solver. Produce a complete, rigorous answer to the \
     given problem. Show your reasoning, state assumptions explicitly, and present \
     the final result clearly."
        .to_string()
}

/// System prompt for the evaluator role.
///
/// The stop token is described to the model here; the detector in the
/// evaluator agent only honours standalone occurrences, so instructional
/// mentions inside feedback do not terminate the loop.
pub fn evaluator_system_prompt(stop_token: &str) -> String {
    format!(
        "You are a strict evaluator of answers. Assess the answer for correctness, \
         completeness, clarity, and adherence to any constraints. Give concrete, \
         actionable feedback on every weakness you find. Only if the answer is fully \
         correct and complete, end your feedback with {} on its own line.",
        stop_token
    )
}

/// System prompt for the refiner role.
pub fn refiner_system_prompt() -> String {
    "You improve prompts for iterative problem solving. Given a prompt, the answer \
     it produced, and evaluator feedback, write a refined prompt that preserves what \
     worked, directly addresses the identified weaknesses, and keeps all accumulated \
     context. Output only the refined prompt."
        .to_string()
}

/// System prompt for a specialist with the given domain.
pub fn specialist_system_prompt(domain: &str) -> String {
    format!(
        "You are a graduate-level specialist in {}. Solve the assigned task with \
         analytical rigor, deriving results rather than asserting them, and place \
         the final answer between <answer> tags.",
        domain
    )
}

/// System prompt for the professor orchestrator.
pub fn professor_system_prompt() -> String {
    "You are a supervising professor leading a team of graduate specialists. \
     Decompose hard problems, delegate well-scoped subtasks to specialists via the \
     consult_graduate_specialist tool, and integrate their results into a single \
     rigorous solution."
        .to_string()
}

/// Compose the professor's opening analysis prompt.
pub fn build_analysis_prompt(question: &str, context: &str, constraints: &str) -> String {
    let mut parts = vec![format!("Problem: {}", question)];
    if !context.is_empty() {
        parts.push(format!("Context: {}", context));
    }
    if !constraints.is_empty() {
        parts.push(format!("Constraints: {}", constraints));
    }
    format!(
        "{}\n\nAnalyze this problem and determine whether you can solve it directly \
         or need specialist consultation. If specialists are needed, identify the \
         expertise required and use the consult_graduate_specialist function to \
         delegate each specific task. You will then synthesize the results into a \
         comprehensive solution.",
        parts.join("\n")
    )
}

/// Compose the evaluation prompt for a question/answer pair.
pub fn build_evaluation_prompt(
    question: &str,
    answer: &str,
    constraints: Option<&str>,
    generator_reasoning: Option<&str>,
) -> String {
    let mut prompt = format!(
        "Evaluate the following answer.\n\nQuestion:\n{}\n\nAnswer:\n{}\n",
        question, answer
    );
    if let Some(constraints) = constraints {
        if !constraints.is_empty() {
            prompt.push_str(&format!("\nConstraints to verify:\n{}\n", constraints));
        }
    }
    if let Some(reasoning) = generator_reasoning {
        if !reasoning.is_empty() {
            prompt.push_str(&format!(
                "\nThe solver's reasoning summary, for reference:\n{}\n",
                reasoning
            ));
        }
    }
    prompt.push_str(
        "\nIdentify any errors, gaps, or constraint violations, and give specific \
         guidance for improvement.",
    );
    prompt
}

/// Compose the AI refinement prompt.
pub fn build_refinement_prompt(
    prior_prompt: &str,
    current_answer: &str,
    feedback: &str,
    iteration: usize,
    evaluator_reasoning: Option<&str>,
) -> String {
    let mut prompt = format!(
        "Iteration {} produced the answer below; the evaluator found problems.\n\n\
         Current prompt:\n{}\n\nCurrent answer:\n{}\n\nEvaluator feedback:\n{}\n",
        iteration, prior_prompt, current_answer, feedback
    );
    if let Some(reasoning) = evaluator_reasoning {
        if !reasoning.is_empty() {
            prompt.push_str(&format!("\nEvaluator reasoning summary:\n{}\n", reasoning));
        }
    }
    prompt.push_str(
        "\nWrite the refined prompt for the next iteration. Preserve the approaches \
         that worked, target the weaknesses above, and do not discard context the \
         solver has already established.",
    );
    prompt
}

/// Compose the professor's reasoning context passed along to a specialist.
pub fn build_reasoning_context(
    original_problem: &str,
    context_for_specialist: &str,
    constraints: &str,
) -> String {
    format!(
        "PROFESSOR'S REASONING CONTEXT:\nOriginal Problem: {}\nSpecialist Context: {}\n\
         Task Constraints: {}",
        original_problem, context_for_specialist, constraints
    )
}

/// Compose the memorandum a specialist receives as its problem statement.
pub fn build_specialist_memo(specialization: &str, task: &str, reasoning_context: &str) -> String {
    format!(
        "**PROFESSOR'S MEMORANDUM**\n\n\
         **TO**: Graduate Student Specialist, {spec}\n\
         **FROM**: Supervising Professor\n\
         **SUBJECT**: Critical Task Assignment\n\n\
         You have been selected for this assignment due to your advanced expertise \
         in {spec}. This task is a component of a larger effort and requires full \
         analytical rigor.\n\n\
         **YOUR ASSIGNED TASK:**\n{task}\n\n\
         **EXPECTATIONS:**\n\
         Provide a solution that is analytically sound and rigorously derived. Use \
         computational checks only to verify analytical results, never to replace \
         reasoning. Conclude with the final answer in <answer> tags so it can be \
         integrated into the main solution.\n\n\
         {context}",
        spec = specialization,
        task = task,
        context = reasoning_context
    )
}

/// Compose the formatted consultation block embedded into synthesis prompts
/// and continuation turns.
pub fn build_consultation_block(
    specialization: &str,
    task: &str,
    final_answer: &str,
    iterations: usize,
    final_evaluation: &str,
    reasoning_section: &str,
) -> String {
    format!(
        "SPECIALIST CONSULTATION — {}\nTask: {}\nIterations: {}\n\nFinal Answer:\n{}\n\n\
         Final Evaluation:\n{}{}",
        specialization, task, iterations, final_answer, final_evaluation, reasoning_section
    )
}

/// Compose the synthesis prompt over all consultation blocks.
pub fn build_synthesis_prompt(question: &str, constraints: &str, blocks: &[String]) -> String {
    let mut prompt = format!(
        "Original Problem: {}\n\nConstraints: {}\n\nSpecialist Consultations:\n",
        question, constraints
    );
    for (i, block) in blocks.iter().enumerate() {
        prompt.push_str(&format!("\n--- Consultation {} ---\n{}\n", i + 1, block));
    }
    prompt.push_str(
        "\nAs the supervising professor, synthesize these specialist results into a \
         comprehensive solution that addresses the original problem completely, \
         integrates every specialist's insights, satisfies all constraints, and \
         presents a clear final answer with proper reasoning.",
    );
    prompt
}
