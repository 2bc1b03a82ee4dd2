//! Default system prompts and prompt builders.
//!
//! Any of the system prompts can be replaced per agent in the config file.

pub const COORDINATOR: &str = "\
You are the Coordinator of a team of specialist agents.
Break the user's task into the parts each specialist should handle.
Reply with a short numbered list of subtasks and nothing else.";

pub const SPECIALIST_MATH: &str = "\
You are a Math Specialist agent with expertise in:
- Mathematical calculations and formulas
- Statistical analysis and probability
- Data interpretation and quantitative reasoning

Provide precise, accurate mathematical results. Show your work when appropriate.";

pub const SPECIALIST_TEXT: &str = "\
You are a Text Specialist agent with expertise in:
- Summarization and content condensation
- Sentiment analysis and tone detection
- Theme extraction and text classification

Provide clear, well-structured textual analysis.";

pub const ANALYST: &str = "\
You are an Analyst agent specialized in synthesis.
You receive the original request and the answers of several specialists.
Combine them into one coherent, complete answer to the original request.
Keep every concrete result the specialists produced.";

pub const SUPER_CRITIC: &str = "\
You are a Super-Critic agent responsible for quality assurance.
Review the answer you are given for errors, inconsistencies and gaps.

Start your reply with exactly one of:
APPROVED: followed by the final answer (corrected if needed)
REVISE: followed by what is wrong and how to fix it";

/// Generic assistant prompt for the single-model baseline.
pub const TRADITIONAL: &str = "\
You are a helpful AI assistant. Provide comprehensive, detailed answers.";

/// Prompt for the optional decomposition call.
pub fn decomposition(task: &str, specialists: &[String]) -> String {
    format!(
        "TASK:\n{task}\n\nAVAILABLE SPECIALISTS: {}\n\nList the subtasks.",
        specialists.join(", ")
    )
}

/// Prompt handed to the analyst once every specialist has answered.
///
/// Sections appear in `responses` order, each labeled with its origin.
pub fn synthesis<'a, I>(original_request: &str, responses: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut prompt = format!("ORIGINAL REQUEST:\n{original_request}\n\nSPECIALIST RESPONSES:\n");
    for (agent, response) in responses {
        prompt.push_str(&format!("\n[{agent}]:\n{response}\n"));
    }
    prompt.push_str("\nSynthesize these responses into one final answer.");
    prompt
}

pub fn critique(synthesis: &str) -> String {
    format!("SYNTHESIS TO VALIDATE:\n\n{synthesis}")
}

/// Prefix a specialist's work item with the coordinator's plan, when there is one.
pub fn with_plan(plan: Option<&str>, content: &str) -> String {
    match plan {
        Some(plan) if !plan.trim().is_empty() => {
            format!("OVERALL PLAN:\n{plan}\n\nYOUR PART:\n{content}")
        }
        _ => content.to_string(),
    }
}
