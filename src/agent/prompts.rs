use std::collections::HashMap;
use std::fmt::Write as _;

use crate::agent::binding::BoundTool;

/// Bounds accepted for a preprocessed query rewrite: abandon anything that
/// grows beyond 3x the original or collapses below 3 characters.
pub const REWRITE_MAX_GROWTH: usize = 3;
pub const REWRITE_MIN_LEN: usize = 3;

/// System prompt for the tool-calling loop: identity, catalog summary,
/// mandatory per-source instructions, and the citation rule.
pub fn system_prompt(
    search_tools: &[BoundTool],
    source_names: &[String],
    instructions: &HashMap<String, String>,
) -> String {
    let mut tools_context = String::new();
    for tool in search_tools {
        let _ = writeln!(
            tools_context,
            "- {}: {}",
            tool.namespaced_name, tool.definition.description
        );
    }

    let mut instructions_section = String::new();
    if !instructions.is_empty() {
        instructions_section.push_str(
            "\n\nCRITICAL SOURCE-SPECIFIC INSTRUCTIONS\nThese instructions are mandatory and must be followed strictly:\n\n",
        );
        let mut names: Vec<&String> = instructions.keys().collect();
        names.sort();
        for name in names {
            let _ = writeln!(instructions_section, "**{}:**\n{}\n", name, instructions[name]);
        }
        instructions_section.push_str(
            "Before calling any search tool, check whether these instructions require \
             mandatory project or space filters and include them in every search.\n",
        );
    }

    format!(
        "You are Scintilla, an intelligent knowledge assistant with access to {tool_count} \
         search tools from: {servers}\n\
         \n\
         You maintain conversation context across messages; follow-up questions build on \
         previous responses.\n\
         \n\
         Use tools when the user asks for specific information that needs searching, \
         follow-ups requiring new searches, documentation, recent changes, or anything \
         requiring factual information from the connected knowledge bases. Respond directly \
         for capability questions, clarifications about previous responses, and meta \
         questions about your functions.\n\
         \n\
         AVAILABLE SEARCH TOOLS ({tool_count} tools):\n{tools_context}\n\
         CITATION REQUIREMENTS (only when using tools):\n\
         - Cite sources using [1], [2], [3] format ONLY when a claim references information \
         from that tool result\n\
         - Do not add citations to general introductory sentences or summaries\n\
         - A sources section is appended automatically - do NOT add your own <SOURCES> section\
         {instructions_section}",
        tool_count = search_tools.len(),
        servers = source_names.join(", "),
        tools_context = tools_context,
        instructions_section = instructions_section,
    )
}

/// Answer returned without any LLM round-trip when no sources are selected.
pub fn no_tools_answer() -> String {
    "I don't have any tools configured for this query. Select at least one source or bot \
     with cached tools, or ask an administrator to set one up, and I'll be able to search \
     your knowledge bases."
        .to_string()
}

/// Prompt for the lightweight query-rewrite call. Only instruction sets
/// that mention a mandatory project or space produce a rewrite attempt.
pub fn preprocess_prompt(user_query: &str, instructions: &HashMap<String, String>) -> Option<String> {
    let mut relevant = String::new();
    let mut names: Vec<&String> = instructions.keys().collect();
    names.sort();
    for name in names {
        let text = &instructions[name];
        let lowered = text.to_lowercase();
        if lowered.contains("project") || lowered.contains("space") {
            let _ = writeln!(relevant, "**{name}**: {text}");
        }
    }
    if relevant.is_empty() {
        return None;
    }

    Some(format!(
        "You are a query preprocessor. Modify the user's query to automatically include the \
         required filters from the source instructions below. Make it sound natural.\n\
         \n\
         SOURCE INSTRUCTIONS:\n{relevant}\n\
         EXAMPLES:\n\
         - \"what tickets we have\" -> \"what tickets we have in XINETBSE project\"\n\
         - \"open tickets\" -> \"open XINETBSE tickets\"\n\
         - \"confluence pages about X\" -> \"confluence pages about X in XINET space\"\n\
         \n\
         USER QUERY: \"{user_query}\"\n\
         \n\
         Reply with the modified query only."
    ))
}

/// Accept a rewrite only when it stays within sane bounds and actually
/// changed something.
pub fn accept_rewrite(original: &str, rewritten: &str) -> bool {
    let rewritten = rewritten.trim();
    if rewritten.len() < REWRITE_MIN_LEN {
        return false;
    }
    if rewritten.len() > original.len() * REWRITE_MAX_GROWTH {
        return false;
    }
    !rewritten.eq_ignore_ascii_case(original.trim())
}

/// The synthesis-time message carrying the citation guide.
pub fn citation_prompt(citation_guide: &str) -> String {
    format!(
        "Based on the tool results above, here is information you can cite:\n\
         \n\
         {citation_guide}\n\
         CITATION INSTRUCTIONS:\n\
         1. Use [1], [2], [3] format when citing specific information from sources\n\
         2. Only cite when directly referencing information from a source\n\
         3. Match citation numbers to the numbered list above\n\
         4. Keep ticket IDs as plain text (like PDR-148559, not links)\n\
         5. The sources section will be appended automatically\n\
         \n\
         Please provide your response with proper citations based on the tool results."
    )
}

/// The optional validation pass prompt.
pub fn validation_prompt(final_content: &str, citation_guide: &str) -> String {
    format!(
        "Please review and fix any issues in this response:\n\
         \n\
         ORIGINAL RESPONSE:\n{final_content}\n\
         \n\
         AVAILABLE CITATION INFORMATION:\n{citation_guide}\n\
         \n\
         ISSUES TO FIX:\n\
         1. Broken or malformed URLs - remove or fix them\n\
         2. Missing citations for specific claims - add appropriate [1], [2], [3] citations\n\
         3. Incorrect citation numbers - match them to the source list above\n\
         \n\
         Return the corrected response with proper citations. Keep the same tone and \
         content, just fix technical issues."
    )
}

/// Accept a validation rewrite only if its length stays within [0.5x, 2x]
/// of the original; anything else is silently discarded.
pub fn accept_validation(original: &str, validated: &str) -> bool {
    let len = validated.trim().len();
    len * 2 >= original.len() && len <= original.len() * 2
}
