use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::LazyLock;

use crate::agent::result_processor::{SourceType, ToolResultMetadata};

static CITATION_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d+)\]").expect("citation ref regex"));
static SOURCES_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<SOURCES>.*?</SOURCES>").expect("sources block regex")
});
static URL_HOST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(https?://[^/]+)").expect("url host regex"));

const SOURCE_SNIPPET_LEN: usize = 300;

/// One processed tool invocation in the metadata buffer.
#[derive(Debug, Clone)]
pub struct CollectedToolResult {
    pub tool_name: String,
    pub arguments: Value,
    pub metadata: ToolResultMetadata,
    pub raw_result: String,
}

/// One numbered entry of the citation plan.
#[derive(Debug, Clone)]
pub struct CitationEntry {
    pub title: String,
    pub url: Option<String>,
    pub ticket: Option<String>,
    pub pr_number: Option<String>,
    pub issue_number: Option<String>,
    pub source_type: SourceType,
    pub snippet: String,
    pub tool_name: String,
}

/// A cited source in the terminal `final_response` event.
#[derive(Debug, Clone, Serialize)]
pub struct SourceRef {
    pub title: String,
    pub url: Option<String>,
    pub source_type: &'static str,
    pub snippet: String,
    pub metadata: Value,
}

fn host_of(url: &str) -> Option<String> {
    URL_HOST.captures(url).map(|c| c[1].to_string())
}

fn truncate_snippet(snippet: &str) -> String {
    let mut end = SOURCE_SNIPPET_LEN.min(snippet.len());
    while end > 0 && !snippet.is_char_boundary(end) {
        end -= 1;
    }
    snippet[..end].to_string()
}

/// Pull `issue key -> summary` pairs and the instance base URL out of a raw
/// Jira search payload, tolerating both the JSON API shape and plain text.
fn jira_summaries(raw_result: &str) -> (std::collections::HashMap<String, String>, Option<String>) {
    let mut summaries = std::collections::HashMap::new();
    let mut base_url = None;

    if let Ok(data) = serde_json::from_str::<Value>(raw_result) {
        if let Some(self_url) = data.get("self").and_then(Value::as_str) {
            base_url = host_of(self_url);
        }
        if let Some(issues) = data.get("issues").and_then(Value::as_array) {
            for issue in issues {
                let Some(key) = issue.get("key").and_then(Value::as_str) else {
                    continue;
                };
                if base_url.is_none() {
                    base_url = issue
                        .get("self")
                        .or_else(|| issue.get("url"))
                        .and_then(Value::as_str)
                        .and_then(host_of);
                }
                let summary = issue
                    .get("fields")
                    .and_then(|f| f.get("summary"))
                    .or_else(|| issue.get("summary"))
                    .and_then(Value::as_str);
                if let Some(summary) = summary {
                    summaries.insert(key.to_string(), summary.to_string());
                }
            }
        }
    }

    (summaries, base_url)
}

fn jira_entries(result: &CollectedToolResult) -> Vec<CitationEntry> {
    let metadata = &result.metadata;
    let tickets = metadata.identifiers.ticket_list();
    let (summaries, mut base_url) = jira_summaries(&result.raw_result);

    if base_url.is_none() {
        base_url = metadata.urls.first().and_then(|u| host_of(u));
    }

    tickets
        .into_iter()
        .map(|ticket| {
            let browse_fragment = format!("/browse/{ticket}");
            let url = metadata
                .urls
                .iter()
                .find(|u| u.contains(&browse_fragment))
                .cloned()
                .or_else(|| base_url.as_ref().map(|b| format!("{b}{browse_fragment}")));

            let title = summaries
                .get(&ticket)
                .map(|summary| format!("{ticket}: {summary}"))
                .or_else(|| metadata.titles.iter().find(|t| t.contains(&ticket)).cloned())
                .unwrap_or_else(|| format!("{ticket}: Jira Issue"));

            CitationEntry {
                title,
                url,
                ticket: Some(ticket),
                pr_number: None,
                issue_number: None,
                source_type: SourceType::Jira,
                snippet: truncate_snippet(&metadata.snippet),
                tool_name: result.tool_name.clone(),
            }
        })
        .collect()
}

/// Assemble the ordered citation plan from the metadata buffer. Entries
/// without any provenance are dropped; Jira results carrying tickets expand
/// into one entry per ticket with the canonical browse URL.
pub fn build_citation_entries(buffer: &[CollectedToolResult]) -> Vec<CitationEntry> {
    let mut entries = Vec::new();

    for result in buffer {
        let metadata = &result.metadata;
        if !metadata.has_provenance() {
            continue;
        }

        if metadata.source_type == SourceType::Jira && !metadata.identifiers.ticket_list().is_empty()
        {
            entries.extend(jira_entries(result));
            continue;
        }

        entries.push(CitationEntry {
            title: metadata
                .titles
                .first()
                .cloned()
                .unwrap_or_else(|| format!("{} results", result.tool_name)),
            url: metadata.urls.first().cloned(),
            ticket: metadata.identifiers.primary_ticket.clone(),
            pr_number: metadata.identifiers.pr_number.clone(),
            issue_number: metadata.identifiers.issue_number.clone(),
            source_type: metadata.source_type,
            snippet: truncate_snippet(&metadata.snippet),
            tool_name: result.tool_name.clone(),
        });
    }

    entries
}

/// Render the numbered citation guide handed to the LLM at synthesis time.
pub fn render_citation_guide(entries: &[CitationEntry]) -> String {
    let mut guide = String::new();
    for (i, entry) in entries.iter().enumerate() {
        let n = i + 1;
        let _ = writeln!(guide, "[{n}] {}", entry.title);
        if let Some(url) = &entry.url {
            let _ = writeln!(guide, "   URL: {url}");
        }
        if let Some(ticket) = &entry.ticket {
            let _ = writeln!(guide, "   Ticket: {ticket}");
        }
        if let Some(pr) = &entry.pr_number {
            let _ = writeln!(guide, "   PR: #{pr}");
        }
        if let Some(issue) = &entry.issue_number {
            let _ = writeln!(guide, "   Issue: #{issue}");
        }
        let _ = writeln!(guide, "   Type: {}", entry.source_type.as_str());
        guide.push('\n');
    }
    guide
}

/// The set of `[n]` indices referenced in a response.
pub fn referenced_indices(content: &str) -> BTreeSet<usize> {
    CITATION_REF
        .captures_iter(content)
        .filter_map(|c| c[1].parse().ok())
        .collect()
}

/// Remove any `<SOURCES>…</SOURCES>` block the LLM emitted on its own.
pub fn strip_sources_block(content: &str) -> String {
    SOURCES_BLOCK.replace_all(content, "").trim().to_string()
}

/// Build the structured sources list: a citation entry is included iff its
/// `[n]` actually appears in the final text. Uncited entries are dropped.
pub fn build_sources(entries: &[CitationEntry], final_content: &str) -> Vec<SourceRef> {
    let referenced = referenced_indices(final_content);

    entries
        .iter()
        .enumerate()
        .filter(|(i, _)| referenced.contains(&(i + 1)))
        .map(|(_, entry)| {
            let mut identifiers = serde_json::Map::new();
            if let Some(ticket) = &entry.ticket {
                identifiers.insert("primary_ticket".into(), Value::String(ticket.clone()));
            }
            if let Some(pr) = &entry.pr_number {
                identifiers.insert("pr_number".into(), Value::String(pr.clone()));
            }
            if let Some(issue) = &entry.issue_number {
                identifiers.insert("issue_number".into(), Value::String(issue.clone()));
            }

            SourceRef {
                title: entry.title.clone(),
                url: entry.url.clone(),
                source_type: entry.source_type.as_str(),
                snippet: entry.snippet.clone(),
                metadata: serde_json::json!({
                    "tool": entry.tool_name,
                    "identifiers": identifiers,
                }),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::result_processor::process_tool_result;
    use serde_json::json;

    fn collect(tool_name: &str, raw: &str, params: Option<&Value>) -> CollectedToolResult {
        CollectedToolResult {
            tool_name: tool_name.to_string(),
            arguments: params.cloned().unwrap_or_else(|| json!({})),
            metadata: process_tool_result(tool_name, raw, params),
            raw_result: raw.to_string(),
        }
    }

    const JIRA_SINGLE: &str = r#"{"issues":[{"key":"PDR-1","fields":{"summary":"Foo","status":{"name":"Open"}}}],"self":"https://x.atlassian.net/rest/api/2/search"}"#;
    const JIRA_MULTI: &str = r#"{"issues":[{"key":"PDR-1","fields":{"summary":"Foo bar fix"}},{"key":"PDR-2","fields":{"summary":"Another issue"}},{"key":"PDR-3","fields":{"summary":"Third one"}}],"self":"https://x.atlassian.net/rest/api/2/search"}"#;

    #[test]
    fn single_jira_ticket_gets_browse_url_and_summary_title() {
        let buffer = vec![collect("jira_search", JIRA_SINGLE, None)];
        let entries = build_citation_entries(&buffer);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].title, "PDR-1: Foo");
        assert_eq!(
            entries[0].url.as_deref(),
            Some("https://x.atlassian.net/browse/PDR-1")
        );
        assert_eq!(entries[0].source_type, SourceType::Jira);
    }

    #[test]
    fn multi_ticket_jira_result_expands_per_ticket() {
        let buffer = vec![collect("jira_search", JIRA_MULTI, None)];
        let entries = build_citation_entries(&buffer);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].title, "PDR-2: Another issue");
        assert_eq!(
            entries[2].url.as_deref(),
            Some("https://x.atlassian.net/browse/PDR-3")
        );
    }

    #[test]
    fn entries_without_provenance_are_skipped() {
        let buffer = vec![
            collect("jira_search", "too short", None),
            collect("jira_search", JIRA_SINGLE, None),
        ];
        let entries = build_citation_entries(&buffer);
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn guide_is_numbered_sequentially_over_expansion() {
        let buffer = vec![collect("jira_search", JIRA_MULTI, None)];
        let guide = render_citation_guide(&build_citation_entries(&buffer));
        assert!(guide.contains("[1] PDR-1: Foo bar fix"));
        assert!(guide.contains("[2] PDR-2: Another issue"));
        assert!(guide.contains("[3] PDR-3: Third one"));
        assert!(guide.contains("Type: jira"));
        assert!(guide.contains("URL: https://x.atlassian.net/browse/PDR-1"));
    }

    #[test]
    fn sources_keep_only_cited_entries_in_position() {
        let buffer = vec![collect("jira_search", JIRA_MULTI, None)];
        let entries = build_citation_entries(&buffer);
        let content = "PDR-1 is open [1] and PDR-3 was closed [3].";
        let sources = build_sources(&entries, content);
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].title, "PDR-1: Foo bar fix");
        assert_eq!(sources[1].title, "PDR-3: Third one");
    }

    #[test]
    fn uncited_guide_yields_empty_sources() {
        let buffer = vec![collect("jira_search", JIRA_MULTI, None)];
        let entries = build_citation_entries(&buffer);
        assert!(build_sources(&entries, "No citations here.").is_empty());
    }

    #[test]
    fn sources_block_is_stripped() {
        let content = "Answer text [1]\n\n<SOURCES>\n[1] something\n</SOURCES>\n";
        assert_eq!(strip_sources_block(content), "Answer text [1]");
    }

    #[test]
    fn referenced_indices_parse_all_occurrences() {
        let refs = referenced_indices("a [1] b [3] c [1] d [12]");
        assert!(refs.contains(&1));
        assert!(refs.contains(&3));
        assert!(refs.contains(&12));
        assert!(!refs.contains(&2));
    }

    #[test]
    fn non_jira_results_stay_single_entries() {
        let content = "Merged PR #512. See https://github.com/acme/repo/pull/512 for the diff and review thread.";
        let buffer = vec![collect("github_list_prs", content, None)];
        let entries = build_citation_entries(&buffer);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].source_type, SourceType::Github);
        assert_eq!(entries[0].pr_number.as_deref(), Some("512"));
    }
}
