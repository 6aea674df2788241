use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::sync::LazyLock;

/// Tool results shorter than this are treated as failed calls and yield
/// empty metadata.
const MIN_RESULT_LEN: usize = 50;
const MAX_TICKETS: usize = 10;
const MAX_TITLES: usize = 5;
const MIN_TITLE_LEN: usize = 5;
const SNIPPET_LEN: usize = 500;

static BARE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s)>\]"']+"#).expect("bare URL regex")
});
static MARKDOWN_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[[^\]]*\]\((https?://[^)]+)\)").expect("markdown URL regex")
});
static HREF_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"href=["']?(https?://[^"'>\s]+)"#).expect("href URL regex")
});
static JSON_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(?:url|html_url|web_url|browse_url|permalink|link|href)"\s*:\s*"(https?://[^"]+)""#)
        .expect("JSON URL regex")
});
static TICKET_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Z][A-Z0-9]*-\d+)\b").expect("ticket regex"));
static PR_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:PR|pull request|#)[\s#]*(\d+)").expect("PR number regex")
});
static ISSUE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:issue|#)[\s#]*(\d+)").expect("issue number regex"));
static FILE_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|[\s"])([/\\]?(?:[A-Za-z0-9_\-]+[/\\])*[A-Za-z0-9_\-]+\.[A-Za-z0-9]+)"#)
        .expect("file path regex")
});
static DOCUMENT_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:document/d/|file/d/|id=)([A-Za-z0-9_\-]{20,})").expect("document id regex")
});
static JIRA_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Z]+-\d+):\s*([^\n\r]{5,100})").expect("jira title regex"));
static MARKDOWN_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#{1,3}\s+(.+)$").expect("markdown title regex"));
static JSON_TITLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(?:title|name|summary|subject)"\s*:\s*"([^"]+)""#).expect("JSON title regex")
});
static HTML_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<title>([^<]+)</title>").expect("HTML title regex"));

const IMAGE_EXTENSIONS: &[&str] = &[".png", ".jpg", ".gif", ".svg"];

/// Keyword map checked against the tool name, in priority order.
const SOURCE_TYPE_KEYWORDS: &[(&str, SourceType)] = &[
    ("jira", SourceType::Jira),
    ("atlassian", SourceType::Jira),
    ("github", SourceType::Github),
    ("gdrive", SourceType::GoogleDrive),
    ("drive", SourceType::GoogleDrive),
    ("slack", SourceType::Slack),
    ("confluence", SourceType::Confluence),
    ("notion", SourceType::Notion),
    ("sharepoint", SourceType::Sharepoint),
    ("file", SourceType::FileSystem),
    ("web", SourceType::Web),
    ("search", SourceType::Search),
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Jira,
    Github,
    GoogleDrive,
    Slack,
    Confluence,
    Notion,
    Sharepoint,
    FileSystem,
    Web,
    Search,
    #[default]
    ToolResult,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Jira => "jira",
            Self::Github => "github",
            Self::GoogleDrive => "google_drive",
            Self::Slack => "slack",
            Self::Confluence => "confluence",
            Self::Notion => "notion",
            Self::Sharepoint => "sharepoint",
            Self::FileSystem => "file_system",
            Self::Web => "web",
            Self::Search => "search",
            Self::ToolResult => "tool_result",
        }
    }
}

/// Identifiers recognized in tool output. A tagged record with optional
/// fields rather than a dynamically keyed map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Identifiers {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_ticket: Option<String>,
    /// Comma-joined ticket ids, deduplicated, capped at 10.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tickets: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_key: Option<String>,
}

impl Identifiers {
    pub fn is_empty(&self) -> bool {
        self.primary_ticket.is_none()
            && self.tickets.is_none()
            && self.pr_number.is_none()
            && self.issue_number.is_none()
            && self.file_path.is_none()
            && self.document_id.is_none()
            && self.file_id.is_none()
            && self.issue_key.is_none()
    }

    pub fn ticket_list(&self) -> Vec<String> {
        self.tickets
            .as_deref()
            .map(|t| {
                t.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Provenance extracted from one tool invocation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolResultMetadata {
    pub urls: Vec<String>,
    pub titles: Vec<String>,
    pub identifiers: Identifiers,
    pub source_type: SourceType,
    pub snippet: String,
}

impl ToolResultMetadata {
    /// Whether this entry carries anything worth citing.
    pub fn has_provenance(&self) -> bool {
        !self.urls.is_empty() || !self.titles.is_empty() || !self.identifiers.is_empty()
    }
}

/// Extract provenance metadata from a tool result. Pure with respect to its
/// inputs: the same output always yields the same metadata.
pub fn process_tool_result(
    tool_name: &str,
    result: &str,
    params: Option<&Value>,
) -> ToolResultMetadata {
    let trimmed = result.trim();
    if trimmed.len() < MIN_RESULT_LEN || trimmed.contains("Error calling tool") {
        return ToolResultMetadata::default();
    }

    let mut metadata = ToolResultMetadata {
        urls: extract_urls(result),
        titles: extract_titles(result),
        identifiers: extract_identifiers(result, tool_name),
        source_type: SourceType::ToolResult,
        snippet: snippet(result),
    };
    metadata.source_type = determine_source_type(tool_name, &metadata.urls);

    if let Some(params) = params {
        enhance_with_params(&mut metadata, params);
    }

    metadata
}

fn clean_url(url: &str) -> &str {
    url.trim().trim_end_matches(['.', ',', ';', ':'])
}

fn is_image_url(url: &str) -> bool {
    IMAGE_EXTENSIONS.iter().any(|ext| url.ends_with(ext))
}

fn extract_urls(content: &str) -> Vec<String> {
    let mut urls = Vec::new();
    let mut push = |url: &str| {
        let url = clean_url(url);
        if !url.is_empty() && !is_image_url(url) && !urls.iter().any(|u| u == url) {
            urls.push(url.to_string());
        }
    };

    for m in BARE_URL.find_iter(content) {
        push(m.as_str());
    }
    for c in MARKDOWN_URL.captures_iter(content) {
        push(&c[1]);
    }
    for c in HREF_URL.captures_iter(content) {
        push(&c[1]);
    }
    for c in JSON_URL.captures_iter(content) {
        push(&c[1]);
    }

    urls
}

fn extract_identifiers(content: &str, tool_name: &str) -> Identifiers {
    let mut identifiers = Identifiers::default();

    let mut tickets: Vec<String> = Vec::new();
    for c in TICKET_ID.captures_iter(content) {
        let ticket = c[1].to_string();
        if !tickets.contains(&ticket) {
            tickets.push(ticket);
        }
        if tickets.len() >= MAX_TICKETS {
            break;
        }
    }
    if !tickets.is_empty() {
        identifiers.primary_ticket = Some(tickets[0].clone());
        identifiers.tickets = Some(tickets.join(","));
    }

    let github_flavored =
        tool_name.to_lowercase().contains("github") || content.contains("github.com");
    if github_flavored {
        if let Some(c) = PR_NUMBER.captures(content) {
            identifiers.pr_number = Some(c[1].to_string());
        }
        if let Some(c) = ISSUE_NUMBER.captures(content) {
            identifiers.issue_number = Some(c[1].to_string());
        }
    }

    if let Some(c) = FILE_PATH.captures(content) {
        identifiers.file_path = Some(c[1].to_string());
    }
    if let Some(c) = DOCUMENT_ID.captures(content) {
        identifiers.document_id = Some(c[1].to_string());
    }

    identifiers
}

fn extract_titles(content: &str) -> Vec<String> {
    let mut titles: Vec<String> = Vec::new();
    let mut push = |title: String| {
        let title = title.trim().to_string();
        if title.len() > MIN_TITLE_LEN && !titles.contains(&title) && titles.len() < MAX_TITLES {
            titles.push(title);
        }
    };

    for c in JIRA_TITLE.captures_iter(content) {
        push(format!("{}: {}", &c[1], c[2].trim()));
    }
    for c in MARKDOWN_TITLE.captures_iter(content) {
        push(c[1].to_string());
    }
    for c in JSON_TITLE.captures_iter(content) {
        push(c[1].to_string());
    }
    for c in HTML_TITLE.captures_iter(content) {
        push(c[1].to_string());
    }

    titles
}

fn determine_source_type(tool_name: &str, urls: &[String]) -> SourceType {
    let tool_lower = tool_name.to_lowercase();
    for (keyword, source_type) in SOURCE_TYPE_KEYWORDS {
        if tool_lower.contains(keyword) {
            return *source_type;
        }
    }

    for url in urls {
        if url.contains("github.com") {
            return SourceType::Github;
        }
        if url.contains("atlassian.net") || url.contains("jira") {
            return SourceType::Jira;
        }
        if url.contains("confluence") {
            return SourceType::Confluence;
        }
        if url.contains("slack.com") {
            return SourceType::Slack;
        }
        if url.contains("notion.so") {
            return SourceType::Notion;
        }
        if url.contains("docs.google.com") || url.contains("drive.google.com") {
            return SourceType::GoogleDrive;
        }
        if url.contains("sharepoint.com") {
            return SourceType::Sharepoint;
        }
    }

    SourceType::ToolResult
}

fn snippet(content: &str) -> String {
    if content.len() <= SNIPPET_LEN {
        return content.to_string();
    }
    let mut end = SNIPPET_LEN;
    while end > 0 && !content.is_char_boundary(end) {
        end -= 1;
    }
    content[..end].to_string()
}

fn param_str(params: &Value, key: &str) -> Option<String> {
    params.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Pull identifiers and URLs out of the call parameters, and construct the
/// canonical browse URL where the parameters allow it (inserted at the
/// front, so it becomes the primary URL).
fn enhance_with_params(metadata: &mut ToolResultMetadata, params: &Value) {
    for key in ["url", "link", "href", "web_url", "html_url", "browse_url"] {
        if let Some(url) = param_str(params, key)
            && !metadata.urls.contains(&url)
        {
            metadata.urls.push(url);
        }
    }

    if let Some(issue_key) = param_str(params, "issue_key") {
        metadata.identifiers.issue_key = Some(issue_key);
    }
    if let Some(file_id) = param_str(params, "file_id") {
        metadata.identifiers.file_id = Some(file_id);
    }
    if let Some(pr) = params.get("pr_number") {
        metadata.identifiers.pr_number = Some(match pr {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
    }

    match metadata.source_type {
        SourceType::Jira => {
            if let Some(base_url) = param_str(params, "base_url") {
                let ticket = metadata
                    .identifiers
                    .primary_ticket
                    .clone()
                    .or_else(|| metadata.identifiers.issue_key.clone());
                if let Some(ticket) = ticket {
                    let url = format!("{}/browse/{}", base_url.trim_end_matches('/'), ticket);
                    if !metadata.urls.contains(&url) {
                        metadata.urls.insert(0, url);
                    }
                }
            }
        }
        SourceType::Github => {
            if let (Some(owner), Some(repo)) =
                (param_str(params, "owner"), param_str(params, "repo"))
            {
                let base = format!("https://github.com/{owner}/{repo}");
                let url = if let Some(issue) = &metadata.identifiers.issue_number {
                    Some(format!("{base}/issues/{issue}"))
                } else {
                    metadata
                        .identifiers
                        .pr_number
                        .as_ref()
                        .map(|pr| format!("{base}/pull/{pr}"))
                };
                if let Some(url) = url
                    && !metadata.urls.contains(&url)
                {
                    metadata.urls.insert(0, url);
                }
            }
        }
        _ => {}
    }
}
