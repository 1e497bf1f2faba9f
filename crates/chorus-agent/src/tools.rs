//! Resolution of `[TOOL:Name:request]` directives embedded in agent output.

use core::fmt::Write as _;
use core::ops::Range;
use std::sync::{Arc, LazyLock};

use chorus_core::{ToolDescriptor, ToolError, ToolGateway};
use regex::Regex;
use tracing::{debug, warn};

/// Tool name that asks the expander to pick the best enabled tool.
pub const AUTO_TOOL: &str = "Auto";

/// Tool invoked by the `[SEARCH:query]` shorthand.
pub const SEARCH_TOOL: &str = "Search";

/// `[TOOL:Name:request]` or `[SEARCH:request]`.
static DIRECTIVE: LazyLock<Regex> = LazyLock::new(|| {
    match Regex::new(r"\[(?:TOOL:(?P<tool>[^:\]]+):|(?P<search>SEARCH):)(?P<request>[^\]]+)\]") {
        Ok(regex) => regex,
        Err(err) => panic!("Tool directive regex is invalid: {err}"),
    }
});

/// Keyword category used when scoring tools for an `Auto` directive.
struct Category {
    weight: u32,
    keywords: &'static [&'static str],
}

const CATEGORIES: &[Category] = &[
    // search
    Category {
        weight: 10,
        keywords: &["search", "find", "lookup", "look up", "web", "news", "latest", "google"],
    },
    // development
    Category {
        weight: 8,
        keywords: &["code", "git", "repository", "build", "compile", "debug", "commit", "file"],
    },
    // data
    Category {
        weight: 7,
        keywords: &["data", "database", "sql", "query", "csv", "table", "analytics"],
    },
    // documentation
    Category {
        weight: 6,
        keywords: &["doc", "manual", "reference", "guide", "api", "readme"],
    },
];

const MULTI_CAPABILITY_BONUS: u32 = 2;
const WELL_KNOWN_BONUS: u32 = 3;
const WELL_KNOWN_TOOLS: &[&str] = &[
    "search",
    "web_search",
    "brave_search",
    "fetch",
    "github",
    "filesystem",
    "sqlite",
    "postgres",
];

/// One directive found in agent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDirective {
    /// Byte range of the whole directive
    pub range: Range<usize>,
    /// Requested tool name, [`AUTO_TOOL`] for automatic selection
    pub tool: String,
    /// Request passed to the tool
    pub request: String,
}

impl ToolDirective {
    /// Whether the tool should be picked automatically.
    #[must_use]
    pub fn is_auto(&self) -> bool {
        self.tool.eq_ignore_ascii_case(AUTO_TOOL)
    }
}

/// Directives in `text`, in order of appearance.
pub fn find_directives(text: &str) -> Vec<ToolDirective> {
    DIRECTIVE
        .captures_iter(text)
        .filter_map(|captures| {
            let whole = captures.get(0)?;
            let request = captures.name("request")?.as_str().trim();
            let tool = captures
                .name("tool")
                .map_or(SEARCH_TOOL, |tool| tool.as_str().trim());
            Some(ToolDirective {
                range: whole.range(),
                tool: tool.to_owned(),
                request: request.to_owned(),
            })
        })
        .collect()
}

/// Heuristic fit of `tool` for `request`.
///
/// Each category the request and the tool both touch adds its weight. Tools
/// with several capabilities and a few well-known tools get a small bonus.
pub fn score_tool(tool: &ToolDescriptor, request: &str) -> u32 {
    let request = request.to_lowercase();
    let profile = format!(
        "{} {} {}",
        tool.name,
        tool.capabilities.join(" "),
        tool.description
    )
    .to_lowercase();

    let mut score = CATEGORIES
        .iter()
        .filter(|category| {
            let mentions = |haystack: &str| {
                category
                    .keywords
                    .iter()
                    .any(|keyword| haystack.contains(keyword))
            };
            mentions(&request) && mentions(&profile)
        })
        .map(|category| category.weight)
        .sum::<u32>();

    if tool.capabilities.len() >= 2 {
        score += MULTI_CAPABILITY_BONUS;
    }
    let name = tool.name.to_lowercase();
    if WELL_KNOWN_TOOLS.contains(&name.as_str()) {
        score += WELL_KNOWN_BONUS;
    }
    score
}

/// Highest-scoring tool for `request`; ties keep the earlier tool.
pub fn select_auto_tool<'tools>(
    tools: &'tools [ToolDescriptor],
    request: &str,
) -> Option<&'tools ToolDescriptor> {
    let mut best: Option<(&ToolDescriptor, u32)> = None;
    for tool in tools {
        let score = score_tool(tool, request);
        if best.is_none_or(|(_, top)| score > top) {
            best = Some((tool, score));
        }
    }
    best.map(|(tool, _)| tool)
}

/// Result of one directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    /// Tool that was invoked (or requested, if resolution failed)
    pub tool: String,
    /// Request passed to the tool
    pub request: String,
    /// Rendered output or the failure
    pub output: Result<String, ToolError>,
}

/// Agent output with every directive replaced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Expansion {
    /// Text with directives substituted
    pub text: String,
    /// Directives replaced by tool output
    pub resolved: usize,
    /// Directives replaced by an inline error
    pub failed: usize,
    /// Per-directive results in order
    pub results: Vec<ToolResult>,
}

impl Expansion {
    fn unchanged(text: &str) -> Self {
        Self {
            text: text.to_owned(),
            ..Self::default()
        }
    }

    /// Whether any directive resolved successfully.
    #[must_use]
    pub const fn has_resolved(&self) -> bool {
        self.resolved > 0
    }
}

/// Replaces directives in finished agent output with gateway results.
#[derive(Clone)]
pub struct ToolInvocationExpander {
    gateway: Arc<dyn ToolGateway>,
}

impl ToolInvocationExpander {
    /// Creates an expander backed by `gateway`.
    #[must_use]
    pub fn new(gateway: Arc<dyn ToolGateway>) -> Self {
        Self { gateway }
    }

    /// Resolves every directive in `text`. Failures are inlined as
    /// `[Tool error: ...]`; the rest of the text is untouched.
    pub async fn expand(&self, text: &str) -> Expansion {
        let directives = find_directives(text);
        if directives.is_empty() {
            return Expansion::unchanged(text);
        }

        let enabled = self.gateway.list_enabled_tools().await;
        let mut expansion = Expansion::default();
        let mut cursor = 0;
        for directive in directives {
            expansion.text.push_str(&text[cursor..directive.range.start]);
            let result = self.resolve(&directive, &enabled).await;
            match &result.output {
                Ok(output) => {
                    expansion.text.push_str(output);
                    expansion.resolved += 1;
                }
                Err(error) => {
                    warn!(tool = %result.tool, "Tool directive failed: {error}");
                    write!(expansion.text, "[Tool error: {error}]").unwrap_or(());
                    expansion.failed += 1;
                }
            }
            expansion.results.push(result);
            cursor = directive.range.end;
        }
        expansion.text.push_str(&text[cursor..]);
        expansion
    }

    async fn resolve(&self, directive: &ToolDirective, enabled: &[ToolDescriptor]) -> ToolResult {
        let tool = if directive.is_auto() {
            match select_auto_tool(enabled, &directive.request) {
                Some(tool) => {
                    debug!(tool = %tool.name, "Auto directive resolved");
                    tool.name.clone()
                }
                None => {
                    return ToolResult {
                        tool: directive.tool.clone(),
                        request: directive.request.clone(),
                        output: Err(ToolError::NoToolsEnabled),
                    };
                }
            }
        } else {
            enabled
                .iter()
                .find(|tool| tool.name.eq_ignore_ascii_case(&directive.tool))
                .map_or_else(|| directive.tool.clone(), |tool| tool.name.clone())
        };

        let output = self.gateway.invoke(&tool, &directive.request).await;
        ToolResult {
            tool,
            request: directive.request.clone(),
            output,
        }
    }
}

/// Prompt for the follow-up call: the original prompt, the agent's expanded
/// response, and the successful tool results.
pub fn follow_up_prompt(prompt: &str, expansion: &Expansion) -> String {
    let mut follow_up = format!(
        "{prompt}\n\n## Your Previous Response\n{}\n\n## Tool Results",
        expansion.text
    );
    for result in &expansion.results {
        if let Ok(output) = &result.output {
            write!(
                follow_up,
                "\n\n### {} ({})\n{output}",
                result.tool, result.request
            )
            .unwrap_or(());
        }
    }
    follow_up.push_str(
        "\n\n## Instructions\nUsing the tool results above, write your final response. \
         Do not emit further tool directives.",
    );
    follow_up
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct StaticGateway {
        tools: Vec<ToolDescriptor>,
        responses: HashMap<String, String>,
    }

    #[async_trait]
    impl ToolGateway for StaticGateway {
        async fn list_enabled_tools(&self) -> Vec<ToolDescriptor> {
            self.tools.clone()
        }

        async fn invoke(&self, name: &str, request: &str) -> Result<String, ToolError> {
            self.responses
                .get(name)
                .map(|response| format!("{response}:{request}"))
                .ok_or_else(|| ToolError::UnknownTool(name.to_owned()))
        }
    }

    fn descriptor(name: &str, capabilities: &[&str], description: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_owned(),
            capabilities: capabilities.iter().map(|cap| (*cap).to_owned()).collect(),
            description: description.to_owned(),
        }
    }

    fn gateway() -> Arc<dyn ToolGateway> {
        Arc::new(StaticGateway {
            tools: vec![
                descriptor("Search", &["web"], "Search the web"),
                descriptor("Database", &["sql", "tables"], "Run SQL against the data warehouse"),
            ],
            responses: HashMap::from([
                ("Search".to_owned(), "found".to_owned()),
                ("Database".to_owned(), "rows".to_owned()),
            ]),
        })
    }

    #[test]
    fn test_find_directives() {
        let text = "See [TOOL:Search:rust async] and [SEARCH: tokio ] but not [TOOL:broken]";
        let directives = find_directives(text);
        assert_eq!(directives.len(), 2);
        assert_eq!(directives[0].tool, "Search");
        assert_eq!(directives[0].request, "rust async");
        assert_eq!(&text[directives[0].range.clone()], "[TOOL:Search:rust async]");
        assert_eq!(directives[1].tool, SEARCH_TOOL);
        assert_eq!(directives[1].request, "tokio");
    }

    #[test]
    fn test_auto_selection_by_category() {
        let tools = vec![
            descriptor("Search", &["web"], "Search the web"),
            descriptor("Database", &["sql", "tables"], "Run SQL against the data warehouse"),
        ];
        assert_eq!(select_auto_tool(&tools, "latest news on rust").unwrap().name, "Search");
        assert_eq!(select_auto_tool(&tools, "sql query for sales data").unwrap().name, "Database");
        assert!(select_auto_tool(&[], "anything").is_none());
    }

    #[test]
    fn test_ties_keep_first_tool() {
        let tools = vec![descriptor("alpha", &[], ""), descriptor("beta", &[], "")];
        assert_eq!(select_auto_tool(&tools, "nothing relevant").unwrap().name, "alpha");
    }

    #[test]
    fn test_bonuses() {
        let plain = descriptor("custom", &["one"], "");
        let rich = descriptor("github", &["issues", "pulls"], "");
        assert_eq!(score_tool(&plain, "hello"), 0);
        assert_eq!(score_tool(&rich, "hello"), MULTI_CAPABILITY_BONUS + WELL_KNOWN_BONUS);
    }

    #[tokio::test]
    async fn test_expand_replaces_in_place() {
        let expander = ToolInvocationExpander::new(gateway());
        let expansion = expander
            .expand("Before [TOOL:search:foo] middle [TOOL:Auto:sql data] after")
            .await;
        assert_eq!(expansion.text, "Before found:foo middle rows:sql data after");
        assert_eq!(expansion.resolved, 2);
        assert_eq!(expansion.failed, 0);
        assert_eq!(expansion.results[0].tool, "Search");
    }

    #[tokio::test]
    async fn test_expand_inlines_errors() {
        let expander = ToolInvocationExpander::new(gateway());
        let expansion = expander.expand("A [TOOL:Missing:x] B [SEARCH:y]").await;
        assert_eq!(expansion.text, "A [Tool error: unknown tool: Missing] B found:y");
        assert_eq!(expansion.resolved, 1);
        assert_eq!(expansion.failed, 1);
    }

    #[tokio::test]
    async fn test_auto_without_tools() {
        let expander = ToolInvocationExpander::new(Arc::new(StaticGateway {
            tools: Vec::new(),
            responses: HashMap::new(),
        }));
        let expansion = expander.expand("[TOOL:Auto:find it]").await;
        assert_eq!(expansion.text, "[Tool error: no tools are enabled]");
        assert!(!expansion.has_resolved());
    }

    #[tokio::test]
    async fn test_text_without_directives_is_unchanged() {
        let expander = ToolInvocationExpander::new(gateway());
        let expansion = expander.expand("plain [text]").await;
        assert_eq!(expansion.text, "plain [text]");
        assert!(expansion.results.is_empty());
    }

    #[tokio::test]
    async fn test_follow_up_prompt_lists_results() {
        let expander = ToolInvocationExpander::new(gateway());
        let expansion = expander.expand("Look: [SEARCH:foo] [TOOL:Nope:x]").await;
        let prompt = follow_up_prompt("ORIGINAL", &expansion);
        assert!(prompt.starts_with("ORIGINAL\n\n## Your Previous Response\nLook: found:foo"));
        assert!(prompt.contains("### Search (foo)\nfound:foo"));
        assert!(!prompt.contains("### Nope"));
    }
}
