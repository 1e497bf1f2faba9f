//! Agent roster files: a list of `[[agents]]` tables.

use std::path::Path;

use anyhow::{Context as _, Result, bail};
use chorus_core::AgentSpec;
use serde::Deserialize;
use tokio::fs as async_fs;

#[derive(Debug, Deserialize)]
struct RosterFile {
    #[serde(default)]
    agents: Vec<AgentSpec>,
}

/// Parses roster TOML into validated specs, ascending by agent number.
///
/// # Errors
/// Returns an error if the TOML is malformed, the roster is empty, or a spec
/// fails validation.
pub fn parse_roster(contents: &str) -> Result<Vec<AgentSpec>> {
    let roster: RosterFile = toml::from_str(contents).context("Invalid roster file")?;
    if roster.agents.is_empty() {
        bail!("Roster has no [[agents]] entries");
    }
    let mut agents = roster.agents;
    for agent in &agents {
        agent.validate()?;
    }
    agents.sort_by_key(|agent| agent.agent_number);
    Ok(agents)
}

/// Reads and parses a roster file.
///
/// # Errors
/// Returns an error if the file cannot be read or [`parse_roster`] fails.
pub async fn load_roster(path: &Path) -> Result<Vec<AgentSpec>> {
    let contents = async_fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read roster {}", path.display()))?;
    parse_roster(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::{ProviderKind, TokenMode};

    #[test]
    fn test_parse_roster() {
        let agents = parse_roster(
            r#"
[[agents]]
agent_number = 2
provider = "groq"
model = "llama-3.3-70b-versatile"
depends_on = [1]
token_mode = "manual"
manual_cap = 600

[[agents]]
agent_number = 1
provider = "mock"
model = "draft"
instructions = "Outline the answer."
tool_enabled = true
"#,
        )
        .unwrap();

        assert_eq!(agents.len(), 2);
        assert_eq!(agents[0].agent_number, 1);
        assert_eq!(agents[0].provider, ProviderKind::Mock);
        assert!(agents[0].tool_enabled);
        assert_eq!(agents[1].token_mode, TokenMode::Manual);
        assert_eq!(agents[1].manual_cap, 600);
        assert_eq!(agents[1].depends_on, Some(vec![1]));
    }

    #[test]
    fn test_empty_roster_is_rejected() {
        let err = parse_roster("").unwrap_err();
        assert!(err.to_string().contains("no [[agents]]"));
    }

    #[test]
    fn test_forward_dependency_is_rejected() {
        let result = parse_roster(
            r#"
[[agents]]
agent_number = 1
provider = "mock"
model = "draft"
depends_on = [2]
"#,
        );
        assert!(result.is_err());
    }
}
