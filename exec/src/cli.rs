use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use quarry_core::ConfigOverrides;

/// Headless analysis session against a warehouse project.
#[derive(Parser, Debug)]
#[command(name = "quarry", version)]
pub struct Cli {
    /// Warehouse project to analyze.
    #[arg(long, short = 'p')]
    pub project: String,

    /// Dataset to analyze. Prompts interactively when omitted.
    #[arg(long, short = 'd')]
    pub dataset: Option<String>,

    /// Analytical task in free-form text. Prompts interactively when
    /// omitted.
    #[arg(long, short = 't')]
    pub task: Option<String>,

    /// Emit events as JSONL on stdout instead of human output.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Base URL of the warehouse REST endpoint.
    #[arg(long, env = "QUARRY_WAREHOUSE_URL")]
    pub warehouse_url: String,

    /// Base URL of the chat-completions endpoint.
    #[arg(long, env = "QUARRY_LLM_URL", default_value = "https://api.openai.com/v1")]
    pub llm_url: String,

    /// Model to request from the LLM provider.
    #[arg(long, short = 'm', env = "QUARRY_LLM_MODEL", default_value = "gpt-5")]
    pub model: String,

    /// Directory for spilled result sets. Defaults to `~/.quarry/memory`.
    #[arg(long, value_name = "DIR")]
    pub memory_dir: Option<PathBuf>,

    /// Upper bound on queries synthesized per task.
    #[arg(long)]
    pub max_queries: Option<usize>,

    /// Session token budget for LLM calls.
    #[arg(long)]
    pub token_budget: Option<i64>,

    /// Session wall-clock timeout in seconds.
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,
}

impl Cli {
    pub fn config_overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            max_queries: self.max_queries,
            token_budget_session: self.token_budget,
            deadline_session: self.timeout.map(Duration::from_secs),
            ..ConfigOverrides::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_invocation() {
        let cli = Cli::parse_from([
            "quarry",
            "--project",
            "acme-analytics",
            "--warehouse-url",
            "http://localhost:9050",
        ]);
        assert_eq!(cli.project, "acme-analytics");
        assert!(cli.dataset.is_none());
        assert!(!cli.json);
    }

    #[test]
    fn overrides_map_to_config() {
        let cli = Cli::parse_from([
            "quarry",
            "--project",
            "acme",
            "--warehouse-url",
            "http://localhost:9050",
            "--max-queries",
            "2",
            "--timeout",
            "30",
        ]);
        let overrides = cli.config_overrides();
        assert_eq!(overrides.max_queries, Some(2));
        assert_eq!(overrides.deadline_session, Some(Duration::from_secs(30)));
    }
}
