//! Claude Code CLI runner.

use super::{shell_quote, AgentInvocation, AgentRunner};

/// Runner for Claude Code CLI.
#[derive(Debug, Clone)]
pub struct ClaudeRunner {
    /// Path to the claude CLI binary inside the sandbox.
    cli_path: String,
}

impl Default for ClaudeRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ClaudeRunner {
    /// Creates a new Claude runner using the default `claude` command.
    pub fn new() -> Self {
        Self {
            cli_path: "claude".to_string(),
        }
    }

    /// Creates a new Claude runner with a custom CLI path.
    pub fn with_cli_path(cli_path: impl Into<String>) -> Self {
        Self {
            cli_path: cli_path.into(),
        }
    }

    /// Builds the CLI arguments for one invocation.
    fn build_args(&self, invocation: &AgentInvocation) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(), // Non-interactive mode
            // The sandbox provides isolation, so no interactive permission prompts
            "--dangerously-skip-permissions".to_string(),
            // stream-json ends with a result line carrying cost and usage
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(), // Required for stream-json
            "--max-turns".to_string(),
            invocation.max_turns.to_string(),
        ];

        if let Some(model) = &invocation.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        args.push("-p".to_string());
        args.push(invocation.prompt.clone());

        args
    }
}

impl AgentRunner for ClaudeRunner {
    fn build_command(&self, invocation: &AgentInvocation) -> String {
        let args = self
            .build_args(invocation)
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ");

        format!(
            "cd {} && {} {}",
            shell_quote(&invocation.workdir),
            shell_quote(&self.cli_path),
            args
        )
    }

    fn name(&self) -> &str {
        "claude-code"
    }
}
