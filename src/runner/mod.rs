//! Agent runners: shell invocations executed inside a fork's sandbox.
//!
//! A runner turns an [`AgentInvocation`] into the command line for its CLI and
//! knows how to read cost accounting back out of that CLI's output.

mod claude;
mod usage;

pub use claude::ClaudeRunner;
pub use usage::{parse_usage, AgentUsage};

/// What to ask the agent for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInvocation {
    /// The prompt to send.
    pub prompt: String,
    /// Model to use (e.g., "sonnet", "opus").
    pub model: Option<String>,
    /// Maximum agentic turns before the CLI stops on its own.
    pub max_turns: u32,
    /// Checkout directory inside the sandbox.
    pub workdir: String,
}

/// Trait for agent CLIs runnable inside a sandbox.
pub trait AgentRunner: Send + Sync {
    /// Builds the shell command that runs the agent in `invocation.workdir`.
    fn build_command(&self, invocation: &AgentInvocation) -> String;

    /// Extracts usage from the agent's stdout. Never fails.
    fn parse_usage(&self, stdout: &str) -> AgentUsage {
        parse_usage(stdout)
    }

    /// Returns the name of this runner.
    fn name(&self) -> &str;
}

/// Quotes a value for POSIX `sh`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Commands that put the target repository at the right branch inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoCheckout {
    /// Clone URL.
    pub repo_url: String,
    /// Branch the agent works on.
    pub branch: String,
    /// Checkout directory inside the sandbox.
    pub workdir: String,
}

impl RepoCheckout {
    /// Clones the repository unless a previous attempt already did.
    pub fn clone_command(&self) -> String {
        let workdir = shell_quote(&self.workdir);
        format!(
            "[ -d {workdir}/.git ] || git clone {} {workdir}",
            shell_quote(&self.repo_url)
        )
    }

    /// Creates the working branch.
    pub fn create_branch_command(&self) -> String {
        format!(
            "cd {} && git checkout -b {}",
            shell_quote(&self.workdir),
            shell_quote(&self.branch)
        )
    }

    /// Switches to the working branch when it already exists locally.
    pub fn switch_branch_command(&self) -> String {
        format!(
            "cd {} && git checkout {}",
            shell_quote(&self.workdir),
            shell_quote(&self.branch)
        )
    }

    /// Returns true if `git checkout -b` failed only because the branch exists.
    pub fn is_branch_exists_error(stderr: &str) -> bool {
        stderr.contains("already exists")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkout() -> RepoCheckout {
        RepoCheckout {
            repo_url: "https://github.com/acme/widgets.git".to_string(),
            branch: "feature/x".to_string(),
            workdir: "repo".to_string(),
        }
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn clone_command_skips_existing_checkout() {
        assert_eq!(
            checkout().clone_command(),
            "[ -d 'repo'/.git ] || git clone 'https://github.com/acme/widgets.git' 'repo'"
        );
    }

    #[test]
    fn branch_commands_run_in_workdir() {
        let checkout = checkout();
        assert_eq!(
            checkout.create_branch_command(),
            "cd 'repo' && git checkout -b 'feature/x'"
        );
        assert_eq!(
            checkout.switch_branch_command(),
            "cd 'repo' && git checkout 'feature/x'"
        );
    }

    #[test]
    fn detects_branch_exists_error() {
        assert!(RepoCheckout::is_branch_exists_error(
            "fatal: a branch named 'feature/x' already exists"
        ));
        assert!(!RepoCheckout::is_branch_exists_error(
            "fatal: not a git repository"
        ));
    }
}
