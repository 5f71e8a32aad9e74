//! UI context for detecting interactive vs CI environments

use std::io::IsTerminal;

/// UI context that determines output behavior
#[derive(Debug, Clone)]
pub struct UiContext {
    /// Whether running in an interactive terminal
    interactive: bool,
}

impl UiContext {
    /// Detect the current environment from stdin and stdout
    pub fn detect() -> Self {
        let interactive =
            std::io::stdout().is_terminal() && std::io::stdin().is_terminal() && !is_ci();
        Self { interactive }
    }

    /// Detect from stderr alone, for commands whose stdout carries data
    pub fn detect_stderr() -> Self {
        Self {
            interactive: std::io::stderr().is_terminal() && !is_ci(),
        }
    }

    /// Create a non-interactive context (for testing or explicit CI mode)
    pub fn non_interactive() -> Self {
        Self { interactive: false }
    }

    /// Check if we should use fancy output (spinners, colors)
    pub fn use_fancy_output(&self) -> bool {
        self.interactive
    }
}

fn is_ci() -> bool {
    // Common CI environment indicators
    let ci_vars = [
        "CI",
        "GITHUB_ACTIONS",
        "GITLAB_CI",
        "CIRCLECI",
        "TRAVIS",
        "JENKINS_URL",
        "BUILDKITE",
        "TEAMCITY_VERSION",
        "TF_BUILD",
    ];
    ci_vars.iter().any(|var| std::env::var_os(var).is_some())
}
