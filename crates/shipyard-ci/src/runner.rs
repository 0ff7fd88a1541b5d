//! External command execution for stage collaborators.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;

/// One command invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Label used in errors and logs.
    pub name: String,

    /// First element is the executable.
    pub argv: Vec<String>,

    pub timeout: Duration,

    pub working_dir: Option<PathBuf>,

    /// Extra environment for the child.
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(name: impl Into<String>, argv: Vec<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            argv,
            timeout,
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub name: String,

    /// Exit code (-1 when killed by a signal).
    pub exit_code: i32,

    pub stdout: String,

    pub stderr: String,

    pub duration_ms: u64,

    pub success: bool,
}

impl CommandOutput {
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0
    }

    /// Turn a non-zero exit into an error carrying the end of stderr.
    pub fn check(self) -> anyhow::Result<Self> {
        if self.passed() {
            return Ok(self);
        }
        anyhow::bail!(
            "{} exited with code {}: {}",
            self.name,
            self.exit_code,
            tail(&self.stderr, 20)
        )
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim_end().lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// Replace `{key}` placeholders in every argument.
///
/// Unknown placeholders are left untouched.
pub fn render_argv(template: &[String], vars: &BTreeMap<&str, String>) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (key, value)| {
                acc.replace(&format!("{{{key}}}"), value)
            })
        })
        .collect()
}

/// Runs commands with a timeout, capturing output.
pub struct CommandRunner;

impl CommandRunner {
    /// Execute a command and capture its output.
    ///
    /// The child is killed if it outlives `timeout` or if the returned
    /// future is dropped.
    pub async fn execute(spec: &CommandSpec) -> anyhow::Result<CommandOutput> {
        let start = Instant::now();

        let Some((exe, args)) = spec.argv.split_first() else {
            anyhow::bail!("command {} is empty", spec.name);
        };

        let mut command = Command::new(exe);
        command
            .args(args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        tracing::debug!(command = %spec.name, argv = ?spec.argv, "spawning");
        let child = command
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn {} ({exe}): {e}", spec.name))?;

        let output = tokio::time::timeout(spec.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "{} timed out after {} seconds",
                    spec.name,
                    spec.timeout.as_secs()
                )
            })??;

        let exit_code = output.status.code().unwrap_or(-1);
        Ok(CommandOutput {
            name: spec.name.clone(),
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
            success: output.status.success(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(argv: &[&str]) -> CommandSpec {
        CommandSpec::new(
            "probe",
            argv.iter().map(|s| s.to_string()).collect(),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn test_render_argv() {
        let mut vars = BTreeMap::new();
        vars.insert("branch", "release/2.1".to_string());
        vars.insert("build_id", "42".to_string());
        let argv = vec![
            "deploy".to_string(),
            "--ref={branch}@{build_id}".to_string(),
            "{unknown}".to_string(),
        ];
        assert_eq!(
            render_argv(&argv, &vars),
            ["deploy", "--ref=release/2.1@42", "{unknown}"]
        );
    }

    #[test]
    fn test_check_reports_stderr_tail() {
        let output = CommandOutput {
            name: "push".to_string(),
            exit_code: 1,
            stdout: String::new(),
            stderr: "denied: requested access to the resource is denied\n".to_string(),
            duration_ms: 5,
            success: false,
        };
        let err = output.check().unwrap_err();
        assert!(err.to_string().contains("push exited with code 1"));
        assert!(err.to_string().contains("denied"));
    }

    #[tokio::test]
    async fn test_execute_simple_command() {
        let result = CommandRunner::execute(&spec(&["echo", "hello"]))
            .await
            .expect("execute failed");
        assert!(result.passed());
        assert!(result.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_execute_failing_command() {
        let result = CommandRunner::execute(&spec(&["false"]))
            .await
            .expect("execute failed");
        assert!(!result.passed());
        assert_ne!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn test_execute_passes_env() {
        let result = CommandRunner::execute(
            &spec(&["sh", "-c", "echo $SHIPYARD_BRANCH"]).with_env("SHIPYARD_BRANCH", "develop"),
        )
        .await
        .unwrap();
        assert_eq!(result.stdout.trim(), "develop");
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let mut s = spec(&["sleep", "5"]);
        s.timeout = Duration::from_millis(100);
        let err = CommandRunner::execute(&s).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_execute_empty_command() {
        assert!(CommandRunner::execute(&spec(&[])).await.is_err());
    }

    #[tokio::test]
    async fn test_execute_missing_executable() {
        let err = CommandRunner::execute(&spec(&["shipyard-no-such-tool"]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }
}
