use std::path::PathBuf;
use std::process::Stdio;

use super::{CommandOutput, CommandRunner, ToolError};

/// 512 KB cap per captured stream.
const MAX_OUTPUT: usize = 512_000;

/// Runs commands through `$SHELL -c` (or `bash`) and waits for them to exit.
pub struct ShellRunner {
    shell_path: String,
    cwd: PathBuf,
}

impl ShellRunner {
    pub fn new() -> Self {
        let shell_path = std::env::var("SHELL").unwrap_or_else(|_| "bash".into());
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self { shell_path, cwd }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn with_shell(mut self, shell_path: impl Into<String>) -> Self {
        self.shell_path = shell_path.into();
        self
    }

    /// The shell program that will execute commands (e.g. "zsh", "bash").
    pub fn shell_name(&self) -> &str {
        self.shell_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.shell_path)
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str) -> Result<CommandOutput, ToolError> {
        tracing::debug!(command, shell = self.shell_name(), "running command");
        let output = tokio::process::Command::new(&self.shell_path)
            .arg("-c")
            .arg(command)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        Ok(CommandOutput {
            stdout: capped(&output.stdout),
            stderr: capped(&output.stderr),
            exit_code: output.status.code(),
        })
    }
}

fn capped(bytes: &[u8]) -> String {
    let mut text = String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_OUTPUT)]).into_owned();
    if bytes.len() > MAX_OUTPUT {
        text.push_str("\n[output truncated]");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn runner(dir: &TempDir) -> ShellRunner {
        ShellRunner::new().with_shell("sh").with_cwd(dir.path())
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let dir = TempDir::new().unwrap();
        let out = runner(&dir).run("echo hello").await.unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert!(out.succeeded());
    }

    #[tokio::test]
    async fn captures_stderr_and_failure() {
        let dir = TempDir::new().unwrap();
        let out = runner(&dir).run("echo oops >&2; exit 3").await.unwrap();
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.succeeded());
    }

    #[tokio::test]
    async fn runs_in_configured_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let out = runner(&dir).run("ls").await.unwrap();
        assert!(out.stdout.contains("marker.txt"));
    }

    #[test]
    fn shell_name_strips_directories() {
        let shell = ShellRunner::new().with_shell("/usr/bin/zsh");
        assert_eq!(shell.shell_name(), "zsh");
    }
}
