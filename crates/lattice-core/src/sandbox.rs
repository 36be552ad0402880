//! Sandboxed script execution collaborators for javascript and bash nodes.
//!
//! The engine treats user code as opaque: a script plus named inputs goes
//! in, an output (or an error) comes out, bounded by a timeout. The
//! process-backed defaults here spawn `bash -c` / `node -e` and kill the
//! child on expiry.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::agent::service::resolve_binary;
use crate::{LatticeError, Result};

/// Outcome of a bash script run.
#[derive(Debug, Clone)]
pub struct ShellResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[async_trait]
pub trait BashSandbox: Send + Sync {
    async fn run(
        &self,
        script: &str,
        env: &[(String, String)],
        cwd: Option<&str>,
        timeout: Duration,
    ) -> Result<ShellResult>;
}

#[async_trait]
pub trait JsSandbox: Send + Sync {
    /// Run `code` with `inputs` bound as named globals; the script's final
    /// expression (or returned promise) is the result.
    async fn run(
        &self,
        code: &str,
        inputs: &HashMap<String, Value>,
        timeout: Duration,
    ) -> Result<Value>;
}

/// The default sandbox pair handed to the executor registry.
pub struct SandboxSet {
    pub bash: std::sync::Arc<dyn BashSandbox>,
    pub js: std::sync::Arc<dyn JsSandbox>,
}

impl SandboxSet {
    pub fn process_backed(node_path: Option<String>) -> Self {
        Self {
            bash: std::sync::Arc::new(ProcessBashSandbox),
            js: std::sync::Arc::new(NodeJsSandbox::new(node_path)),
        }
    }
}

async fn wait_with_timeout(
    mut child: tokio::process::Child,
    timeout: Duration,
    what: &str,
) -> Result<std::process::Output> {
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => Ok(output?),
        Err(_) => {
            // Dropping the raced future drops the child; kill_on_drop
            // reaps it.
            Err(LatticeError::Sandbox(format!(
                "{what} timed out after {}ms",
                timeout.as_millis()
            )))
        }
    }
}

/// `bash -c` runner.
pub struct ProcessBashSandbox;

#[async_trait]
impl BashSandbox for ProcessBashSandbox {
    async fn run(
        &self,
        script: &str,
        env: &[(String, String)],
        cwd: Option<&str>,
        timeout: Duration,
    ) -> Result<ShellResult> {
        let mut command = Command::new("bash");
        command
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            command.env(key, value);
        }
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let child = command
            .spawn()
            .map_err(|e| LatticeError::Sandbox(format!("failed to spawn bash: {e}")))?;

        let output = wait_with_timeout(child, timeout, "bash script").await?;
        let result = ShellResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        };
        debug!(exit_code = result.exit_code, "bash script finished");
        Ok(result)
    }
}

/// `node -e` runner. Inputs travel through an env var; the result comes
/// back on stdout behind a marker so user prints don't corrupt it.
pub struct NodeJsSandbox {
    configured_path: Option<String>,
}

const RESULT_MARKER: &str = "__LATTICE_RESULT__";

impl NodeJsSandbox {
    pub fn new(configured_path: Option<String>) -> Self {
        Self { configured_path }
    }

    fn wrap(code: &str) -> String {
        format!(
            r#"
const __inputs = JSON.parse(process.env.LATTICE_INPUTS || "{{}}");
for (const [__k, __v] of Object.entries(__inputs)) {{ globalThis[__k] = __v; }}
const __run = async () => {{ {code} }};
__run().then((__r) => {{
    process.stdout.write("\n{RESULT_MARKER}" + JSON.stringify(__r === undefined ? null : __r));
}}).catch((__e) => {{
    console.error(String(__e && __e.stack || __e));
    process.exit(1);
}});
"#
        )
    }
}

#[async_trait]
impl JsSandbox for NodeJsSandbox {
    async fn run(
        &self,
        code: &str,
        inputs: &HashMap<String, Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let binary = resolve_binary(self.configured_path.as_deref(), &["node"])
            .ok_or_else(|| LatticeError::Sandbox("node binary not found".into()))?;

        let inputs_json = serde_json::to_string(inputs)?;
        let child = Command::new(binary)
            .arg("-e")
            .arg(Self::wrap(code))
            .env("LATTICE_INPUTS", inputs_json)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LatticeError::Sandbox(format!("failed to spawn node: {e}")))?;

        let output = wait_with_timeout(child, timeout, "javascript").await?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LatticeError::Sandbox(format!(
                "javascript failed: {}",
                stderr.trim()
            )));
        }

        let Some(idx) = stdout.rfind(RESULT_MARKER) else {
            return Err(LatticeError::Sandbox(
                "javascript produced no result".into(),
            ));
        };
        let raw = &stdout[idx + RESULT_MARKER.len()..];
        Ok(serde_json::from_str(raw.trim())
            .map_err(|e| LatticeError::Sandbox(format!("unparseable javascript result: {e}")))?)
    }
}

// ---------------------------------------------------------------------------
// In-memory fakes (tests)
// ---------------------------------------------------------------------------

/// Canned bash results keyed by a substring of the script.
#[derive(Default)]
pub struct FakeBashSandbox {
    pub results: std::sync::Mutex<Vec<(String, ShellResult)>>,
}

#[async_trait]
impl BashSandbox for FakeBashSandbox {
    async fn run(
        &self,
        script: &str,
        _env: &[(String, String)],
        _cwd: Option<&str>,
        _timeout: Duration,
    ) -> Result<ShellResult> {
        let results = self.results.lock().unwrap();
        for (needle, result) in results.iter() {
            if script.contains(needle.as_str()) {
                return Ok(result.clone());
            }
        }
        Ok(ShellResult {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        })
    }
}

/// Echoes its inputs back as the result.
pub struct FakeJsSandbox;

#[async_trait]
impl JsSandbox for FakeJsSandbox {
    async fn run(
        &self,
        _code: &str,
        inputs: &HashMap<String, Value>,
        _timeout: Duration,
    ) -> Result<Value> {
        Ok(serde_json::to_value(inputs)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bash_captures_streams_and_exit_code() {
        let sandbox = ProcessBashSandbox;
        let result = sandbox
            .run(
                "echo out; echo err >&2; exit 3",
                &[],
                None,
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr.trim(), "err");
        assert_eq!(result.exit_code, 3);
    }

    #[tokio::test]
    async fn bash_env_injection() {
        let sandbox = ProcessBashSandbox;
        let result = sandbox
            .run(
                "echo \"$GREETING\"",
                &[("GREETING".into(), "hello".into())],
                None,
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn bash_timeout_kills_script() {
        let sandbox = ProcessBashSandbox;
        let err = sandbox
            .run("sleep 30", &[], None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn fake_bash_matches_by_substring() {
        let fake = FakeBashSandbox::default();
        fake.results.lock().unwrap().push((
            "deploy".into(),
            ShellResult {
                stdout: "deployed".into(),
                stderr: String::new(),
                exit_code: 0,
            },
        ));
        let result = fake
            .run("./deploy.sh", &[], None, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result.stdout, "deployed");
    }
}
