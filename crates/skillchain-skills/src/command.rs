use std::path::PathBuf;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use skillchain_core::traits::Skill;
use skillchain_core::types::{SkillContext, SkillError, SkillInputs, SkillOutputs};

use crate::manifest::SkillManifest;

/// A skill backed by a shell command from a skill manifest.
///
/// Inputs are written to stdin as one JSON object; stdout must be a JSON
/// object whose keys are the skill's outputs.
pub struct CommandSkill {
    manifest: SkillManifest,
    skill_dir: PathBuf,
}

impl CommandSkill {
    pub fn new(manifest: SkillManifest, skill_dir: PathBuf) -> Self {
        Self {
            manifest,
            skill_dir,
        }
    }

    pub fn description(&self) -> &str {
        &self.manifest.description
    }

    pub fn skill_dir(&self) -> &std::path::Path {
        &self.skill_dir
    }
}

impl Skill for CommandSkill {
    fn name(&self) -> &str {
        &self.manifest.name
    }

    fn required_inputs(&self) -> &[String] {
        &self.manifest.inputs
    }

    fn optional_inputs(&self) -> &[String] {
        &self.manifest.optional_inputs
    }

    fn outputs(&self) -> &[String] {
        &self.manifest.outputs
    }

    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(self.manifest.timeout_secs))
    }

    fn execute(
        &self,
        inputs: SkillInputs,
        ctx: SkillContext,
    ) -> BoxFuture<'_, Result<SkillOutputs, SkillError>> {
        let command = self
            .manifest
            .command
            .replace("$SKILL_DIR", &self.skill_dir.display().to_string());
        let skill_dir = self.skill_dir.clone();

        Box::pin(async move {
            let input_bytes = serde_json::to_vec(&inputs)
                .map_err(|e| SkillError::invalid_input(format!("inputs are not JSON: {}", e)))?;

            debug!(command = %command, node_id = %ctx.node_id, "Executing skill command");

            let mut cmd = if cfg!(windows) {
                let mut c = tokio::process::Command::new("cmd");
                c.arg("/C").arg(&command);
                c
            } else {
                let mut c = tokio::process::Command::new("bash");
                c.arg("-c").arg(&command);
                c
            };
            let mut child = cmd
                .current_dir(&skill_dir)
                .env("SKILLCHAIN_RUN_ID", &ctx.run_id.0)
                .env("SKILLCHAIN_NODE_ID", &ctx.node_id)
                .env("SKILLCHAIN_ATTEMPT", ctx.attempt.to_string())
                .stdin(std::process::Stdio::piped())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| SkillError::new("spawn_failed", e.to_string()))?;

            // Write JSON input to stdin
            if let Some(mut stdin) = child.stdin.take() {
                use tokio::io::AsyncWriteExt;
                stdin.write_all(&input_bytes).await.ok();
                // Drop stdin to close it so the child can read EOF
            }

            let output = tokio::select! {
                out = child.wait_with_output() => {
                    out.map_err(|e| SkillError::internal(e.to_string()))?
                }
                _ = ctx.cancel.cancelled() => {
                    return Err(SkillError::new("cancelled", "run cancelled"));
                }
            };

            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();

            if !output.status.success() {
                let msg = if stderr.is_empty() { stdout } else { stderr };
                return Err(SkillError::new(
                    "exit_status",
                    format!(
                        "Exit code {}\n{}",
                        output.status.code().unwrap_or(-1),
                        msg.trim()
                    ),
                ));
            }

            parse_outputs(&stdout)
        })
    }
}

/// Parse a command's stdout into named outputs. Empty output means no outputs.
fn parse_outputs(stdout: &str) -> Result<SkillOutputs, SkillError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(SkillOutputs::new());
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::Object(map)) => Ok(map.into_iter().collect()),
        Ok(other) => Err(SkillError::new(
            "invalid_output",
            format!("expected a JSON object on stdout, got {}", type_name(&other)),
        )),
        Err(e) => Err(SkillError::new(
            "invalid_output",
            format!("stdout is not JSON: {}", e),
        )),
    }
}

fn type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_object_outputs() {
        let out = parse_outputs(r#"{"terms": ["a", "b"], "count": 2}"#).unwrap();
        assert_eq!(out["count"], serde_json::json!(2));
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn parse_empty_outputs() {
        assert!(parse_outputs("  \n").unwrap().is_empty());
    }

    #[test]
    fn reject_non_object_outputs() {
        let err = parse_outputs("[1, 2]").unwrap_err();
        assert_eq!(err.code, "invalid_output");
        assert!(err.message.contains("an array"));

        let err = parse_outputs("not json").unwrap_err();
        assert_eq!(err.code, "invalid_output");
    }
}

#[cfg(test)]
#[cfg(unix)]
mod process_tests {
    use super::*;
    use skillchain_core::types::RunId;

    fn test_ctx() -> SkillContext {
        SkillContext {
            run_id: RunId::new(),
            node_id: "n1".into(),
            attempt: 1,
            cancel: Default::default(),
        }
    }

    fn manifest(name: &str, command: &str) -> SkillManifest {
        SkillManifest {
            name: name.into(),
            description: String::new(),
            command: command.into(),
            timeout_secs: 5,
            inputs: vec!["text".into()],
            optional_inputs: vec![],
            outputs: vec!["text".into()],
            prerequisites: Default::default(),
        }
    }

    #[tokio::test]
    async fn command_skill_echo() {
        let skill = CommandSkill::new(manifest("test.echo", "cat"), std::env::temp_dir());
        let mut inputs = SkillInputs::new();
        inputs.insert("text".into(), serde_json::json!("hello"));
        // cat echoes back the JSON input
        let out = skill.execute(inputs, test_ctx()).await.unwrap();
        assert_eq!(out["text"], serde_json::json!("hello"));
    }

    #[tokio::test]
    async fn command_skill_failure() {
        let skill = CommandSkill::new(manifest("test.fail", "exit 42"), std::env::temp_dir());
        let err = skill.execute(SkillInputs::new(), test_ctx()).await.unwrap_err();
        assert_eq!(err.code, "exit_status");
        assert!(err.message.contains("Exit code 42"));
    }

    #[tokio::test]
    async fn command_skill_sees_attempt() {
        let skill = CommandSkill::new(
            manifest("test.attempt", r#"echo "{\"attempt\": $SKILLCHAIN_ATTEMPT}""#),
            std::env::temp_dir(),
        );
        let out = skill.execute(SkillInputs::new(), test_ctx()).await.unwrap();
        assert_eq!(out["attempt"], serde_json::json!(1));
    }
}
