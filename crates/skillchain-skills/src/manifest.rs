use serde::Deserialize;

/// Environment prerequisites for a skill.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Prerequisites {
    /// Required binaries that must be on PATH (e.g., ["python3", "ffmpeg"]).
    #[serde(default)]
    pub required_binaries: Vec<String>,
    /// Required environment variables (e.g., ["EIA_API_KEY"]).
    #[serde(default)]
    pub required_env: Vec<String>,
    /// Required OS: "linux", "macos", or "windows".
    #[serde(default)]
    pub required_os: Option<String>,
}

/// TOML manifest for a command-backed skill.
///
/// Lives at `<skills_dir>/<segment>/.../<segment>/skill.toml`, one directory
/// level per identifier segment.
#[derive(Debug, Clone, Deserialize)]
pub struct SkillManifest {
    /// Hierarchical identifier (e.g., "energy.extraction.glossary").
    pub name: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// Shell command to execute. `$SKILL_DIR` is substituted
    /// with the skill's directory path at runtime.
    pub command: String,

    /// Timeout for the command in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Required input names.
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Optional input names.
    #[serde(default)]
    pub optional_inputs: Vec<String>,

    /// Output names the command may emit.
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Environment prerequisites (optional, backward-compatible).
    #[serde(default)]
    pub prerequisites: Prerequisites,
}

fn default_timeout() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_manifest() {
        let toml_str = r#"
name = "energy.extraction.glossary"
description = "Extract glossary terms"
command = "python3 $SKILL_DIR/extract.py"
timeout_secs = 15
inputs = ["text"]
optional_inputs = ["feedback"]
outputs = ["terms", "count"]

[prerequisites]
required_binaries = ["python3"]
"#;
        let manifest: SkillManifest = toml::from_str(toml_str).unwrap();
        assert_eq!(manifest.name, "energy.extraction.glossary");
        assert_eq!(manifest.timeout_secs, 15);
        assert_eq!(manifest.inputs, vec!["text"]);
        assert_eq!(manifest.optional_inputs, vec!["feedback"]);
        assert_eq!(manifest.outputs, vec!["terms", "count"]);
        assert_eq!(manifest.prerequisites.required_binaries, vec!["python3"]);
    }

    #[test]
    fn parse_minimal_manifest() {
        let toml_str = r#"
name = "echo"
command = "cat"
"#;
        let manifest: SkillManifest = toml::from_str(toml_str).unwrap();
        assert_eq!(manifest.name, "echo");
        assert_eq!(manifest.timeout_secs, 30);
        assert!(manifest.inputs.is_empty());
        assert!(manifest.outputs.is_empty());
        assert!(manifest.description.is_empty());
    }

    #[test]
    fn missing_command_is_rejected() {
        let toml_str = r#"name = "no_command""#;
        assert!(toml::from_str::<SkillManifest>(toml_str).is_err());
    }
}
