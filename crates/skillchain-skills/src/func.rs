use futures::future::BoxFuture;

use skillchain_core::traits::Skill;
use skillchain_core::types::{SkillContext, SkillError, SkillInputs, SkillOutputs};

type SkillFn = dyn Fn(SkillInputs) -> Result<SkillOutputs, SkillError> + Send + Sync;

/// An in-process skill backed by a closure.
pub struct FnSkill {
    name: String,
    inputs: Vec<String>,
    optional_inputs: Vec<String>,
    outputs: Vec<String>,
    func: Box<SkillFn>,
}

impl FnSkill {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(SkillInputs) -> Result<SkillOutputs, SkillError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            inputs: vec![],
            optional_inputs: vec![],
            outputs: vec![],
            func: Box::new(func),
        }
    }

    /// Set the required inputs.
    pub fn with_inputs(mut self, inputs: &[&str]) -> Self {
        self.inputs = inputs.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Set the optional inputs.
    pub fn with_optional_inputs(mut self, inputs: &[&str]) -> Self {
        self.optional_inputs = inputs.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Set the declared outputs.
    pub fn with_outputs(mut self, outputs: &[&str]) -> Self {
        self.outputs = outputs.iter().map(|s| s.to_string()).collect();
        self
    }
}

impl Skill for FnSkill {
    fn name(&self) -> &str {
        &self.name
    }

    fn required_inputs(&self) -> &[String] {
        &self.inputs
    }

    fn optional_inputs(&self) -> &[String] {
        &self.optional_inputs
    }

    fn outputs(&self) -> &[String] {
        &self.outputs
    }

    fn execute(
        &self,
        inputs: SkillInputs,
        _ctx: SkillContext,
    ) -> BoxFuture<'_, Result<SkillOutputs, SkillError>> {
        let result = (self.func)(inputs);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skillchain_core::types::RunId;

    #[tokio::test]
    async fn fn_skill_runs_closure() {
        let skill = FnSkill::new("math.double", |inputs| {
            let n = inputs
                .get("n")
                .and_then(|v| v.as_i64())
                .ok_or_else(|| SkillError::invalid_input("n must be an integer"))?;
            Ok(SkillOutputs::from([("n".to_string(), serde_json::json!(n * 2))]))
        })
        .with_inputs(&["n"])
        .with_outputs(&["n"]);

        assert_eq!(skill.name(), "math.double");
        assert_eq!(skill.required_inputs(), ["n".to_string()]);

        let ctx = SkillContext {
            run_id: RunId::new(),
            node_id: "double".into(),
            attempt: 1,
            cancel: Default::default(),
        };
        let inputs = SkillInputs::from([("n".to_string(), serde_json::json!(21))]);
        let out = skill.execute(inputs, ctx.clone()).await.unwrap();
        assert_eq!(out["n"], serde_json::json!(42));

        let err = skill.execute(SkillInputs::new(), ctx).await.unwrap_err();
        assert_eq!(err.code, "invalid_input");
    }
}
