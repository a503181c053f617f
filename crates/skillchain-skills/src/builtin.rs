//! In-process skills registered under the `builtin.` namespace.

use std::sync::Arc;

use skillchain_core::traits::Skill;
use skillchain_core::types::{SkillError, SkillOutputs};

use crate::func::FnSkill;

pub const PASSTHROUGH: &str = "builtin.passthrough";
pub const COUNTER_INCREMENT: &str = "builtin.counter.increment";

/// All builtin skills, keyed by identifier.
pub fn builtins() -> Vec<(String, Arc<dyn Skill>)> {
    vec![
        (PASSTHROUGH.to_string(), Arc::new(passthrough()) as Arc<dyn Skill>),
        (COUNTER_INCREMENT.to_string(), Arc::new(counter_increment())),
    ]
}

/// Copies every input to an output of the same name.
fn passthrough() -> FnSkill {
    FnSkill::new(PASSTHROUGH, Ok).with_optional_inputs(&["value"]).with_outputs(&["value"])
}

/// `value` + 1 (integers only).
fn counter_increment() -> FnSkill {
    FnSkill::new(COUNTER_INCREMENT, |inputs| {
        let value = inputs
            .get("value")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| SkillError::invalid_input("'value' must be an integer"))?;
        Ok(SkillOutputs::from([(
            "value".to_string(),
            serde_json::json!(value + 1),
        )]))
    })
    .with_inputs(&["value"])
    .with_outputs(&["value"])
}
