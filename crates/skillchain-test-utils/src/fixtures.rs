//! Chain definitions shared by engine and CLI tests.

/// A → B → C, each node incrementing `value` via `test.increment`.
pub const LINEAR_CHAIN: &str = r#"
chain_name = "linear"
graph_type = "DAG"
inputs = ["value"]

[[nodes]]
id = "a"
skill = "test.increment"
inputs = { value = "value" }
outputs = { value = "value" }

[[nodes]]
id = "b"
skill = "test.increment"
inputs = { value = "value" }
outputs = { value = "value" }

[[nodes]]
id = "c"
skill = "test.increment"
inputs = { value = "value" }
outputs = { value = "value" }

[[edges]]
from = "a"
to = "b"

[[edges]]
from = "b"
to = "c"
"#;

/// A → {B, C} → D.
pub const DIAMOND_CHAIN: &str = r#"
chain_name = "diamond"
graph_type = "DAG"

[[nodes]]
id = "a"
skill = "test.seed"
outputs = { value = "value" }

[[nodes]]
id = "b"
skill = "test.add_two"
inputs = { value = "value" }
outputs = { b_out = "b_out" }

[[nodes]]
id = "c"
skill = "test.triple"
inputs = { value = "value" }
outputs = { c_out = "c_out" }

[[nodes]]
id = "d"
skill = "test.sum"
inputs = { b_out = "b_out", c_out = "c_out" }
outputs = { sum = "sum" }

[[edges]]
from = "a"
to = "b"

[[edges]]
from = "a"
to = "c"

[[edges]]
from = "b"
to = "d"

[[edges]]
from = "c"
to = "d"
"#;

/// extract → validate, with `validate → extract` re-entering while
/// `not valid`, at most 3 times.
pub const FEEDBACK_CHAIN: &str = r#"
chain_name = "extract-validate"
graph_type = "DCG"
inputs = ["text"]

[[nodes]]
id = "extract"
skill = "test.extract"
outputs = ["terms"]

[nodes.inputs]
text = "text"
feedback = { key = "validate.feedback", optional = true }

[[nodes]]
id = "validate"
skill = "test.validate"
inputs = { terms = "extract.terms" }
outputs = { valid = "valid", feedback = "validate.feedback" }

[[edges]]
from = "extract"
to = "validate"

[[edges]]
from = "validate"
to = "extract"
condition = "not valid"
max_iterations = 3
"#;
