//! Static wiring between modules of the same rule

use serde::{Deserialize, Serialize};

/// Declares that one input of a condition or action is fed from a named
/// output of another module in the same rule
///
/// The source must be an output-producing module (a trigger or an action).
/// Connections are resolved into live output references the first time the
/// rule executes after binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Name of the input on the declaring module
    pub input_name: String,

    /// Id of the module producing the value
    pub source_module_id: String,

    /// Name of the output on the source module
    pub source_output_name: String,
}

impl Connection {
    /// Create a connection
    pub fn new(
        input_name: impl Into<String>,
        source_module_id: impl Into<String>,
        source_output_name: impl Into<String>,
    ) -> Self {
        Self {
            input_name: input_name.into(),
            source_module_id: source_module_id.into(),
            source_output_name: source_output_name.into(),
        }
    }
}
