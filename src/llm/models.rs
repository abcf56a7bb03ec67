use serde::{Deserialize, Serialize};

// Prompt handed to a completion backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }

    /// Single-string form for backends without chat roles.
    pub fn flattened(&self) -> String {
        format!("{}\n\n{}", self.system, self.user)
    }
}
