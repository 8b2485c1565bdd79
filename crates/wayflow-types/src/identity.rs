use serde::{Deserialize, Serialize};

/// The caller on whose behalf an operation runs.
///
/// Authorization policy lives outside the engine; the identity is carried
/// through so access checks and audit fields have a subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub id: u64,
    #[serde(default)]
    pub name: String,
}

impl Identity {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// The engine itself (scheduled and internal operations).
    pub fn system() -> Self {
        Self::new(0, "system")
    }

    pub fn is_system(&self) -> bool {
        self.id == 0
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::system()
    }
}
