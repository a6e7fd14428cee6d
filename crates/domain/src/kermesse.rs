//! The kermesse event itself.

use common::KermesseId;
use serde::{Deserialize, Serialize};

/// The overarching event grouping stands, tickets, and lots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kermesse {
    id: KermesseId,
    name: String,
}

impl Kermesse {
    pub fn new(id: KermesseId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    pub fn id(&self) -> KermesseId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
