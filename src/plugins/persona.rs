use crate::core::error::CustodesError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The four AI personas. Each owns one metrics row and its own proposal stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Persona {
    Imperium,
    Guardian,
    Sandbox,
    Conquest,
}

impl Persona {
    pub const ALL: [Persona; 4] = [
        Persona::Imperium,
        Persona::Guardian,
        Persona::Sandbox,
        Persona::Conquest,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Persona::Imperium => "imperium",
            Persona::Guardian => "guardian",
            Persona::Sandbox => "sandbox",
            Persona::Conquest => "conquest",
        }
    }

    pub fn purpose(self) -> &'static str {
        match self {
            Persona::Imperium => "optimizes code structure and runtime behaviour",
            Persona::Guardian => "audits code for security and quality issues",
            Persona::Sandbox => "experiments with newer APIs and alternatives",
            Persona::Conquest => "ships lean, production-ready changes",
        }
    }
}

impl fmt::Display for Persona {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Persona {
    type Err = CustodesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "imperium" => Ok(Persona::Imperium),
            "guardian" => Ok(Persona::Guardian),
            "sandbox" => Ok(Persona::Sandbox),
            "conquest" => Ok(Persona::Conquest),
            other => Err(CustodesError::ValidationError(format!(
                "unknown persona '{}' (expected imperium|guardian|sandbox|conquest)",
                other
            ))),
        }
    }
}
