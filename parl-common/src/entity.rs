//! Entity type catalogue
//!
//! Every canonical table in the store corresponds to exactly one `EntityType`.
//! `EntityType::ALL` is ordered so that parents precede their dependents.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of public-record entity handled by the ingestion core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Committee,
    Bill,
    Debate,
    Vote,
    Meeting,
    Speech,
}

impl EntityType {
    /// All entity types, parents before dependents
    pub const ALL: [EntityType; 6] = [
        EntityType::Committee,
        EntityType::Bill,
        EntityType::Debate,
        EntityType::Vote,
        EntityType::Meeting,
        EntityType::Speech,
    ];

    /// Groups of entity types that may be ingested in parallel.
    ///
    /// Every type in a tier only references types from earlier tiers.
    pub const TIERS: [&'static [EntityType]; 2] = [
        &[EntityType::Committee, EntityType::Bill, EntityType::Debate],
        &[EntityType::Vote, EntityType::Meeting, EntityType::Speech],
    ];

    /// Singular lowercase tag ("bill", "speech", ...)
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Committee => "committee",
            EntityType::Bill => "bill",
            EntityType::Debate => "debate",
            EntityType::Vote => "vote",
            EntityType::Meeting => "meeting",
            EntityType::Speech => "speech",
        }
    }

    /// Plural path segment used by remote APIs and fixture files ("bills", "speeches", ...)
    pub fn plural(&self) -> &'static str {
        match self {
            EntityType::Committee => "committees",
            EntityType::Bill => "bills",
            EntityType::Debate => "debates",
            EntityType::Vote => "votes",
            EntityType::Meeting => "meetings",
            EntityType::Speech => "speeches",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        EntityType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == lowered || t.plural() == lowered)
            .ok_or_else(|| crate::Error::InvalidInput(format!("Unknown entity type: {}", s)))
    }
}
