//! Closed set of synchronized entity types.
//!
//! Every boundary (HTTP path, socket `subscribe`, stream `entities=`)
//! parses through [`EntityType::from_str`], so an unknown name is
//! rejected before it reaches any table lookup.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;

/// Record categories that take part in real-time sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Users,
    Collections,
    Marketplace,
    Transactions,
}

impl EntityType {
    pub const COUNT: usize = 4;

    /// All entity types, in table order.
    pub const ALL: [EntityType; Self::COUNT] = [
        EntityType::Users,
        EntityType::Collections,
        EntityType::Marketplace,
        EntityType::Transactions,
    ];

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Users => "users",
            EntityType::Collections => "collections",
            EntityType::Marketplace => "marketplace",
            EntityType::Transactions => "transactions",
        }
    }

    /// Position in [`EntityType::ALL`]. Used to index fixed-size tables.
    pub fn index(&self) -> usize {
        match self {
            EntityType::Users => 0,
            EntityType::Collections => 1,
            EntityType::Marketplace => 2,
            EntityType::Transactions => 3,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "users" => Ok(EntityType::Users),
            "collections" => Ok(EntityType::Collections),
            "marketplace" => Ok(EntityType::Marketplace),
            "transactions" => Ok(EntityType::Transactions),
            other => Err(ProtocolError::UnknownEntityType(other.to_string())),
        }
    }
}

/// Kind of mutation carried by a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Create => "create",
            ChangeType::Update => "update",
            ChangeType::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(ChangeType::Create),
            "update" => Ok(ChangeType::Update),
            "delete" => Ok(ChangeType::Delete),
            other => Err(ProtocolError::MalformedMessage(format!(
                "unknown operation '{other}'"
            ))),
        }
    }
}
