use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::SmolStr;

/// Mutation kind in the base-collection sync protocol.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl ChangeOp {
    /// Net membership weight of this operation. Updates keep membership
    /// unchanged; they retract the old value and insert the new one.
    #[inline]
    pub fn weight(&self) -> i64 {
        match self {
            ChangeOp::Insert => 1,
            ChangeOp::Update => 0,
            ChangeOp::Delete => -1,
        }
    }

    #[inline]
    pub fn changes_content(&self) -> bool {
        matches!(self, ChangeOp::Insert | ChangeOp::Update)
    }
}

/// One write inside a sync transaction: `begin()`, `write(..)*`, `commit()`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeMessage {
    #[serde(rename = "type")]
    pub op: ChangeOp,
    pub key: SmolStr,
    /// Row value. Ignored for deletes.
    #[serde(default)]
    pub value: Value,
}

impl ChangeMessage {
    pub fn insert(key: impl Into<SmolStr>, value: Value) -> Self {
        Self {
            op: ChangeOp::Insert,
            key: key.into(),
            value,
        }
    }

    pub fn update(key: impl Into<SmolStr>, value: Value) -> Self {
        Self {
            op: ChangeOp::Update,
            key: key.into(),
            value,
        }
    }

    pub fn delete(key: impl Into<SmolStr>) -> Self {
        Self {
            op: ChangeOp::Delete,
            key: key.into(),
            value: Value::Null,
        }
    }
}
