//! Wire envelope exchanged between the bus and instances.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Message kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    /// Bus client → Bridge.
    Bus,
    /// Bridge → children.
    Bridge,
}

impl DataKind {
    pub const BUS_ID: &'static str = "{7F7632D9-FA40-4F38-8DEA-C83CD4325A32}";
    pub const BRIDGE_ID: &'static str = "{E8C5B3A2-1D4F-5A60-9B7C-2D3E4F5A6B7C}";

    pub fn id(&self) -> &'static str {
        match self {
            Self::Bus => Self::BUS_ID,
            Self::Bridge => Self::BRIDGE_ID,
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            Self::BUS_ID => Some(Self::Bus),
            Self::BRIDGE_ID => Some(Self::Bridge),
            _ => None,
        }
    }
}

/// `{"DataID": ..., "Topic": ..., "Payload": ...}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "DataID")]
    pub data_id: String,
    #[serde(rename = "Topic", default)]
    pub topic: String,
    #[serde(rename = "Payload", default)]
    pub payload: String,
}

impl Envelope {
    pub fn new(kind: DataKind, topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            data_id: kind.id().to_string(),
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Discriminator, `None` for unknown kinds.
    pub fn kind(&self) -> Option<DataKind> {
        DataKind::from_id(&self.data_id)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| CoreError::malformed(format!("invalid envelope: {}", e)))
    }
}
