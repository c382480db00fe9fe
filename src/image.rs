use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// Length of a full image id, in hex characters.
pub const ID_LEN: usize = 64;

/// Check the id syntax: exactly 64 lowercase hex characters.
///
/// Shorter user inputs are not ids; they are prefixes, resolved through the
/// truncated-id index.
pub fn validate_id(id: &str) -> Result<()> {
    let hex = id.len() == ID_LEN
        && id
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
    if !hex {
        anyhow::bail!(GraphError::InvalidId(id.to_string()));
    }
    Ok(())
}

/// Launch configuration captured with an image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exposed_ports: Vec<String>,
}

/// Metadata document of a layered-format image.
///
/// Stored as the `json` file inside the image directory. The embedded id
/// must match the directory name; a mismatch is a hard error at load time.
/// The layer's size is not part of this document, it lives in a sidecar
/// file so it can be computed and written back lazily.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Id of the container this layer was committed from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_config: Option<RunConfig>,
    /// Launch configuration to use when running this image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<RunConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
}

impl Image {
    /// Fresh metadata for a layer produced on this host, created now.
    pub fn new(id: impl Into<String>, parent: Option<String>) -> Self {
        Self {
            id: id.into(),
            parent,
            created: Utc::now(),
            comment: None,
            author: None,
            container: None,
            container_config: None,
            config: None,
            architecture: Some(std::env::consts::ARCH.to_string()),
            os: Some(std::env::consts::OS.to_string()),
        }
    }
}
