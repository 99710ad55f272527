use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{SnapshotKind, SnapshotRef};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The content of a custom snapshot's `manifest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    /// Snapshot name
    pub name: String,

    /// Base image or custom capture
    #[serde(rename = "type")]
    pub kind: SnapshotKind,

    /// Owning organization of a custom snapshot
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub org_id: String,

    /// Free-form description
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// The base image the captured sandbox was created from
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_ref: String,

    /// When the snapshot was taken
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    /// The sandbox the snapshot was taken from
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_from: String,

    /// Size on disk
    #[serde(default, skip_serializing_if = "is_zero")]
    pub size_bytes: u64,

    /// CPU architecture, `x86_64` or `arm64`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub architecture: String,

    /// Device form factor, e.g. `phone` or `tablet`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub form_factor: String,
}

/// A snapshot together with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// The snapshot path, `<name>` or `<org>/<name>`
    pub path: String,

    /// Its metadata
    pub metadata: SnapshotMetadata,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SnapshotMetadata {
    /// Minimal metadata derived from the path alone, for snapshots without a manifest.
    pub fn from_ref(snapshot: &SnapshotRef) -> Self {
        Self {
            name: snapshot.name().to_string(),
            kind: snapshot.kind(),
            org_id: snapshot.org_id().to_string(),
            description: String::new(),
            base_ref: String::new(),
            created_at: None,
            created_from: String::new(),
            size_bytes: 0,
            architecture: String::new(),
            form_factor: String::new(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn is_zero(value: &u64) -> bool {
    *value == 0
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
