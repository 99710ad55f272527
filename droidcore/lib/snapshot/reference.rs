use std::{
    fmt::{self, Display},
    str::FromStr,
    sync::LazyLock,
};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{DroidcoreError, DroidcoreResult};

//--------------------------------------------------------------------------------------------------
// Statics
//--------------------------------------------------------------------------------------------------

static ORG_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .unwrap()
});

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Whether a snapshot is a base image or an organization's capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    /// An immutable system image addressed by name.
    Base,

    /// A mutable capture owned by one organization.
    Custom,
}

/// A parsed snapshot path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotRef {
    kind: SnapshotKind,
    org_id: String,
    name: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SnapshotRef {
    /// Parses a snapshot path.
    ///
    /// A path without `/` is a base image. A path whose first segment is a UUID is a custom
    /// snapshot of that organization. Any other path names a base image by its full path.
    /// Empty paths and `.`/`..` segments are rejected.
    pub fn parse(path: &str) -> DroidcoreResult<Self> {
        let path = path.trim();
        if path.is_empty()
            || path
                .split('/')
                .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(DroidcoreError::InvalidSnapshotPath(path.to_string()));
        }

        Ok(match path.split_once('/') {
            Some((org_id, name)) if is_org_id(org_id) => Self {
                kind: SnapshotKind::Custom,
                org_id: org_id.to_string(),
                name: name.to_string(),
            },
            _ => Self {
                kind: SnapshotKind::Base,
                org_id: String::new(),
                name: path.to_string(),
            },
        })
    }

    /// A custom snapshot reference.
    pub fn custom(org_id: &str, name: &str) -> DroidcoreResult<Self> {
        if !is_org_id(org_id) {
            return Err(DroidcoreError::InvalidArgument(format!(
                "organization id must be a uuid: {org_id}"
            )));
        }

        match Self::parse(&format!("{org_id}/{name}"))? {
            snapshot if snapshot.is_custom() && !snapshot.name.contains('/') => Ok(snapshot),
            _ => Err(DroidcoreError::InvalidSnapshotPath(format!("{org_id}/{name}"))),
        }
    }

    /// The snapshot kind.
    pub fn kind(&self) -> SnapshotKind {
        self.kind
    }

    /// The owning organization. Empty for base images.
    pub fn org_id(&self) -> &str {
        &self.org_id
    }

    /// The snapshot name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this is a base image.
    pub fn is_base(&self) -> bool {
        self.kind == SnapshotKind::Base
    }

    /// Whether this is a custom snapshot.
    pub fn is_custom(&self) -> bool {
        self.kind == SnapshotKind::Custom
    }

    /// The object store prefix of a custom snapshot, `snapshots/<org>/<name>/`.
    pub fn object_prefix(&self) -> String {
        format!("snapshots/{}/{}/", self.org_id, self.name)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Whether a string is shaped like an organization id.
pub fn is_org_id(value: &str) -> bool {
    ORG_ID_REGEX.is_match(value)
}

/// The CPU architecture of a base image, derived from its name.
pub fn architecture_of(base_name: &str) -> &'static str {
    if base_name.contains("arm64") {
        "arm64"
    } else {
        "x86_64"
    }
}

/// The device form factor of a base image, derived from its name.
pub fn form_factor_of(base_name: &str) -> &'static str {
    ["tablet", "tv", "wear", "auto"]
        .into_iter()
        .find(|factor| base_name.contains(factor))
        .unwrap_or("phone")
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for SnapshotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SnapshotKind::Base => write!(f, "{}", self.name),
            SnapshotKind::Custom => write!(f, "{}/{}", self.org_id, self.name),
        }
    }
}

impl FromStr for SnapshotRef {
    type Err = DroidcoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotKind::Base => write!(f, "base"),
            SnapshotKind::Custom => write!(f, "custom"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
