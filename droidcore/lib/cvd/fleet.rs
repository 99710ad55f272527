use std::{collections::BTreeMap, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

//--------------------------------------------------------------------------------------------------
// Statics
//--------------------------------------------------------------------------------------------------

static GROUP_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"cvd_(\d+)").unwrap());

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The toolchain's view of every instance group it manages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fleet {
    /// Groups, one per instance number under the `cvd_<N>` naming convention
    #[serde(default)]
    pub groups: Vec<FleetGroup>,
}

/// One instance group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetGroup {
    /// The group label
    #[serde(default)]
    pub group_name: String,

    /// The instances in the group
    #[serde(default)]
    pub instances: Vec<FleetInstance>,
}

/// One instance as the toolchain reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetInstance {
    /// ADB port
    #[serde(default)]
    pub adb_port: u16,

    /// ADB serial
    #[serde(default)]
    pub adb_serial: String,

    /// Instance name within the group
    #[serde(default)]
    pub instance_name: String,

    /// Free-form status string
    #[serde(default)]
    pub status: String,

    /// WebRTC device id
    #[serde(default)]
    pub webrtc_device_id: String,
}

/// How much a toolchain status can be trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetStatus {
    /// The toolchain says the instance is running.
    Running,

    /// The toolchain says the instance was cleanly stopped.
    Stopped,

    /// Anything else, including `Cancelled` after a toolchain restart.
    Other(String),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Fleet {
    /// Parses `cvd fleet` output.
    ///
    /// Log lines before the JSON document and text after it are ignored. Output without a
    /// parseable document falls back to scanning for group labels, which yields groups without
    /// instances.
    pub fn parse(output: &str) -> Self {
        if let Some(start) = output.find('{') {
            let mut documents =
                serde_json::Deserializer::from_str(&output[start..]).into_iter::<Fleet>();
            match documents.next() {
                Some(Ok(fleet)) => return fleet,
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "fleet output is not valid json, scanning text");
                }
                None => {}
            }
        }

        let mut seen = BTreeMap::new();
        for captures in GROUP_PATTERN.captures_iter(output) {
            if let Some(label) = captures.get(0) {
                seen.entry(label.as_str().to_string()).or_insert(());
            }
        }

        Self {
            groups: seen
                .into_keys()
                .map(|group_name| FleetGroup {
                    group_name,
                    instances: Vec::new(),
                })
                .collect(),
        }
    }

    /// Maps instance number to group label for every group following the naming convention.
    pub fn instance_numbers(&self) -> BTreeMap<u32, String> {
        self.groups
            .iter()
            .filter_map(|group| {
                let number = parse_group_number(&group.group_name)?;
                Some((number, group.group_name.clone()))
            })
            .collect()
    }

    /// Maps instance number to the status of the group's first instance.
    ///
    /// Groups without instances are reported with an empty status, which classifies as
    /// [`FleetStatus::Other`].
    pub fn status_table(&self) -> BTreeMap<u32, FleetStatus> {
        self.groups
            .iter()
            .filter_map(|group| {
                let number = parse_group_number(&group.group_name)?;
                let status = group
                    .instances
                    .first()
                    .map(|instance| instance.status.as_str())
                    .unwrap_or_default();
                Some((number, FleetStatus::from_toolchain(status)))
            })
            .collect()
    }
}

impl FleetStatus {
    /// Classifies a raw toolchain status string.
    pub fn from_toolchain(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "running" => Self::Running,
            "stopped" => Self::Stopped,
            _ => Self::Other(status.trim().to_string()),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Extracts `N` from a `cvd_<N>` group label.
pub fn parse_group_number(group_name: &str) -> Option<u32> {
    GROUP_PATTERN
        .captures(group_name)
        .and_then(|captures| captures.get(1))
        .and_then(|number| number.as_str().parse().ok())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
