use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Utc;
use droidutils::{quote_arg, CommandGateway};

use crate::{
    config::{DroidConfig, MANIFEST_FILENAME},
    cvd::Toolchain,
    registry::Registry,
    DroidcoreError, DroidcoreResult,
};

use super::{
    architecture_of, form_factor_of, is_org_id, SnapshotInfo, SnapshotKind, SnapshotMetadata,
    SnapshotRef,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Entries of the toolchain home that are never base images.
const NON_IMAGE_DIRS: &[&str] = &[
    "bin",
    "cuttlefish",
    "cuttlefish_runtime",
    "logs",
    "tmp",
    "android-cuttlefish",
];

/// Image files whose presence marks a base image directory.
const IMAGE_FILES: &[&str] = &["super.img", "system.img"];

/// The build fetched by the remediation hint for a missing base image.
const DEFAULT_FETCH_TARGET: &str = "aosp-main-throttled/aosp_cf_x86_64_phone-trunk_staging-userdebug";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Finds, captures and deletes snapshots on the device host.
#[derive(Clone)]
pub struct SnapshotManager {
    /// Gateway to the device host
    gateway: Arc<dyn CommandGateway>,

    /// The toolchain driver, for `snapshot_take`
    toolchain: Toolchain,

    /// The registry, to resolve source sandboxes
    registry: Arc<Registry>,

    /// Where base images live
    cvd_home: PathBuf,

    /// Where custom snapshots live, `<artifacts>/snapshots`
    snapshots_root: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SnapshotManager {
    /// Creates a snapshot manager.
    pub fn new(toolchain: Toolchain, registry: Arc<Registry>, config: &DroidConfig) -> Self {
        Self {
            gateway: toolchain.gateway().clone(),
            toolchain,
            registry,
            cvd_home: config.get_cvd_home().clone(),
            snapshots_root: config.snapshots_root(),
        }
    }

    /// Root of the custom snapshot store.
    pub fn snapshots_root(&self) -> &Path {
        &self.snapshots_root
    }

    /// The directory of a snapshot on the device host.
    pub fn snapshot_dir(&self, snapshot: &SnapshotRef) -> PathBuf {
        match snapshot.kind() {
            SnapshotKind::Base => self.cvd_home.join(snapshot.name()),
            SnapshotKind::Custom => self
                .snapshots_root
                .join(snapshot.org_id())
                .join(snapshot.name()),
        }
    }

    /// Whether a snapshot exists. A base image directory must also hold an image file.
    pub async fn snapshot_exists(&self, path: &str) -> DroidcoreResult<bool> {
        let snapshot = SnapshotRef::parse(path)?;
        Ok(self.exists(&snapshot).await)
    }

    /// Fails with remediation instructions unless the snapshot exists.
    pub async fn require(&self, path: &str) -> DroidcoreResult<SnapshotRef> {
        let snapshot = SnapshotRef::parse(path)?;
        if self.exists(&snapshot).await {
            return Ok(snapshot);
        }

        let help = self.not_found_help(&snapshot);
        tracing::error!(snapshot = %snapshot, "{help}");
        Err(DroidcoreError::SnapshotNotFound {
            path: snapshot.to_string(),
            help,
        })
    }

    /// Instructions for obtaining a missing snapshot.
    pub fn not_found_help(&self, snapshot: &SnapshotRef) -> String {
        if snapshot.is_custom() {
            return format!("Custom snapshot '{snapshot}' not found");
        }

        let dir = self.snapshot_dir(snapshot);
        format!(
            "Base snapshot '{snapshot}' not found. Android system images need to be downloaded first.\n\
             To download images, run on the Cuttlefish host:\n  \
             cvd fetch --target_directory={dir} {DEFAULT_FETCH_TARGET}\n\
             Or download manually from https://ci.android.com and extract to {dir}",
            dir = dir.display()
        )
    }

    /// Lists every snapshot path: base images first, then custom snapshots by organization.
    pub async fn list_snapshots(&self) -> DroidcoreResult<Vec<String>> {
        let mut snapshots = Vec::new();

        match self.gateway.list_dir(&self.cvd_home).await {
            Ok(entries) => {
                for entry in entries {
                    if entry.is_dir && self.is_base_image(&entry.name).await {
                        snapshots.push(entry.name);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(dir = %self.cvd_home.display(), error = %e, "failed to list toolchain home");
            }
        }

        match self.gateway.list_dir(&self.snapshots_root).await {
            Ok(entries) => {
                for entry in entries {
                    if !entry.is_dir || !is_org_id(&entry.name) {
                        continue;
                    }

                    match self.list_org_paths(&entry.name).await {
                        Ok(paths) => snapshots.extend(paths),
                        Err(e) => {
                            tracing::warn!(org_id = %entry.name, error = %e, "failed to list organization snapshots");
                        }
                    }
                }
            }
            Err(e) => {
                tracing::debug!(dir = %self.snapshots_root.display(), error = %e, "no custom snapshots");
            }
        }

        snapshots.sort();
        Ok(snapshots)
    }

    /// Lists every snapshot with its metadata, falling back to path-derived metadata.
    pub async fn list_snapshots_with_info(&self) -> DroidcoreResult<Vec<SnapshotInfo>> {
        let mut infos = Vec::new();
        for path in self.list_snapshots().await? {
            infos.push(self.info_or_basic(&path).await?);
        }

        Ok(infos)
    }

    /// Lists the snapshots of one organization.
    pub async fn list_org_snapshots(&self, org_id: &str) -> DroidcoreResult<Vec<SnapshotInfo>> {
        if !is_org_id(org_id) {
            return Err(DroidcoreError::InvalidArgument(format!(
                "organization id must be a uuid: {org_id}"
            )));
        }

        let mut infos = Vec::new();
        for path in self.list_org_paths(org_id).await? {
            infos.push(self.info_or_basic(&path).await?);
        }

        Ok(infos)
    }

    /// Reads a snapshot's manifest.
    pub async fn get_snapshot_metadata(&self, path: &str) -> DroidcoreResult<SnapshotMetadata> {
        let snapshot = SnapshotRef::parse(path)?;
        let data = self
            .gateway
            .read_file(&self.snapshot_dir(&snapshot).join(MANIFEST_FILENAME))
            .await?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Describes an existing snapshot.
    pub async fn get_snapshot_info(&self, path: &str) -> DroidcoreResult<SnapshotInfo> {
        let snapshot = self.require(path).await?;
        self.info_or_basic(&snapshot.to_string()).await
    }

    /// Captures a running sandbox into a new custom snapshot of `org_id`.
    ///
    /// The snapshot directory is removed again if the capture fails.
    pub async fn create_snapshot_from_instance(
        &self,
        sandbox_id: &str,
        org_id: &str,
        name: &str,
        description: &str,
    ) -> DroidcoreResult<SnapshotInfo> {
        tracing::info!(sandbox_id, org_id, name, "creating snapshot");

        let snapshot = SnapshotRef::custom(org_id, name)?;
        let instance = self
            .registry
            .get(sandbox_id)
            .await
            .ok_or_else(|| DroidcoreError::SandboxNotFound(sandbox_id.to_string()))?;

        let instance_num = *instance.get_instance_num();
        if !self.toolchain.vm_process_alive(instance_num).await? {
            return Err(DroidcoreError::SandboxNotRunning(sandbox_id.to_string()));
        }

        let dir = self.snapshot_dir(&snapshot);
        self.gateway.create_dir_all(&dir).await?;

        if let Err(e) = self
            .toolchain
            .snapshot_take(instance_num, &dir.join("snapshot"))
            .await
        {
            if let Err(cleanup) = self.gateway.remove_all(&dir).await {
                tracing::warn!(dir = %dir.display(), error = %cleanup, "failed to remove partial snapshot");
            }
            return Err(e);
        }

        let base_ref = instance.snapshot().unwrap_or_default().to_string();
        let size_bytes = match self.disk_usage(&dir).await {
            Ok(size) => size,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "failed to measure snapshot size");
                0
            }
        };

        let metadata = SnapshotMetadata {
            name: snapshot.name().to_string(),
            kind: SnapshotKind::Custom,
            org_id: org_id.to_string(),
            description: description.to_string(),
            architecture: architecture_of(&base_ref).to_string(),
            form_factor: form_factor_of(&base_ref).to_string(),
            base_ref,
            created_at: Some(Utc::now()),
            created_from: sandbox_id.to_string(),
            size_bytes,
        };

        match serde_json::to_vec_pretty(&metadata) {
            Ok(data) => {
                if let Err(e) = self
                    .gateway
                    .write_file(&dir.join(MANIFEST_FILENAME), &data)
                    .await
                {
                    tracing::warn!(snapshot = %snapshot, error = %e, "failed to write snapshot manifest");
                }
            }
            Err(e) => tracing::warn!(snapshot = %snapshot, error = %e, "failed to encode snapshot manifest"),
        }

        tracing::info!(snapshot = %snapshot, size_bytes, "snapshot created");
        Ok(SnapshotInfo {
            path: snapshot.to_string(),
            metadata,
        })
    }

    /// Deletes a custom snapshot. Base images are refused.
    pub async fn delete_snapshot(&self, path: &str) -> DroidcoreResult<()> {
        tracing::info!(path, "deleting snapshot");

        let snapshot = SnapshotRef::parse(path)?;
        if snapshot.is_base() {
            return Err(DroidcoreError::BaseSnapshotImmutable(snapshot.to_string()));
        }

        let dir = self.snapshot_dir(&snapshot);
        if !self.gateway.exists(&dir).await {
            return Err(DroidcoreError::SnapshotNotFound {
                path: snapshot.to_string(),
                help: self.not_found_help(&snapshot),
            });
        }

        self.gateway.remove_all(&dir).await?;
        tracing::info!(snapshot = %snapshot, "snapshot deleted");
        Ok(())
    }

    /// Bytes used by a directory tree, as reported by `du`.
    pub async fn disk_usage(&self, dir: &Path) -> DroidcoreResult<u64> {
        let output = self
            .gateway
            .run_script(&format!(
                "du -sb {} | cut -f1",
                quote_arg(&dir.to_string_lossy())
            ))
            .await?;

        output
            .trim()
            .parse()
            .map_err(|_| DroidcoreError::UnexpectedOutput(format!("du: {}", output.trim())))
    }

    async fn exists(&self, snapshot: &SnapshotRef) -> bool {
        let dir = self.snapshot_dir(snapshot);
        if !self.gateway.exists(&dir).await {
            return false;
        }

        if snapshot.is_custom() {
            return true;
        }

        if self.has_image(&dir).await {
            return true;
        }

        tracing::warn!(dir = %dir.display(), "snapshot directory holds neither super.img nor system.img");
        false
    }

    async fn has_image(&self, dir: &Path) -> bool {
        for image in IMAGE_FILES {
            if self.gateway.exists(&dir.join(image)).await {
                return true;
            }
        }

        false
    }

    async fn is_base_image(&self, name: &str) -> bool {
        if name.starts_with('.') || NON_IMAGE_DIRS.contains(&name) {
            return false;
        }

        self.has_image(&self.cvd_home.join(name)).await
    }

    async fn list_org_paths(&self, org_id: &str) -> DroidcoreResult<Vec<String>> {
        let entries = self
            .gateway
            .list_dir(&self.snapshots_root.join(org_id))
            .await?;

        Ok(entries
            .into_iter()
            .filter(|entry| entry.is_dir && !entry.name.starts_with('.'))
            .map(|entry| format!("{org_id}/{}", entry.name))
            .collect())
    }

    async fn info_or_basic(&self, path: &str) -> DroidcoreResult<SnapshotInfo> {
        let metadata = match self.get_snapshot_metadata(path).await {
            Ok(metadata) => metadata,
            Err(_) => SnapshotMetadata::from_ref(&SnapshotRef::parse(path)?),
        };

        Ok(SnapshotInfo {
            path: path.to_string(),
            metadata,
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
