use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use droidutils::{CommandGateway, FileEntry};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;

use crate::{
    config::{DroidConfig, MANIFEST_FILENAME},
    snapshot::SnapshotRef,
    DroidcoreError, DroidcoreResult,
};

use super::{ObjectStore, S3Store};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How deep a snapshot tree is walked. Captures nest two or three levels.
const MAX_SNAPSHOT_DEPTH: usize = 8;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Moves custom snapshots between the device host and the object store.
///
/// Files are transferred one per worker, with at most `concurrency` workers in flight whatever
/// the number of files. Bytes stream through the command gateway, so a remote device host is
/// never staged on local disk.
pub struct ArtifactTransfer {
    /// Gateway to the host holding the snapshots
    gateway: Arc<dyn CommandGateway>,

    /// The store, if one is configured
    store: Option<Arc<dyn ObjectStore>>,

    /// Root of the custom snapshot store on the device host
    snapshots_root: PathBuf,

    /// Maximum number of files in flight
    concurrency: usize,
}

/// The outcome of a snapshot upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    /// Where the snapshot was stored
    pub location: String,

    /// Uploaded files, relative to the snapshot directory, and their sizes
    pub files: BTreeMap<String, u64>,

    /// Sum of the file sizes
    pub total_size: u64,

    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
}

/// The outcome of a snapshot download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResult {
    /// The snapshot directory on the device host
    pub local_path: PathBuf,

    /// Sum of the file sizes
    pub total_size: u64,

    /// Number of downloaded files
    pub file_count: usize,

    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ArtifactTransfer {
    /// Creates a transfer over an explicit store.
    pub fn new(
        gateway: Arc<dyn CommandGateway>,
        store: Option<Arc<dyn ObjectStore>>,
        config: &DroidConfig,
    ) -> Self {
        Self {
            gateway,
            store,
            snapshots_root: config.snapshots_root(),
            concurrency: (*config.get_s3().get_concurrency()).max(1),
        }
    }

    /// Creates a transfer over the configured S3 bucket. Without one, every transfer fails with
    /// [`DroidcoreError::NotConfigured`].
    pub fn from_config(
        gateway: Arc<dyn CommandGateway>,
        config: &DroidConfig,
    ) -> DroidcoreResult<Self> {
        let store: Option<Arc<dyn ObjectStore>> = if config.get_s3().is_configured() {
            Some(Arc::new(S3Store::new(config.get_s3())?))
        } else {
            tracing::info!("object store not configured, snapshots stay on the device host");
            None
        };

        Ok(Self::new(gateway, store, config))
    }

    /// Whether an object store is configured.
    pub fn is_configured(&self) -> bool {
        self.store.is_some()
    }

    /// Maximum number of files in flight.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Uploads every regular file of a custom snapshot tree, symlinks resolved.
    ///
    /// Files keep their path relative to the snapshot directory, so the captured device state in
    /// `snapshot/` lands under `<prefix>snapshot/...`. All files are attempted. If any fails, the
    /// error lists each failed file.
    pub async fn upload_snapshot(&self, org_id: &str, name: &str) -> DroidcoreResult<UploadResult> {
        let store = self.store()?;
        let snapshot = SnapshotRef::custom(org_id, name)?;
        let dir = self.snapshot_dir(&snapshot);
        let prefix = snapshot.object_prefix();
        let started = Instant::now();

        let files = self.snapshot_files(&dir).await?;
        if files.is_empty() {
            return Err(DroidcoreError::InvalidArgument(format!(
                "no files found in snapshot directory {}",
                dir.display()
            )));
        }

        tracing::info!(snapshot = %snapshot, files = files.len(), location = %store.location(&prefix), "uploading snapshot");

        let semaphore = Semaphore::new(self.concurrency);
        let outcomes = join_all(files.iter().map(|(relative, file)| {
            let semaphore = &semaphore;
            let key = format!("{prefix}{relative}");
            async move {
                let _permit = semaphore.acquire().await.map_err(DroidcoreError::custom)?;
                let (size, reader) = self.gateway.open_read(&file.path).await?;
                store.put_object(&key, size, reader).await?;
                tracing::info!(file = relative.as_str(), size, "uploaded file");
                Ok::<_, DroidcoreError>(size)
            }
        }))
        .await;

        let mut uploaded = BTreeMap::new();
        let mut failures = Vec::new();
        for ((relative, _), outcome) in files.iter().zip(outcomes) {
            match outcome {
                Ok(size) => {
                    uploaded.insert(relative.clone(), size);
                }
                Err(e) => failures.push(format!("{relative}: {e}")),
            }
        }

        if !failures.is_empty() {
            tracing::error!(snapshot = %snapshot, failed = failures.len(), "snapshot upload failed");
            return Err(DroidcoreError::TransferFailed(failures));
        }

        let result = UploadResult {
            location: store.location(&prefix),
            total_size: uploaded.values().sum(),
            files: uploaded,
            duration_ms: elapsed_ms(started),
        };

        tracing::info!(snapshot = %snapshot, files = result.files.len(), total_size = result.total_size, duration_ms = result.duration_ms, "snapshot upload complete");
        Ok(result)
    }

    /// Downloads a custom snapshot into the snapshot store of the device host.
    ///
    /// Nested keys recreate their subdirectories. Keys that would escape the snapshot directory
    /// are skipped. Partially written files of failed downloads are removed.
    pub async fn download_snapshot(
        &self,
        org_id: &str,
        name: &str,
    ) -> DroidcoreResult<DownloadResult> {
        let store = self.store()?;
        let snapshot = SnapshotRef::custom(org_id, name)?;
        let dir = self.snapshot_dir(&snapshot);
        let prefix = snapshot.object_prefix();
        let started = Instant::now();

        let files = store
            .list_keys(&prefix)
            .await?
            .into_iter()
            .filter_map(|key| {
                let file = key.strip_prefix(&prefix)?.to_string();
                if !is_relative_object_path(&file) {
                    tracing::warn!(key = key.as_str(), "skipping object outside the snapshot directory");
                    return None;
                }
                Some((key, file))
            })
            .collect::<Vec<_>>();

        if files.is_empty() {
            return Err(DroidcoreError::SnapshotNotFound {
                path: snapshot.to_string(),
                help: format!("nothing stored at {}", store.location(&prefix)),
            });
        }

        self.gateway.create_dir_all(&dir).await?;
        tracing::info!(snapshot = %snapshot, files = files.len(), dir = %dir.display(), "downloading snapshot");

        let semaphore = Semaphore::new(self.concurrency);
        let outcomes = join_all(files.iter().map(|(key, file)| {
            let semaphore = &semaphore;
            let path = dir.join(file);
            async move {
                let _permit = semaphore.acquire().await.map_err(DroidcoreError::custom)?;
                self.download_file(&**store, key, &path).await
            }
        }))
        .await;

        let mut total_size = 0;
        let mut failures = Vec::new();
        for ((_, file), outcome) in files.iter().zip(outcomes) {
            match outcome {
                Ok(size) => total_size += size,
                Err(e) => failures.push(format!("{file}: {e}")),
            }
        }

        if !failures.is_empty() {
            tracing::error!(snapshot = %snapshot, failed = failures.len(), "snapshot download failed");
            return Err(DroidcoreError::TransferFailed(failures));
        }

        let result = DownloadResult {
            local_path: dir,
            total_size,
            file_count: files.len(),
            duration_ms: elapsed_ms(started),
        };

        tracing::info!(snapshot = %snapshot, files = result.file_count, total_size, duration_ms = result.duration_ms, "snapshot download complete");
        Ok(result)
    }

    /// Whether the object store holds the snapshot's manifest. False when no store is configured.
    pub async fn snapshot_exists(&self, org_id: &str, name: &str) -> DroidcoreResult<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };

        let snapshot = SnapshotRef::custom(org_id, name)?;
        store
            .head_object(&format!("{}{MANIFEST_FILENAME}", snapshot.object_prefix()))
            .await
    }

    /// Deletes every object of a snapshot from the store. Returns how many were deleted.
    pub async fn delete_from_store(&self, org_id: &str, name: &str) -> DroidcoreResult<usize> {
        let store = self.store()?;
        let snapshot = SnapshotRef::custom(org_id, name)?;
        let prefix = snapshot.object_prefix();

        let mut deleted = 0;
        for key in store.list_keys(&prefix).await? {
            match store.delete_object(&key).await {
                Ok(()) => deleted += 1,
                Err(e) => tracing::warn!(key = key.as_str(), error = %e, "failed to delete object"),
            }
        }

        tracing::info!(snapshot = %snapshot, deleted, "deleted snapshot from object store");
        Ok(deleted)
    }

    /// Every regular file under `dir`, keyed by its `/`-separated path relative to `dir`.
    ///
    /// Hidden entries are skipped and symlinks followed, down to [`MAX_SNAPSHOT_DEPTH`] levels.
    async fn snapshot_files(&self, dir: &Path) -> DroidcoreResult<Vec<(String, FileEntry)>> {
        let mut files = Vec::new();
        let mut pending = vec![(dir.to_path_buf(), String::new(), 0)];

        while let Some((current, relative, depth)) = pending.pop() {
            for file in self.gateway.list_files(&current).await? {
                files.push((format!("{relative}{}", file.name), file));
            }

            if depth + 1 >= MAX_SNAPSHOT_DEPTH {
                tracing::warn!(dir = %current.display(), "snapshot tree too deep, not descending");
                continue;
            }

            for entry in self.gateway.list_dir(&current).await? {
                if entry.is_dir && !entry.name.starts_with('.') {
                    pending.push((
                        current.join(&entry.name),
                        format!("{relative}{}/", entry.name),
                        depth + 1,
                    ));
                }
            }
        }

        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files)
    }

    fn store(&self) -> DroidcoreResult<&Arc<dyn ObjectStore>> {
        self.store
            .as_ref()
            .ok_or_else(|| DroidcoreError::NotConfigured("object store".to_string()))
    }

    fn snapshot_dir(&self, snapshot: &SnapshotRef) -> PathBuf {
        self.snapshots_root
            .join(snapshot.org_id())
            .join(snapshot.name())
    }

    async fn download_file(
        &self,
        store: &dyn ObjectStore,
        key: &str,
        path: &Path,
    ) -> DroidcoreResult<u64> {
        if let Some(parent) = path.parent() {
            self.gateway.create_dir_all(parent).await?;
        }

        let (_, reader) = store.get_object(key).await?;
        match self.gateway.write_from_reader(path, reader).await {
            Ok(size) => {
                tracing::debug!(key, size, "downloaded file");
                Ok(size)
            }
            Err(e) => {
                if let Err(cleanup) = self.gateway.remove_all(path).await {
                    tracing::warn!(path = %path.display(), error = %cleanup, "failed to remove partial download");
                }
                Err(e.into())
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Whether an object path relative to a snapshot prefix stays inside the snapshot directory.
fn is_relative_object_path(path: &str) -> bool {
    !path.is_empty()
        && path
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        io,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use bytes::Bytes;
    use droidutils::{BoxedReader, LocalGateway};
    use tokio::io::AsyncReadExt;
    use tokio_util::io::StreamReader;

    use crate::config::S3Config;

    use super::*;

    const ORG: &str = "3f2b9c1e-8d4a-4e6f-9a0b-1c2d3e4f5a6b";

    #[derive(Default)]
    struct FakeStore {
        objects: Mutex<HashMap<String, Vec<u8>>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FakeStore {
        fn keys(&self) -> Vec<String> {
            let mut keys = self.objects.lock().unwrap().keys().cloned().collect::<Vec<_>>();
            keys.sort();
            keys
        }

        fn insert(&self, key: &str, data: &[u8]) {
            self.objects
                .lock()
                .unwrap()
                .insert(key.to_string(), data.to_vec());
        }
    }

    #[async_trait]
    impl ObjectStore for FakeStore {
        async fn put_object(&self, key: &str, _size: u64, mut reader: BoxedReader) -> DroidcoreResult<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;

            let mut data = Vec::new();
            let read = reader.read_to_end(&mut data).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            read?;

            if key.ends_with("broken.img") {
                return Err(DroidcoreError::ObjectStore("access denied".to_string()));
            }

            self.insert(key, &data);
            Ok(())
        }

        async fn get_object(&self, key: &str) -> DroidcoreResult<(Option<u64>, BoxedReader)> {
            if key.ends_with("broken.img") {
                let chunks: Vec<io::Result<Bytes>> = vec![
                    Ok(Bytes::from_static(b"partial")),
                    Err(io::Error::other("connection reset")),
                ];
                return Ok((None, Box::pin(StreamReader::new(futures::stream::iter(chunks)))));
            }

            let data = self
                .objects
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| DroidcoreError::ObjectStore(format!("no such key {key}")))?;
            Ok((Some(data.len() as u64), Box::pin(io::Cursor::new(data))))
        }

        async fn head_object(&self, key: &str) -> DroidcoreResult<bool> {
            Ok(self.objects.lock().unwrap().contains_key(key))
        }

        async fn list_keys(&self, prefix: &str) -> DroidcoreResult<Vec<String>> {
            Ok(self
                .keys()
                .into_iter()
                .filter(|key| key.starts_with(prefix))
                .collect())
        }

        async fn delete_object(&self, key: &str) -> DroidcoreResult<()> {
            self.objects.lock().unwrap().remove(key);
            Ok(())
        }

        fn location(&self, key: &str) -> String {
            format!("fake://{key}")
        }
    }

    fn transfer(root: &Path, store: Option<Arc<FakeStore>>) -> ArtifactTransfer {
        let config = DroidConfig::builder()
            .artifacts_path(root)
            .s3(S3Config::builder().concurrency(3).build())
            .build();
        let store = store.map(|store| store as Arc<dyn ObjectStore>);
        ArtifactTransfer::new(Arc::new(LocalGateway), store, &config)
    }

    fn snapshot_dir(root: &Path) -> PathBuf {
        root.join("snapshots").join(ORG).join("snap")
    }

    #[test_log::test(tokio::test)]
    async fn test_upload_is_bounded_and_resolves_symlinks() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let dir = snapshot_dir(root.path());
        std::fs::create_dir_all(&dir)?;
        for i in 0..8 {
            std::fs::write(dir.join(format!("disk_{i}.img")), vec![1u8; 100 + i])?;
        }
        std::fs::write(dir.join(".hidden"), b"skip")?;
        std::fs::write(root.path().join("kernel"), b"kernel-bytes")?;
        std::os::unix::fs::symlink(root.path().join("kernel"), dir.join("kernel.link"))?;

        let store = Arc::new(FakeStore::default());
        let result = transfer(root.path(), Some(store.clone()))
            .upload_snapshot(ORG, "snap")
            .await?;

        assert_eq!(result.files.len(), 9);
        assert_eq!(result.files["kernel.link"], 12);
        assert_eq!(result.total_size, (0..8).map(|i| 100 + i).sum::<u64>() + 12);
        assert_eq!(store.peak.load(Ordering::SeqCst), 3);
        assert_eq!(
            store.objects.lock().unwrap()[&format!("snapshots/{ORG}/snap/kernel.link")],
            b"kernel-bytes".to_vec()
        );
        assert!(!store.keys().iter().any(|key| key.ends_with(".hidden")));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_upload_failure_is_aggregated() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let dir = snapshot_dir(root.path());
        std::fs::create_dir_all(&dir)?;
        for name in ["a.img", "broken.img", "c.img", "manifest.json"] {
            std::fs::write(dir.join(name), b"data")?;
        }

        let store = Arc::new(FakeStore::default());
        let err = transfer(root.path(), Some(store.clone()))
            .upload_snapshot(ORG, "snap")
            .await
            .unwrap_err();

        match err {
            DroidcoreError::TransferFailed(failures) => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0].starts_with("broken.img: "));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.keys().len(), 3);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_download_and_partial_cleanup() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let store = Arc::new(FakeStore::default());
        let prefix = format!("snapshots/{ORG}/snap/");
        store.insert(&format!("{prefix}manifest.json"), b"{}");
        store.insert(&format!("{prefix}disk.img"), b"0123456789");
        store.insert(&format!("{prefix}snapshot/disks/disk.qcow2"), b"x");
        store.insert(&format!("{prefix}../escape.img"), b"evil");
        store.insert(&format!("{prefix}snapshot//empty-segment"), b"evil");

        let transfer = transfer(root.path(), Some(store.clone()));
        let result = transfer.download_snapshot(ORG, "snap").await?;
        let dir = snapshot_dir(root.path());
        assert_eq!(result.local_path, dir);
        assert_eq!(result.file_count, 3);
        assert_eq!(result.total_size, 13);
        assert_eq!(std::fs::read(dir.join("disk.img"))?, b"0123456789");
        assert_eq!(std::fs::read(dir.join("snapshot/disks/disk.qcow2"))?, b"x");
        assert!(!dir.parent().unwrap().join("escape.img").exists());

        store.insert(&format!("{prefix}broken.img"), b"");
        let err = transfer.download_snapshot(ORG, "snap").await.unwrap_err();
        assert!(matches!(err, DroidcoreError::TransferFailed(ref failures) if failures.len() == 1));
        assert!(!dir.join("broken.img").exists());

        assert!(matches!(
            transfer.download_snapshot(ORG, "missing").await,
            Err(DroidcoreError::SnapshotNotFound { .. })
        ));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_captured_snapshot_round_trips() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let dir = snapshot_dir(root.path());
        std::fs::create_dir_all(dir.join("snapshot").join("disks"))?;
        std::fs::write(dir.join("manifest.json"), b"{}")?;
        std::fs::write(dir.join("snapshot").join("vm_state.bin"), vec![9u8; 4096])?;
        std::fs::write(dir.join("snapshot").join("disks").join("overlay.img"), b"overlay")?;
        std::fs::create_dir_all(dir.join(".tmp"))?;
        std::fs::write(dir.join(".tmp").join("scratch"), b"skip")?;

        let store = Arc::new(FakeStore::default());
        let transfer = transfer(root.path(), Some(store.clone()));
        let uploaded = transfer.upload_snapshot(ORG, "snap").await?;
        assert_eq!(
            uploaded.files.keys().cloned().collect::<Vec<_>>(),
            vec![
                "manifest.json".to_string(),
                "snapshot/disks/overlay.img".to_string(),
                "snapshot/vm_state.bin".to_string(),
            ]
        );
        assert_eq!(uploaded.total_size, 2 + 7 + 4096);
        assert_eq!(
            store.keys(),
            vec![
                format!("snapshots/{ORG}/snap/manifest.json"),
                format!("snapshots/{ORG}/snap/snapshot/disks/overlay.img"),
                format!("snapshots/{ORG}/snap/snapshot/vm_state.bin"),
            ]
        );

        std::fs::remove_dir_all(&dir)?;
        let downloaded = transfer.download_snapshot(ORG, "snap").await?;
        assert_eq!(downloaded.file_count, 3);
        assert_eq!(downloaded.total_size, uploaded.total_size);
        assert_eq!(
            std::fs::read(dir.join("snapshot").join("vm_state.bin"))?,
            vec![9u8; 4096]
        );
        assert_eq!(
            std::fs::read(dir.join("snapshot").join("disks").join("overlay.img"))?,
            b"overlay"
        );

        Ok(())
    }

    #[test]
    fn test_relative_object_paths() {
        assert!(is_relative_object_path("manifest.json"));
        assert!(is_relative_object_path("snapshot/disks/overlay.img"));
        assert!(!is_relative_object_path(""));
        assert!(!is_relative_object_path("/etc/passwd"));
        assert!(!is_relative_object_path("../escape"));
        assert!(!is_relative_object_path("snapshot/../../escape"));
        assert!(!is_relative_object_path("snapshot/"));
        assert!(!is_relative_object_path("./manifest.json"));
    }

    #[test_log::test(tokio::test)]
    async fn test_exists_and_delete() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let store = Arc::new(FakeStore::default());
        let transfer = transfer(root.path(), Some(store.clone()));
        assert!(!transfer.snapshot_exists(ORG, "snap").await?);

        store.insert(&format!("snapshots/{ORG}/snap/disk.img"), b"1");
        assert!(!transfer.snapshot_exists(ORG, "snap").await?);
        store.insert(&format!("snapshots/{ORG}/snap/manifest.json"), b"{}");
        store.insert(&format!("snapshots/{ORG}/other/manifest.json"), b"{}");
        assert!(transfer.snapshot_exists(ORG, "snap").await?);

        assert_eq!(transfer.delete_from_store(ORG, "snap").await?, 2);
        assert!(!transfer.snapshot_exists(ORG, "snap").await?);
        assert_eq!(store.keys().len(), 1);

        assert!(transfer.upload_snapshot("not-a-uuid", "snap").await.is_err());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_unconfigured_store() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let transfer = transfer(root.path(), None);
        assert!(!transfer.is_configured());
        assert!(!transfer.snapshot_exists(ORG, "snap").await?);
        assert!(matches!(
            transfer.upload_snapshot(ORG, "snap").await,
            Err(DroidcoreError::NotConfigured(_))
        ));
        Ok(())
    }
}
