//! Atomic materialization of artifacts
//!
//! Write protocol for one artifact:
//!
//! 1. back up an existing artifact (timestamped copy) and prune old backups
//! 2. write the content to `<final><temporarySuffix>`
//! 3. rename the temporary artifact onto the final name
//! 4. re-read size (and checksum) of the final artifact
//!
//! A failure before step 3 completes removes the temporary artifact and
//! leaves the final path untouched.

use crate::{
    config::{AdapterConfig, WriteMode},
    dedup::ChecksumAlgorithm,
    Error, Result,
};
use async_trait::async_trait;
use chrono::Local;
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Backup timestamp, millisecond precision
const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S%3f";
const BACKUP_TIMESTAMP_DIGITS: usize = 17;

/// Entry returned by [`ArtifactStore::list`]
#[derive(Debug, Clone)]
pub struct StoreEntry {
    /// Full path
    pub path: PathBuf,
    /// File name
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Last modification time
    pub modified: SystemTime,
}

/// Storage primitives the materializer is built on
///
/// Implemented for the local filesystem by [`LocalFs`]; remote stores
/// (FTP, SFTP) implement the same calls over their sessions.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Whether an artifact exists
    async fn exists(&self, path: &Path) -> Result<bool>;
    /// Create or truncate and write
    async fn write(&self, path: &Path, content: &[u8]) -> Result<u64>;
    /// Append, creating the artifact if missing
    async fn append(&self, path: &Path, content: &[u8]) -> Result<u64>;
    /// Read the whole artifact
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;
    /// Size in bytes
    async fn size(&self, path: &Path) -> Result<u64>;
    /// Copy, replacing the destination
    async fn copy(&self, from: &Path, to: &Path) -> Result<u64>;
    /// Rename, replacing the destination
    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;
    /// Remove; a missing artifact is not an error
    async fn remove(&self, path: &Path) -> Result<()>;
    /// Files in a directory
    async fn list(&self, dir: &Path) -> Result<Vec<StoreEntry>>;
    /// Create a directory and its parents
    async fn create_dir_all(&self, dir: &Path) -> Result<()>;
}

/// Local filesystem store
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

#[async_trait]
impl ArtifactStore for LocalFs {
    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn write(&self, path: &Path, content: &[u8]) -> Result<u64> {
        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(content).await?;
        file.sync_all().await?;
        Ok(content.len() as u64)
    }

    async fn append(&self, path: &Path, content: &[u8]) -> Result<u64> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(content).await?;
        file.sync_all().await?;
        Ok(content.len() as u64)
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(path).await?)
    }

    async fn size(&self, path: &Path) -> Result<u64> {
        Ok(tokio::fs::metadata(path).await?.len())
    }

    async fn copy(&self, from: &Path, to: &Path) -> Result<u64> {
        Ok(tokio::fs::copy(from, to).await?)
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        Ok(tokio::fs::rename(from, to).await?)
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, dir: &Path) -> Result<Vec<StoreEntry>> {
        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            entries.push(StoreEntry {
                path: entry.path(),
                name: entry.file_name().to_string_lossy().into_owned(),
                size: metadata.len(),
                modified: metadata.modified()?,
            });
        }
        Ok(entries)
    }

    async fn create_dir_all(&self, dir: &Path) -> Result<()> {
        Ok(tokio::fs::create_dir_all(dir).await?)
    }
}

/// Materialization options
#[derive(Debug, Clone)]
pub struct MaterializerOptions {
    /// Write mode
    pub write_mode: WriteMode,
    /// Temporary-then-rename placement
    pub atomic_write: bool,
    /// Suffix of the temporary artifact
    pub temporary_suffix: String,
    /// Directory of the temporary artifact (default: target directory)
    pub temporary_directory: Option<PathBuf>,
    /// Back up an existing artifact
    pub backup_enabled: bool,
    /// Backup directory (default: target directory)
    pub backup_directory: Option<PathBuf>,
    /// Backup suffix
    pub backup_suffix: String,
    /// Backups kept per artifact
    pub max_backup_files: usize,
    /// Compare size after writing
    pub validate_write: bool,
    /// Compare checksum after writing
    pub verify_checksum: bool,
    /// Write a checksum sidecar
    pub checksum_file: bool,
    /// Checksum algorithm
    pub checksum_algorithm: ChecksumAlgorithm,
}

impl MaterializerOptions {
    /// Options from adapter configuration
    pub fn from_config(config: &AdapterConfig) -> Result<Self> {
        Ok(Self {
            write_mode: config.write_mode,
            atomic_write: config.atomic_write,
            temporary_suffix: config.temporary_suffix.clone(),
            temporary_directory: config.temporary_directory.clone(),
            backup_enabled: config.backup_enabled,
            backup_directory: config.backup_directory.clone(),
            backup_suffix: config.backup_suffix.clone(),
            max_backup_files: config.max_backup_files,
            validate_write: config.validate_write,
            verify_checksum: config.verify_checksum,
            checksum_file: config.checksum_file,
            checksum_algorithm: config.checksum_algorithm()?,
        })
    }
}

/// Paths involved in one write
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterializationPlan {
    /// Destination
    pub final_path: PathBuf,
    /// Temporary artifact, when atomic placement is enabled
    pub temporary_path: Option<PathBuf>,
    /// Backup target, when backups are enabled
    pub backup_path: Option<PathBuf>,
}

/// Outcome of a completed write
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterializationReport {
    /// Destination
    pub final_path: PathBuf,
    /// Bytes of new content
    pub bytes_written: u64,
    /// Size of the final artifact
    pub final_size: u64,
    /// Backup created before the write
    pub backup_path: Option<PathBuf>,
    /// Checksum sidecar written after the write
    pub checksum_path: Option<PathBuf>,
}

/// Atomic materializer over an [`ArtifactStore`]
#[derive(Debug, Clone)]
pub struct AtomicMaterializer<S> {
    store: S,
    options: MaterializerOptions,
}

impl<S: ArtifactStore> AtomicMaterializer<S> {
    /// Create a materializer
    pub fn new(store: S, options: MaterializerOptions) -> Self {
        Self { store, options }
    }

    /// Underlying store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Options in use
    pub fn options(&self) -> &MaterializerOptions {
        &self.options
    }

    /// Compute the paths for writing `final_path`
    pub fn plan(&self, final_path: &Path) -> MaterializationPlan {
        let directory = final_path.parent().map(Path::to_path_buf).unwrap_or_default();
        let name = file_name(final_path);

        let temporary_path = self.options.atomic_write.then(|| {
            self.options
                .temporary_directory
                .clone()
                .unwrap_or_else(|| directory.clone())
                .join(format!("{}{}", name, self.options.temporary_suffix))
        });

        let backup_path = self.options.backup_enabled.then(|| {
            self.options
                .backup_directory
                .clone()
                .unwrap_or_else(|| directory.clone())
                .join(format!(
                    "{}.{}{}",
                    name,
                    Local::now().format(BACKUP_TIMESTAMP_FORMAT),
                    self.options.backup_suffix
                ))
        });

        MaterializationPlan {
            final_path: final_path.to_path_buf(),
            temporary_path,
            backup_path,
        }
    }

    /// Write `content` to `final_path` following the configured protocol
    pub async fn materialize(&self, final_path: &Path, content: &[u8]) -> Result<MaterializationReport> {
        let existed = self.store.exists(final_path).await?;
        if existed && self.options.write_mode == WriteMode::Create {
            return Err(Error::Validation(format!(
                "Artifact already exists: {}",
                final_path.display()
            )));
        }

        let plan = self.plan(final_path);
        let previous_size = if existed && self.options.write_mode == WriteMode::Append {
            self.store.size(final_path).await?
        } else {
            0
        };

        if let Some(parent) = final_path.parent() {
            self.store.create_dir_all(parent).await?;
        }

        let backup_path = match (&plan.backup_path, existed) {
            (Some(backup), true) => Some(self.backup(final_path, backup).await?),
            _ => None,
        };

        match &plan.temporary_path {
            Some(temporary) => self.write_atomic(final_path, temporary, content, existed).await?,
            None => self.write_direct(final_path, content).await?,
        }

        let final_size = previous_size + content.len() as u64;
        self.validate(final_path, content, final_size).await?;

        let checksum_path = if self.options.checksum_file {
            Some(self.write_checksum_file(final_path).await?)
        } else {
            None
        };

        info!(
            "Materialized {} ({} bytes, {:?})",
            final_path.display(),
            content.len(),
            self.options.write_mode
        );

        Ok(MaterializationReport {
            final_path: final_path.to_path_buf(),
            bytes_written: content.len() as u64,
            final_size,
            backup_path,
            checksum_path,
        })
    }

    async fn write_atomic(&self, final_path: &Path, temporary: &Path, content: &[u8], existed: bool) -> Result<()> {
        if let Some(parent) = temporary.parent() {
            self.store.create_dir_all(parent).await?;
        }

        let staged = async {
            if self.options.write_mode == WriteMode::Append && existed {
                self.store.copy(final_path, temporary).await?;
                self.store.append(temporary, content).await
            } else {
                self.store.write(temporary, content).await
            }
        }
        .await;

        if let Err(e) = staged {
            self.discard(temporary).await;
            return Err(e);
        }

        if let Err(e) = self.store.rename(temporary, final_path).await {
            self.discard(temporary).await;
            return Err(Error::Processing(format!(
                "Failed to move {} to {}: {}",
                temporary.display(),
                final_path.display(),
                e
            )));
        }

        debug!("Renamed {} to {}", temporary.display(), final_path.display());
        Ok(())
    }

    async fn write_direct(&self, final_path: &Path, content: &[u8]) -> Result<()> {
        match self.options.write_mode {
            WriteMode::Append => self.store.append(final_path, content).await?,
            WriteMode::Create | WriteMode::Overwrite => self.store.write(final_path, content).await?,
        };
        Ok(())
    }

    async fn discard(&self, temporary: &Path) {
        if let Err(e) = self.store.remove(temporary).await {
            warn!("Failed to clean up temporary artifact {}: {}", temporary.display(), e);
        }
    }

    async fn backup(&self, final_path: &Path, planned: &Path) -> Result<PathBuf> {
        if let Some(parent) = planned.parent() {
            self.store.create_dir_all(parent).await?;
        }

        let mut backup = planned.to_path_buf();
        let mut attempt = 1;
        while self.store.exists(&backup).await? {
            backup = with_counter(planned, &self.options.backup_suffix, attempt);
            attempt += 1;
        }

        self.store.copy(final_path, &backup).await.map_err(|e| {
            Error::Processing(format!("Backup of {} failed: {}", final_path.display(), e))
        })?;
        debug!("Created backup {}", backup.display());

        if let Err(e) = self.prune_backups(final_path, &backup).await {
            warn!("Failed to prune backups of {}: {}", final_path.display(), e);
        }
        Ok(backup)
    }

    /// Keep only the newest `max_backup_files` backups (by modification time)
    async fn prune_backups(&self, final_path: &Path, backup: &Path) -> Result<()> {
        let directory = match backup.parent() {
            Some(directory) => directory,
            None => return Ok(()),
        };
        let pattern = backup_pattern(&file_name(final_path), &self.options.backup_suffix)?;

        let mut backups: Vec<StoreEntry> = self
            .store
            .list(directory)
            .await?
            .into_iter()
            .filter(|e| pattern.is_match(&e.name))
            .collect();

        if backups.len() <= self.options.max_backup_files {
            return Ok(());
        }

        backups.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.name.cmp(&b.name)));
        let excess = backups.len() - self.options.max_backup_files;
        for old in backups.into_iter().take(excess) {
            debug!("Removing old backup {}", old.path.display());
            self.store.remove(&old.path).await?;
        }
        Ok(())
    }

    async fn validate(&self, final_path: &Path, content: &[u8], expected_size: u64) -> Result<()> {
        if self.options.validate_write {
            let actual = self.store.size(final_path).await?;
            if actual != expected_size {
                return Err(Error::Validation(format!(
                    "Size mismatch for {}: expected {} bytes, found {}",
                    final_path.display(),
                    expected_size,
                    actual
                )));
            }
        }

        if self.options.verify_checksum {
            let written = self.store.read(final_path).await?;
            let tail_start = written.len().saturating_sub(content.len());
            let algorithm = self.options.checksum_algorithm;
            if algorithm.checksum(&written[tail_start..]) != algorithm.checksum(content) {
                return Err(Error::Validation(format!(
                    "Checksum mismatch for {}",
                    final_path.display()
                )));
            }
        }

        Ok(())
    }

    async fn write_checksum_file(&self, final_path: &Path) -> Result<PathBuf> {
        let algorithm = self.options.checksum_algorithm;
        let written = self.store.read(final_path).await?;
        let checksum_path = PathBuf::from(format!(
            "{}{}",
            final_path.display(),
            algorithm.file_suffix()
        ));
        let line = format!("{}  {}\n", algorithm.checksum(&written), file_name(final_path));
        self.store.write(&checksum_path, line.as_bytes()).await?;
        Ok(checksum_path)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Matches exactly the names `plan` and `with_counter` give backups of `name`
fn backup_pattern(name: &str, suffix: &str) -> Result<Regex> {
    Regex::new(&format!(
        r"^{}\.\d{{{}}}(?:-\d+)?{}$",
        regex::escape(name),
        BACKUP_TIMESTAMP_DIGITS,
        regex::escape(suffix)
    ))
    .map_err(|e| Error::Processing(format!("Invalid backup pattern for {}: {}", name, e)))
}

fn with_counter(planned: &Path, suffix: &str, counter: u32) -> PathBuf {
    let name = file_name(planned);
    let stem = name.strip_suffix(suffix).unwrap_or(&name);
    planned.with_file_name(format!("{}-{}{}", stem, counter, suffix))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> MaterializerOptions {
        MaterializerOptions::from_config(&AdapterConfig::default()).unwrap()
    }

    #[test]
    fn test_plan_paths() {
        let mut opts = options();
        opts.backup_enabled = true;
        opts.backup_directory = Some(PathBuf::from("/data/backup"));
        let materializer = AtomicMaterializer::new(LocalFs, opts);

        let plan = materializer.plan(Path::new("/data/out/orders.csv"));
        assert_eq!(plan.temporary_path, Some(PathBuf::from("/data/out/orders.csv.tmp")));
        let backup = plan.backup_path.unwrap();
        assert!(backup.starts_with("/data/backup"));
        let name = file_name(&backup);
        assert!(name.starts_with("orders.csv.") && name.ends_with(".bak"));
    }

    #[test]
    fn test_plan_without_features() {
        let mut opts = options();
        opts.atomic_write = false;
        let materializer = AtomicMaterializer::new(LocalFs, opts);
        let plan = materializer.plan(Path::new("out/a.txt"));
        assert!(plan.temporary_path.is_none());
        assert!(plan.backup_path.is_none());
    }

    #[tokio::test]
    async fn test_atomic_overwrite_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a.txt");
        let materializer = AtomicMaterializer::new(LocalFs, options());

        materializer.materialize(&target, b"first").await.unwrap();
        let report = materializer.materialize(&target, b"second").await.unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"second");
        assert_eq!(report.final_size, 6);
        assert!(!dir.path().join("a.txt.tmp").exists());
    }

    #[tokio::test]
    async fn test_create_mode_rejects_existing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a.txt");
        std::fs::write(&target, "old").unwrap();

        let mut opts = options();
        opts.write_mode = WriteMode::Create;
        let materializer = AtomicMaterializer::new(LocalFs, opts);

        let err = materializer.materialize(&target, b"new").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(std::fs::read(&target).unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_atomic_append_with_validation() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("log.txt");
        std::fs::write(&target, "line1\n").unwrap();

        let mut opts = options();
        opts.write_mode = WriteMode::Append;
        opts.validate_write = true;
        opts.verify_checksum = true;
        let materializer = AtomicMaterializer::new(LocalFs, opts);

        let report = materializer.materialize(&target, b"line2\n").await.unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "line1\nline2\n");
        assert_eq!(report.final_size, 12);
        assert_eq!(report.bytes_written, 6);
    }

    #[tokio::test]
    async fn test_backup_rotation_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let backups = dir.path().join("backup");
        let target = dir.path().join("a.txt");

        let mut opts = options();
        opts.backup_enabled = true;
        opts.backup_directory = Some(backups.clone());
        opts.max_backup_files = 2;
        let materializer = AtomicMaterializer::new(LocalFs, opts);

        for i in 0..5 {
            materializer
                .materialize(&target, format!("v{}", i).as_bytes())
                .await
                .unwrap();
        }

        let kept: Vec<_> = std::fs::read_dir(&backups).unwrap().collect();
        assert_eq!(kept.len(), 2);
        assert_eq!(std::fs::read(&target).unwrap(), b"v4");
    }

    #[tokio::test]
    async fn test_rotation_spares_backups_of_other_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let backups = dir.path().join("backup");
        std::fs::create_dir_all(&backups).unwrap();
        let foreign = backups.join("a.csv.20261016021547715.bak");
        std::fs::write(&foreign, "other artifact").unwrap();

        let mut opts = options();
        opts.backup_enabled = true;
        opts.backup_directory = Some(backups.clone());
        opts.max_backup_files = 1;
        let materializer = AtomicMaterializer::new(LocalFs, opts);

        let target = dir.path().join("a");
        for i in 0..3 {
            materializer
                .materialize(&target, format!("v{}", i).as_bytes())
                .await
                .unwrap();
        }

        assert!(foreign.exists());
        let own = std::fs::read_dir(&backups)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("a.") && !name.starts_with("a.csv."))
            .count();
        assert_eq!(own, 1);
    }

    #[test]
    fn test_backup_pattern_is_exact() {
        let pattern = backup_pattern("a", ".bak").unwrap();
        assert!(pattern.is_match("a.20261016021547715.bak"));
        assert!(pattern.is_match("a.20261016021547715-2.bak"));
        assert!(!pattern.is_match("a.csv.20261016021547715.bak"));
        assert!(!pattern.is_match("ab.20261016021547715.bak"));
        assert!(!pattern.is_match("a.20261016021547715.bak.tmp"));
    }

    #[tokio::test]
    async fn test_checksum_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a.txt");

        let mut opts = options();
        opts.checksum_file = true;
        let materializer = AtomicMaterializer::new(LocalFs, opts);

        let report = materializer.materialize(&target, b"payload").await.unwrap();
        let sidecar = report.checksum_path.unwrap();
        assert_eq!(sidecar, dir.path().join("a.txt.sha256"));
        let line = std::fs::read_to_string(sidecar).unwrap();
        assert_eq!(
            line,
            format!("{}  a.txt\n", ChecksumAlgorithm::Sha256.checksum(b"payload"))
        );
    }
}
