//! Filesystem binding
//!
//! Sender: polls a directory for files matching a pattern. In-flight
//! temporary files and files under a live `<name>.lock` are ignored;
//! `fileName`, `size` and `modifiedMs` are exposed as fields, so any of them
//! can drive the cursor. Once the runtime settles a file it is kept, deleted,
//! moved or copied per `processingMode`; failed and duplicate files go to
//! their own directories when configured.
//!
//! Receiver: writes payloads (or whole batches) through the atomic
//! materializer.

use crate::{
    config::AdapterConfig,
    connector::ProtocolBinding,
    cursor::IncrementalCursor,
    materializer::{ArtifactStore, AtomicMaterializer, LocalFs, MaterializerOptions},
    naming::{self, NamingContext},
    result::Metadata,
    types::*,
    Error, Result,
};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// File binding options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileBindingConfig {
    /// Source or target directory
    pub directory: PathBuf,
    /// Regex selecting files to poll (whole name must match)
    pub file_pattern: Option<String>,
    /// Name template for single payloads
    pub target_file_name: Option<String>,
    /// Name template for batch units
    pub batch_file_name: Option<String>,
    /// Extension used by the default names
    pub file_extension: String,
    /// Written after every item of a batch unit
    pub record_separator: String,
    /// What happens to a source file once it was processed
    pub processing_mode: ProcessingMode,
    /// Destination of `move` and `copy`
    pub archive_directory: Option<PathBuf>,
    /// Failed files are moved here instead of being polled again
    pub error_directory: Option<PathBuf>,
    /// Files rejected by the duplicate filter are moved here
    pub duplicate_directory: Option<PathBuf>,
    /// Take a `<name><lockFileExtension>` lock while reading a file
    pub use_file_locking: bool,
    /// Suffix of lock files
    pub lock_file_extension: String,
    /// Age after which a lock file is considered abandoned
    pub lock_timeout_ms: u64,
}

impl Default for FileBindingConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            file_pattern: None,
            target_file_name: None,
            batch_file_name: None,
            file_extension: ".txt".to_string(),
            record_separator: "\n".to_string(),
            processing_mode: ProcessingMode::Keep,
            archive_directory: None,
            error_directory: None,
            duplicate_directory: None,
            use_file_locking: false,
            lock_file_extension: ".lock".to_string(),
            lock_timeout_ms: 300_000,
        }
    }
}

/// Post-processing of a successfully polled file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    /// Leave the file; the cursor or duplicate filter keeps it from repeating
    #[default]
    #[serde(alias = "none")]
    Keep,
    /// Remove the file
    Delete,
    /// Move the file into `archiveDirectory`
    #[serde(alias = "archive")]
    Move,
    /// Copy the file into `archiveDirectory`, leaving the original
    Copy,
}

/// Open handle on the configured directory
#[derive(Debug, Clone)]
pub struct DirectorySession {
    directory: PathBuf,
}

impl DirectorySession {
    /// Directory this session points at
    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

/// Filesystem binding
pub struct FileBinding {
    mode: AdapterMode,
    config: FileBindingConfig,
    pattern: Option<Regex>,
    temporary_suffix: String,
    support_directories: Vec<(&'static str, PathBuf)>,
    materializer: AtomicMaterializer<LocalFs>,
}

impl FileBinding {
    /// Create a binding; `adapter` supplies the write options
    pub fn new(mode: AdapterMode, config: FileBindingConfig, adapter: &AdapterConfig) -> Result<Self> {
        let pattern = match config.file_pattern.as_deref() {
            Some(p) => Some(
                Regex::new(&format!("^(?:{})$", p))
                    .map_err(|e| Error::config("filePattern", e.to_string()))?,
            ),
            None => None,
        };

        let mut support_directories = Vec::new();
        if let Some(dir) = &adapter.temporary_directory {
            support_directories.push(("temporary", dir.clone()));
        }
        if let Some(dir) = &adapter.backup_directory {
            support_directories.push(("backup", dir.clone()));
        }
        if mode == AdapterMode::Sender {
            let settled = [
                ("archive", &config.archive_directory),
                ("error", &config.error_directory),
                ("duplicate", &config.duplicate_directory),
            ];
            for (label, dir) in settled {
                if let Some(dir) = dir {
                    support_directories.push((label, dir.clone()));
                }
            }
        }

        Ok(Self {
            mode,
            pattern,
            temporary_suffix: adapter.temporary_suffix.clone(),
            support_directories,
            materializer: AtomicMaterializer::new(LocalFs, MaterializerOptions::from_config(adapter)?),
            config,
        })
    }

    /// Binding options
    pub fn config(&self) -> &FileBindingConfig {
        &self.config
    }

    fn is_candidate(&self, name: &str) -> bool {
        if !self.temporary_suffix.is_empty() && name.ends_with(&self.temporary_suffix) {
            return false;
        }
        let lock_extension = &self.config.lock_file_extension;
        if !lock_extension.is_empty() && name.ends_with(lock_extension.as_str()) {
            return false;
        }
        match &self.pattern {
            Some(pattern) => pattern.is_match(name),
            None => !name.starts_with('.'),
        }
    }

    fn unit_name(&self, delivery: &Delivery) -> String {
        let ctx = NamingContext::now().with_sequence(delivery.sequence);
        if delivery.is_batch() {
            return match &self.config.batch_file_name {
                Some(template) => naming::render(template, &ctx),
                None => naming::default_batch_name(&ctx, &self.config.file_extension),
            };
        }

        let headers = delivery.items.first().map(|p| &p.headers);
        let ctx = match headers {
            Some(headers) => ctx.with_headers(headers),
            None => ctx,
        };
        match &self.config.target_file_name {
            Some(template) => naming::render(template, &ctx),
            None => naming::default_file_name(&ctx, &self.config.file_extension),
        }
    }

    fn unit_content(&self, delivery: &Delivery) -> BytesMut {
        let mut content = BytesMut::with_capacity(delivery.content_len());
        if delivery.is_batch() {
            for item in &delivery.items {
                content.put_slice(&item.content);
                content.put_slice(self.config.record_separator.as_bytes());
            }
        } else {
            for item in &delivery.items {
                content.put_slice(&item.content);
            }
        }
        content
    }

    async fn probe_directory(&self, directory: &Path) -> ProbeResult {
        const NAME: &str = "Directory Access";
        let metadata = match tokio::fs::metadata(directory).await {
            Ok(metadata) => metadata,
            Err(e) => {
                return ProbeResult::fail(
                    NAME,
                    format!("Cannot access {}: {}", directory.display(), e),
                )
            }
        };
        if !metadata.is_dir() {
            return ProbeResult::fail(NAME, format!("Not a directory: {}", directory.display()));
        }
        if self.mode == AdapterMode::Receiver && metadata.permissions().readonly() {
            return ProbeResult::fail(
                NAME,
                format!("Directory is not writable: {}", directory.display()),
            );
        }
        ProbeResult::pass(NAME, format!("{} is accessible", directory.display()))
    }

    async fn probe_io(&self, directory: &Path) -> ProbeResult {
        match self.mode {
            AdapterMode::Sender => {
                const NAME: &str = "File Listing";
                match self.list(directory).await {
                    Ok(files) => ProbeResult::pass(NAME, format!("{} matching files", files.len())),
                    Err(e) => ProbeResult::fail(NAME, format!("Cannot list files: {}", e)),
                }
            }
            AdapterMode::Receiver => {
                const NAME: &str = "File Creation";
                let probe = directory.join(format!(
                    ".probe_{}{}",
                    uuid::Uuid::new_v4(),
                    self.temporary_suffix
                ));
                let written = tokio::fs::write(&probe, b"probe").await;
                let removed = tokio::fs::remove_file(&probe).await;
                match (written, removed) {
                    (Ok(()), Ok(())) => ProbeResult::pass(NAME, "Created and deleted a test file"),
                    (Err(e), _) => ProbeResult::fail(NAME, format!("Cannot create test file: {}", e)),
                    (Ok(()), Err(e)) => {
                        ProbeResult::fail(NAME, format!("Cannot delete test file: {}", e))
                    }
                }
            }
        }
    }

    async fn probe_support_directories(&self) -> ProbeResult {
        const NAME: &str = "Support Directories";
        let mut problems = Vec::new();
        for (label, dir) in &self.support_directories {
            match tokio::fs::metadata(dir).await {
                Ok(metadata) if metadata.is_dir() => {}
                Ok(_) => problems.push(format!("{} path {} is not a directory", label, dir.display())),
                Err(_) => {
                    let parent_exists = match dir.parent() {
                        Some(parent) if !parent.as_os_str().is_empty() => {
                            tokio::fs::try_exists(parent).await.unwrap_or(false)
                        }
                        _ => true,
                    };
                    if !parent_exists {
                        problems.push(format!("{} directory {} cannot be created", label, dir.display()));
                    }
                }
            }
        }

        if problems.is_empty() {
            ProbeResult::pass(NAME, "All configured support directories are usable")
        } else {
            ProbeResult::fail(NAME, problems.join("; "))
        }
    }

    fn lock_path(&self, path: &Path) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(&self.config.lock_file_extension);
        path.with_file_name(name)
    }

    /// Whether a lock younger than `lockTimeoutMs` exists
    async fn is_locked(&self, lock: &Path) -> Result<bool> {
        let metadata = match tokio::fs::metadata(lock).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let age = metadata.modified()?.elapsed().unwrap_or_default();
        Ok(age < Duration::from_millis(self.config.lock_timeout_ms))
    }

    /// Read a file unless it is locked or already gone
    async fn read_unlocked(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        let lock = self.lock_path(path);
        if self.is_locked(&lock).await? {
            debug!("{} is locked, skipping", path.display());
            return Ok(None);
        }
        if !self.config.use_file_locking {
            return read_if_present(path).await;
        }

        // Abandoned lock
        LocalFs.remove(&lock).await?;
        let created = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock)
            .await;
        match created {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!("{} was locked concurrently, skipping", path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let content = read_if_present(path).await;
        if let Err(e) = LocalFs.remove(&lock).await {
            warn!("Failed to release lock {}: {}", lock.display(), e);
        }
        content
    }

    /// Move (or copy) `path` into `directory`, replacing a file of that name
    async fn relocate(&self, path: &Path, directory: &Path, keep_source: bool) -> Result<PathBuf> {
        let name = path
            .file_name()
            .ok_or_else(|| Error::Validation(format!("No file name in {}", path.display())))?;
        LocalFs.create_dir_all(directory).await?;
        let target = directory.join(name);

        if keep_source {
            LocalFs.copy(path, &target).await?;
        } else if let Err(e) = LocalFs.rename(path, &target).await {
            // Rename does not cross filesystems
            debug!("Rename of {} failed ({}), copying", path.display(), e);
            LocalFs.copy(path, &target).await?;
            LocalFs.remove(path).await?;
        }
        Ok(target)
    }

    /// Candidate files with their fields, oldest first
    async fn list(&self, directory: &Path) -> Result<Vec<(PathBuf, Metadata)>> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !self.is_candidate(&name) {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let modified_ms = metadata
                .modified()?
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);

            let mut fields = Metadata::new();
            fields.insert("fileName".into(), name.into());
            fields.insert("filePath".into(), entry.path().display().to_string().into());
            fields.insert("size".into(), metadata.len().into());
            fields.insert("modifiedMs".into(), modified_ms.into());
            files.push((entry.path(), fields));
        }

        files.sort_by(|(_, a), (_, b)| {
            let key = |f: &Metadata| {
                (
                    f.get("modifiedMs").and_then(|v| v.as_i64()).unwrap_or(0),
                    f.get("fileName").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                )
            };
            key(a).cmp(&key(b))
        });
        Ok(files)
    }
}

#[async_trait]
impl ProtocolBinding for FileBinding {
    type Session = DirectorySession;

    fn adapter_type(&self) -> AdapterType {
        AdapterType::File
    }

    fn mode(&self) -> AdapterMode {
        self.mode
    }

    fn validate(&self) -> Result<()> {
        if self.config.directory.as_os_str().is_empty() {
            return Err(Error::config("directory", "must not be empty"));
        }
        if self.mode == AdapterMode::Receiver && self.config.file_extension.contains('/') {
            return Err(Error::config("fileExtension", "must not contain a path separator"));
        }
        if self.mode != AdapterMode::Sender {
            return Ok(());
        }

        let lock_extension = &self.config.lock_file_extension;
        if lock_extension.is_empty() || lock_extension.contains('/') {
            return Err(Error::config(
                "lockFileExtension",
                "must be a non-empty suffix without path separator",
            ));
        }
        if matches!(self.config.processing_mode, ProcessingMode::Move | ProcessingMode::Copy) {
            match &self.config.archive_directory {
                None => {
                    return Err(Error::config(
                        "archiveDirectory",
                        format!("required by processingMode {:?}", self.config.processing_mode),
                    ))
                }
                Some(dir) if dir == &self.config.directory => {
                    return Err(Error::config("archiveDirectory", "must differ from directory"))
                }
                Some(_) => {}
            }
        }
        for (field, dir) in [
            ("errorDirectory", &self.config.error_directory),
            ("duplicateDirectory", &self.config.duplicate_directory),
        ] {
            if dir.as_ref() == Some(&self.config.directory) {
                return Err(Error::config(field, "must differ from directory"));
            }
        }
        Ok(())
    }

    async fn connect(&self) -> Result<DirectorySession> {
        let directory = self.config.directory.clone();
        match tokio::fs::metadata(&directory).await {
            Ok(metadata) if metadata.is_dir() => Ok(DirectorySession { directory }),
            Ok(_) => Err(Error::Connection(format!(
                "Not a directory: {}",
                directory.display()
            ))),
            Err(e) => Err(Error::Connection(format!(
                "Directory {} is not accessible: {}",
                directory.display(),
                e
            ))),
        }
    }

    async fn disconnect(&self, _session: DirectorySession) -> Result<()> {
        Ok(())
    }

    async fn is_alive(&self, session: &DirectorySession) -> bool {
        tokio::fs::metadata(&session.directory)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    async fn probe(&self, session: &mut DirectorySession) -> Vec<ProbeResult> {
        vec![
            self.probe_directory(&session.directory).await,
            self.probe_io(&session.directory).await,
            self.probe_support_directories().await,
        ]
    }

    async fn fetch(&self, session: &mut DirectorySession, cursor: &IncrementalCursor) -> Result<Vec<RawItem>> {
        if self.mode != AdapterMode::Sender {
            return Err(Error::Unsupported("file receiver does not poll".into()));
        }

        let mut items = Vec::new();
        for (path, fields) in self.list(&session.directory).await? {
            if !cursor.admits(&fields) {
                continue;
            }
            let content = match self.read_unlocked(&path).await? {
                Some(content) => content,
                None => continue,
            };
            let key = fields
                .get("fileName")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            items.push(RawItem {
                key,
                content: content.into(),
                fields,
            });
        }

        debug!(
            "Found {} files in {}",
            items.len(),
            session.directory.display()
        );
        Ok(items)
    }

    async fn acknowledge(&self, _session: &mut DirectorySession, item: &RawItem, outcome: ItemOutcome) -> Result<()> {
        let path = match item.fields.get("filePath").and_then(|v| v.as_str()) {
            Some(path) => PathBuf::from(path),
            None => return Ok(()),
        };

        let (directory, keep_source) = match outcome {
            ItemOutcome::Processed => match self.config.processing_mode {
                ProcessingMode::Keep => return Ok(()),
                ProcessingMode::Delete => {
                    LocalFs.remove(&path).await?;
                    debug!("Deleted processed file {}", path.display());
                    return Ok(());
                }
                ProcessingMode::Move => (&self.config.archive_directory, false),
                ProcessingMode::Copy => (&self.config.archive_directory, true),
            },
            ItemOutcome::Failed => (&self.config.error_directory, false),
            ItemOutcome::Duplicate => (&self.config.duplicate_directory, false),
        };

        if let Some(directory) = directory {
            let target = self.relocate(&path, directory, keep_source).await?;
            debug!(
                "Settled {} file {} to {}",
                outcome.as_str(),
                path.display(),
                target.display()
            );
        }
        Ok(())
    }

    async fn deliver(&self, session: &mut DirectorySession, delivery: &Delivery) -> Result<DeliveryReceipt> {
        if self.mode != AdapterMode::Receiver {
            return Err(Error::Unsupported("file sender does not deliver".into()));
        }

        let name = self.unit_name(delivery);
        if name.is_empty() || name.contains('/') || name.contains('\\') {
            return Err(Error::Validation(format!("Invalid file name '{}'", name)));
        }
        let target = session.directory.join(&name);
        let content = self.unit_content(delivery);

        let report = self.materializer.materialize(&target, &content).await?;
        info!(
            "Wrote {} items ({} bytes) to {}",
            delivery.items.len(),
            report.bytes_written,
            target.display()
        );

        let mut metadata = Metadata::new();
        metadata.insert("fileName".into(), name.into());
        metadata.insert("filePath".into(), target.display().to_string().into());
        metadata.insert("finalSize".into(), report.final_size.into());
        if let Some(backup) = &report.backup_path {
            metadata.insert("backupPath".into(), backup.display().to_string().into());
        }
        if let Some(checksum) = &report.checksum_path {
            metadata.insert("checksumPath".into(), checksum.display().to_string().into());
        }

        Ok(DeliveryReceipt {
            reference: target.display().to_string(),
            bytes_written: report.bytes_written,
            item_count: delivery.items.len(),
            metadata,
        })
    }

    fn describe(&self) -> String {
        let options = self.materializer.options();
        format!(
            "Directory: {}, pattern: {}, processing: {:?}, write mode: {:?}, atomic: {}, backups: {}",
            self.config.directory.display(),
            self.config.file_pattern.as_deref().unwrap_or("*"),
            self.config.processing_mode,
            options.write_mode,
            options.atomic_write,
            if options.backup_enabled {
                options.max_backup_files.to_string()
            } else {
                "off".to_string()
            }
        )
    }
}

async fn read_if_present(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(content) => Ok(Some(content)),
        // Picked up by a concurrent consumer between listing and reading
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
