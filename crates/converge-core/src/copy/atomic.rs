//! Atomic copy transaction
//!
//! Content is streamed into a sibling temp file, checked for size and
//! (optionally) digest, the old destination is set aside as a backup and
//! the temp file is renamed into place. Any failure after the temp file was
//! written removes it and puts the backup back, so the destination under
//! its real name is always either the old or the new content.

use crate::context::RunContext;
use crate::outcome::Outcome;
use crate::spec::{BackupMode, CopyPolicy};
use crate::transport::Transport;
use crate::{Error, Result};
use chrono::Local;
use converge_fs::FileMetadata;
use converge_fs::checksum::compute_reader_checksum;
use converge_fs::path::{canonify_name, with_suffix};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Suffix of the temp file a copy is written to.
pub const NEW_SUFFIX: &str = ".converge.new";
/// Suffix of the backup taken of a replaced destination.
pub const SAVED_SUFFIX: &str = ".converge.saved";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    NotStarted,
    WrittenToTemp,
    Verified,
    BackedUp,
    Committed,
    RestoreAttempted,
    Restored,
    RestoreFailed,
}

/// The destination as it was before the transaction, set aside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub original: PathBuf,
    pub backup: PathBuf,
}

/// One file's copy transaction.
#[derive(Debug)]
pub struct CopyTransaction<'a> {
    ctx: &'a RunContext,
    dest: PathBuf,
    temp: PathBuf,
    state: TransactionState,
    backup: Option<BackupRecord>,
}

impl<'a> CopyTransaction<'a> {
    pub fn new(ctx: &'a RunContext, dest: &Path) -> Self {
        Self {
            ctx,
            dest: dest.to_path_buf(),
            temp: with_suffix(dest, NEW_SUFFIX),
            state: TransactionState::NotStarted,
            backup: None,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    pub fn backup(&self) -> Option<&BackupRecord> {
        self.backup.as_ref()
    }

    /// Stream `source` into the temp file and give it `mode`.
    pub fn write_from(&mut self, transport: &dyn Transport, source: &Path, mode: u32) -> Result<u64> {
        let mut reader = transport.open(source)?;
        let mut file = self.ctx.fs.create_file(&self.temp, 0o600)?;
        self.state = TransactionState::WrittenToTemp;

        let written = io::copy(&mut reader, &mut file).map_err(|e| converge_fs::Error::io(&self.temp, e))?;
        file.flush()
            .and_then(|()| file.sync_all())
            .and_then(|()| file.set_permissions(std::fs::Permissions::from_mode(mode & 0o7777)))
            .map_err(|e| converge_fs::Error::io(&self.temp, e))?;

        tracing::debug!(temp = %self.temp.display(), bytes = written, "Wrote temp copy");
        Ok(written)
    }

    /// Fail if the temp file is not exactly `expected` bytes long.
    pub fn check_size(&mut self, expected: u64) -> Result<()> {
        let found = self.ctx.fs.stat(&self.temp, false)?.size;
        if found != expected {
            return Err(Error::Verification {
                path: self.dest.clone(),
                message: format!("corrupted in transit: {found} bytes written, source has {expected}"),
            });
        }
        Ok(())
    }

    /// Compare digests of the source and the temp file.
    pub fn verify(&mut self, transport: &dyn Transport, source: &Path) -> Result<()> {
        let expected = transport.digest(source)?;
        let file = self.ctx.fs.open(&self.temp)?;
        let found = compute_reader_checksum(file).map_err(|e| converge_fs::Error::io(&self.temp, e))?;
        if expected != found {
            return Err(Error::Verification {
                path: self.dest.clone(),
                message: format!("digest {found} does not match source {expected}"),
            });
        }
        self.state = TransactionState::Verified;
        Ok(())
    }

    /// Set the current destination aside.
    ///
    /// Returns `Failed` when a stale backup from an earlier run could not be
    /// removed; the transaction still goes on.
    pub fn back_up(&mut self, mode: BackupMode) -> Result<Outcome> {
        if mode == BackupMode::Disabled || !self.ctx.fs.exists(&self.dest) {
            return Ok(Outcome::NoChange);
        }

        let suffix = match mode {
            BackupMode::Timestamp => format!(
                "_{}_{}{SAVED_SUFFIX}",
                self.ctx.started.timestamp(),
                Local::now().format("%Y%m%d%H%M%S")
            ),
            _ => SAVED_SUFFIX.to_string(),
        };
        let backup = with_suffix(&self.dest, &suffix);

        let mut outcome = Outcome::NoChange;
        if self.ctx.fs.exists(&backup)
            && let Err(e) = self.ctx.fs.remove_tree(&backup)
        {
            outcome = self.ctx.record(
                &self.dest,
                Outcome::Failed,
                format!("could not remove stale backup {}: {e}", backup.display()),
            );
        }

        self.ctx.fs.rename(&self.dest, &backup)?;
        tracing::debug!(dest = %self.dest.display(), backup = %backup.display(), "Backed up destination");
        self.backup = Some(BackupRecord {
            original: self.dest.clone(),
            backup,
        });
        self.state = TransactionState::BackedUp;
        Ok(outcome)
    }

    /// Publish the temp file under the real name.
    pub fn commit(&mut self) -> Result<()> {
        self.ctx.fs.rename(&self.temp, &self.dest)?;
        self.state = TransactionState::Committed;
        Ok(())
    }

    /// Undo everything after the temp write: drop the temp file and put
    /// the backup back in place.
    pub fn rollback(&mut self) -> TransactionState {
        if self.state == TransactionState::NotStarted || self.state == TransactionState::Committed {
            return self.state;
        }

        if self.ctx.fs.exists(&self.temp)
            && let Err(e) = self.ctx.fs.remove_file(&self.temp)
        {
            tracing::warn!(temp = %self.temp.display(), error = %e, "Could not remove temp copy");
        }

        let Some(record) = self.backup.take() else {
            return self.state;
        };

        self.state = TransactionState::RestoreAttempted;
        self.state = match self.ctx.fs.rename(&record.backup, &record.original) {
            Ok(()) => {
                self.ctx.record(
                    &record.original,
                    Outcome::NoChange,
                    "restored previous content from backup",
                );
                TransactionState::Restored
            }
            Err(e) => {
                self.ctx.record(
                    &record.original,
                    Outcome::Failed,
                    format!("could not restore backup {}: {e}", record.backup.display()),
                );
                TransactionState::RestoreFailed
            }
        };
        self.state
    }

    /// Move the backup into `repository` and remove it from beside the
    /// destination. Without a repository the backup stays where it is.
    pub fn archive(&mut self, repository: Option<&Path>) -> Result<()> {
        let (Some(repository), Some(record)) = (repository, self.backup.as_ref()) else {
            return Ok(());
        };
        if archive_to_repository(self.ctx, &record.backup, repository)? {
            self.ctx.fs.remove_file(&record.backup)?;
            self.backup = None;
        }
        Ok(())
    }
}

/// Copy `file` into `repository` under a flattened name. Directories are
/// left alone. Returns whether an archive copy was written.
pub fn archive_to_repository(ctx: &RunContext, file: &Path, repository: &Path) -> Result<bool> {
    let meta = ctx.fs.stat(file, false)?;
    if !meta.is_regular() {
        tracing::info!(path = %file.display(), "Cannot archive a non-file to the repository");
        return Ok(false);
    }

    ctx.fs.create_dir_all(repository, 0o700)?;
    let archived = repository.join(canonify_name(file));
    let mut reader = ctx.fs.open(file)?;
    let mut writer = ctx.fs.create_file(&archived, meta.mode)?;
    io::copy(&mut reader, &mut writer).map_err(|e| converge_fs::Error::io(&archived, e))?;
    tracing::info!(path = %file.display(), archive = %archived.display(), "Archived to repository");
    Ok(true)
}

/// Run a full transaction copying `source` over `dest`.
pub fn transfer(
    ctx: &RunContext,
    transport: &dyn Transport,
    source: &FileMetadata,
    dest: &Path,
    policy: &CopyPolicy,
) -> Result<Outcome> {
    let mut tx = CopyTransaction::new(ctx, dest);

    match run_steps(&mut tx, transport, source, policy) {
        Ok(outcome) => {
            let repository = policy.repository.as_deref().or(ctx.repository.as_deref());
            if let Err(e) = tx.archive(repository) {
                tracing::warn!(dest = %dest.display(), error = %e, "Archiving backup failed");
            }
            Ok(outcome)
        }
        Err(e) => {
            let state = tx.rollback();
            tracing::debug!(dest = %dest.display(), ?state, "Copy transaction rolled back");
            Err(e)
        }
    }
}

fn run_steps(
    tx: &mut CopyTransaction<'_>,
    transport: &dyn Transport,
    source: &FileMetadata,
    policy: &CopyPolicy,
) -> Result<Outcome> {
    tx.write_from(transport, &source.path, source.mode)?;
    tx.check_size(source.size)?;
    if policy.verify {
        tx.verify(transport, &source.path)?;
    }
    let outcome = tx.back_up(policy.backup)?;
    tx.commit()?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LocalTransport, TransportResult};
    use converge_fs::local_stat;
    use pretty_assertions::assert_eq;
    use std::ffi::OsString;
    use std::fs;
    use std::io::Read;

    /// Serves truncated content so the size check trips.
    struct Truncating;

    impl Transport for Truncating {
        fn server(&self) -> &str {
            "truncating"
        }
        fn stat(&self, path: &Path, follow: bool) -> TransportResult<FileMetadata> {
            LocalTransport.stat(path, follow)
        }
        fn read_link(&self, path: &Path) -> TransportResult<PathBuf> {
            LocalTransport.read_link(path)
        }
        fn read_dir(&self, path: &Path) -> TransportResult<Vec<OsString>> {
            LocalTransport.read_dir(path)
        }
        fn open(&self, path: &Path) -> TransportResult<Box<dyn Read + Send>> {
            Ok(Box::new(LocalTransport.open(path)?.take(2)))
        }
    }

    /// Serves the real content but reports a digest that never matches.
    struct MisreportedDigest;

    impl Transport for MisreportedDigest {
        fn server(&self) -> &str {
            "misreporting"
        }
        fn stat(&self, path: &Path, follow: bool) -> TransportResult<FileMetadata> {
            LocalTransport.stat(path, follow)
        }
        fn read_link(&self, path: &Path) -> TransportResult<PathBuf> {
            LocalTransport.read_link(path)
        }
        fn read_dir(&self, path: &Path) -> TransportResult<Vec<OsString>> {
            LocalTransport.read_dir(path)
        }
        fn open(&self, path: &Path) -> TransportResult<Box<dyn Read + Send>> {
            LocalTransport.open(path)
        }
        fn digest(&self, _path: &Path) -> TransportResult<String> {
            Ok(format!("sha256:{}", "0".repeat(64)))
        }
    }

    fn setup(src: &str, dest: Option<&str>) -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let s = dir.path().join("src");
        let d = dir.path().join("dst");
        fs::write(&s, src).unwrap();
        if let Some(content) = dest {
            fs::write(&d, content).unwrap();
        }
        (dir, s, d)
    }

    #[test]
    fn transfer_replaces_and_keeps_backup() {
        let (_dir, src, dst) = setup("new", Some("old"));
        let ctx = RunContext::new();

        let outcome = transfer(
            &ctx,
            &LocalTransport,
            &local_stat(&src, false).unwrap(),
            &dst,
            &CopyPolicy::default(),
        )
        .unwrap();

        assert_eq!(outcome, Outcome::NoChange);
        assert_eq!(fs::read_to_string(&dst).unwrap(), "new");
        assert_eq!(
            fs::read_to_string(with_suffix(&dst, SAVED_SUFFIX)).unwrap(),
            "old"
        );
        assert!(!with_suffix(&dst, NEW_SUFFIX).exists());
    }

    #[test]
    fn truncated_transfer_leaves_destination_untouched() {
        let (_dir, src, dst) = setup("hello world", Some("original"));
        let ctx = RunContext::new();

        let err = transfer(
            &ctx,
            &Truncating,
            &local_stat(&src, false).unwrap(),
            &dst,
            &CopyPolicy::default(),
        )
        .unwrap_err();

        assert!(matches!(err, Error::Verification { .. }));
        assert_eq!(fs::read_to_string(&dst).unwrap(), "original");
        assert!(!with_suffix(&dst, NEW_SUFFIX).exists());
    }

    #[test]
    fn rollback_restores_backup() {
        let (_dir, src, dst) = setup("new", Some("old"));
        let ctx = RunContext::new();
        let mut tx = CopyTransaction::new(&ctx, &dst);

        tx.write_from(&LocalTransport, &src, 0o644).unwrap();
        tx.back_up(BackupMode::Plain).unwrap();
        assert!(!dst.exists());

        assert_eq!(tx.rollback(), TransactionState::Restored);
        assert_eq!(fs::read_to_string(&dst).unwrap(), "old");
        assert!(!tx.temp_path().exists());
    }

    #[test]
    fn timestamped_backup_has_stamp_and_suffix() {
        let (_dir, _src, dst) = setup("new", Some("old"));
        let ctx = RunContext::new();
        let mut tx = CopyTransaction::new(&ctx, &dst);
        tx.back_up(BackupMode::Timestamp).unwrap();

        let name = tx.backup().unwrap().backup.to_string_lossy().into_owned();
        assert!(name.contains(&format!("_{}_", ctx.started.timestamp())));
        assert!(name.ends_with(SAVED_SUFFIX));
    }

    #[test]
    fn repository_receives_backup() {
        let (dir, src, dst) = setup("new", Some("old"));
        let ctx = RunContext::new();
        let repo = dir.path().join("repo");
        let policy = CopyPolicy {
            repository: Some(repo.clone()),
            ..CopyPolicy::default()
        };

        transfer(&ctx, &LocalTransport, &local_stat(&src, false).unwrap(), &dst, &policy).unwrap();

        let backup = with_suffix(&dst, SAVED_SUFFIX);
        assert!(!backup.exists());
        let archived = repo.join(canonify_name(&backup));
        assert_eq!(fs::read_to_string(archived).unwrap(), "old");
    }

    #[test]
    fn verify_accepts_identical_content() {
        let (_dir, src, dst) = setup("same", None);
        let ctx = RunContext::new();
        let policy = CopyPolicy {
            verify: true,
            backup: BackupMode::Disabled,
            ..CopyPolicy::default()
        };
        transfer(&ctx, &LocalTransport, &local_stat(&src, false).unwrap(), &dst, &policy).unwrap();
        assert_eq!(fs::read_to_string(&dst).unwrap(), "same");
    }

    #[test]
    fn failed_verification_leaves_destination_byte_identical() {
        let (_dir, src, dst) = setup("fresh content", Some("original bytes"));
        let ctx = RunContext::new();
        let policy = CopyPolicy {
            verify: true,
            backup: BackupMode::Plain,
            ..CopyPolicy::default()
        };

        let err = transfer(&ctx, &MisreportedDigest, &local_stat(&src, false).unwrap(), &dst, &policy)
            .unwrap_err();

        assert!(matches!(err, Error::Verification { .. }), "unexpected error: {err}");
        assert_eq!(fs::read(&dst).unwrap(), b"original bytes");
        assert!(!with_suffix(&dst, NEW_SUFFIX).exists());
        assert!(!with_suffix(&dst, SAVED_SUFFIX).exists());
    }
}
