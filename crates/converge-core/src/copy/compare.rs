//! Deciding whether an existing destination is out of date

use crate::Result;
use crate::context::RunContext;
use crate::spec::Comparator;
use crate::transport::Transport;
use converge_fs::FileMetadata;
use converge_fs::checksum::{compute_reader_checksum, readers_identical};

/// Whether `dest` must be refreshed from `source` under `comparator`.
pub fn needs_update(
    ctx: &RunContext,
    transport: &dyn Transport,
    source: &FileMetadata,
    dest: &FileMetadata,
    comparator: Comparator,
) -> Result<bool> {
    let content = source.is_regular() && dest.is_regular();

    let stale = match comparator {
        Comparator::Exists => false,
        Comparator::Mtime => dest.mtime < source.mtime,
        Comparator::Ctime => older(source, dest),
        Comparator::Atime => older(source, dest) || (content && bytes_differ(ctx, transport, source, dest)?),
        Comparator::Checksum if content => digests_differ(ctx, transport, source, dest)?,
        Comparator::Binary if content => bytes_differ(ctx, transport, source, dest)?,
        Comparator::Checksum | Comparator::Binary => older(source, dest),
    };

    tracing::debug!(
        dest = %dest.path.display(),
        ?comparator,
        stale,
        "Compared destination with source"
    );
    Ok(stale)
}

fn older(source: &FileMetadata, dest: &FileMetadata) -> bool {
    dest.ctime < source.ctime || dest.mtime < source.mtime
}

fn digests_differ(
    ctx: &RunContext,
    transport: &dyn Transport,
    source: &FileMetadata,
    dest: &FileMetadata,
) -> Result<bool> {
    if source.size != dest.size {
        return Ok(true);
    }
    let theirs = transport.digest(&source.path)?;
    let file = ctx.fs.open(&dest.path)?;
    let ours = compute_reader_checksum(file).map_err(|e| converge_fs::Error::io(&dest.path, e))?;
    Ok(theirs != ours)
}

fn bytes_differ(
    ctx: &RunContext,
    transport: &dyn Transport,
    source: &FileMetadata,
    dest: &FileMetadata,
) -> Result<bool> {
    if source.size != dest.size {
        return Ok(true);
    }
    let theirs = transport.open(&source.path)?;
    let ours = ctx.fs.open(&dest.path)?;
    let same = readers_identical(theirs, ours).map_err(|e| converge_fs::Error::io(&dest.path, e))?;
    Ok(!same)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;
    use converge_fs::local_stat;
    use filetime::{FileTime, set_file_mtime};
    use rstest::rstest;
    use std::fs;
    use std::path::PathBuf;

    fn pair(src: &str, dst: &str, src_mtime: i64, dst_mtime: i64) -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let s = dir.path().join("src");
        let d = dir.path().join("dst");
        fs::write(&s, src).unwrap();
        fs::write(&d, dst).unwrap();
        set_file_mtime(&s, FileTime::from_unix_time(src_mtime, 0)).unwrap();
        set_file_mtime(&d, FileTime::from_unix_time(dst_mtime, 0)).unwrap();
        (dir, s, d)
    }

    fn check(comparator: Comparator, s: &PathBuf, d: &PathBuf) -> bool {
        let ctx = RunContext::new();
        needs_update(
            &ctx,
            &LocalTransport,
            &local_stat(s, false).unwrap(),
            &local_stat(d, false).unwrap(),
            comparator,
        )
        .unwrap()
    }

    #[rstest]
    #[case::newer_source(2_000, 1_000, true)]
    #[case::same_time(1_000, 1_000, false)]
    #[case::newer_dest(1_000, 2_000, false)]
    fn mtime_comparator(#[case] src: i64, #[case] dst: i64, #[case] expected: bool) {
        let (_dir, s, d) = pair("a", "a", src, dst);
        assert_eq!(check(Comparator::Mtime, &s, &d), expected);
    }

    #[rstest]
    #[case::identical("same", "same", false)]
    #[case::same_size("abcd", "abce", true)]
    #[case::different_size("abc", "abcdef", true)]
    fn content_comparators(#[case] src: &str, #[case] dst: &str, #[case] expected: bool) {
        // Destination is newer so only content can trigger a copy.
        let (_dir, s, d) = pair(src, dst, 1_000, 2_000);
        assert_eq!(check(Comparator::Checksum, &s, &d), expected);
        assert_eq!(check(Comparator::Binary, &s, &d), expected);
    }

    #[test]
    fn exists_never_recopies() {
        let (_dir, s, d) = pair("new", "old", 2_000, 1_000);
        assert!(!check(Comparator::Exists, &s, &d));
    }
}
