//! Reproducible tar archives.
//!
//! Archives are written so that the same directory tree always produces the
//! same bytes: entries are sorted by name, timestamps are zeroed, and owner
//! ids and names are cleared.
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tar::{Archive, Builder, EntryType, Header};
use tracing::instrument;
use walkdir::WalkDir;

use crate::Error;

fn reproducible_header(entry_type: EntryType, mode: u32, size: u64) -> std::io::Result<Header> {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_size(size);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_username("")?;
    header.set_groupname("")?;
    Ok(header)
}

/// Writes a reproducible archive of the contents of `root` into `w`.
/// Entry names are relative to `root`, which itself is not part of the
/// archive. Returns the writer once the archive is complete.
#[instrument(skip(w), err)]
pub async fn write_archive<W>(root: &Path, w: W) -> Result<W, Error>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut builder = Builder::new(w);

    for entry in WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry?;
        let path = entry.path();
        let name = path
            .strip_prefix(root)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let metadata = entry.metadata()?;
        let mode = metadata.permissions().mode();
        let file_type = entry.file_type();

        if file_type.is_dir() {
            let mut header = reproducible_header(EntryType::Directory, mode, 0)?;
            builder
                .append_data(&mut header, name, tokio::io::empty())
                .await?;
        } else if file_type.is_symlink() {
            let target = tokio::fs::read_link(path).await?;
            let mut header = reproducible_header(EntryType::Symlink, mode, 0)?;
            header.set_link_name(&target)?;
            builder
                .append_data(&mut header, name, tokio::io::empty())
                .await?;
        } else if file_type.is_file() {
            let mut header = reproducible_header(EntryType::Regular, mode, metadata.len())?;
            let file = tokio::fs::File::open(path).await?;
            builder.append_data(&mut header, name, file).await?;
        } else {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unsupported file type at {path:?}"),
            )));
        }
    }

    Ok(builder.into_inner().await?)
}

/// Unpacks an archive into `dst`, which must exist.
#[instrument(skip(r), err)]
pub async fn unpack_archive<R>(r: R, dst: &Path) -> Result<(), Error>
where
    R: AsyncRead + Unpin + Send,
{
    let mut archive = Archive::new(r);
    archive.unpack(dst).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::Hasher;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn populate(root: &Path) {
        std::fs::create_dir_all(root.join("bin")).unwrap();
        std::fs::write(root.join("bin/hello"), "#!/bin/sh\necho hello\n").unwrap();
        std::fs::set_permissions(root.join("bin/hello"), std::fs::Permissions::from_mode(0o755))
            .unwrap();
        std::fs::write(root.join("README"), "hi").unwrap();
        symlink("bin/hello", root.join("hello")).unwrap();
    }

    async fn archive_bytes(root: &Path) -> Vec<u8> {
        write_archive(root, std::io::Cursor::new(Vec::new()))
            .await
            .unwrap()
            .into_inner()
    }

    #[tokio::test]
    async fn same_tree_same_bytes() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        populate(a.path());
        populate(b.path());

        let bytes_a = archive_bytes(a.path()).await;
        let bytes_b = archive_bytes(b.path()).await;
        assert!(!bytes_a.is_empty());
        assert_eq!(bytes_a, bytes_b);

        let mut ha = Hasher::new();
        ha.update(&bytes_a);
        let mut hb = Hasher::new();
        hb.update(&bytes_b);
        assert_eq!(ha.finish(), hb.finish());
    }

    #[tokio::test]
    async fn content_changes_bytes() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        populate(a.path());
        populate(b.path());
        std::fs::write(b.path().join("README"), "ho").unwrap();

        assert_ne!(archive_bytes(a.path()).await, archive_bytes(b.path()).await);
    }

    #[tokio::test]
    async fn unpack_restores_tree() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        populate(src.path());

        let bytes = archive_bytes(src.path()).await;
        unpack_archive(std::io::Cursor::new(bytes), dst.path())
            .await
            .unwrap();

        assert_eq!(
            "#!/bin/sh\necho hello\n",
            std::fs::read_to_string(dst.path().join("bin/hello")).unwrap()
        );
        assert_eq!(
            0o755,
            std::fs::metadata(dst.path().join("bin/hello"))
                .unwrap()
                .permissions()
                .mode()
                & 0o777
        );
        assert_eq!(
            Path::new("bin/hello"),
            std::fs::read_link(dst.path().join("hello")).unwrap()
        );
    }
}
