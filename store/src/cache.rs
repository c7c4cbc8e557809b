//! Caches hold built derivations and their outputs, so they don't have to be
//! built again.
//!
//! Everything in a cache is normalized: store paths point at the prefix of
//! record instead of a real store, so the content can be moved into any store
//! with the same padding length.
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, instrument, warn};

use crate::archive::{unpack_archive, write_archive};
use crate::derivation::Derivation;
use crate::store::Store;
use crate::textreplace::{ReplacingReader, Replacements};
use crate::Error;

pub type ArchiveReader = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get_derivation(&self, filename: &str) -> Result<Option<Derivation>, Error>;

    /// Returns a tar archive of the output with the given hash.
    async fn get_output(&self, hash: &str) -> Result<Option<ArchiveReader>, Error>;

    async fn put_derivation(&self, drv: &Derivation) -> Result<(), Error>;

    async fn put_output(&self, hash: &str, archive: ArchiveReader) -> Result<(), Error>;
}

/// A cache that never has anything.
#[derive(Clone, Debug, Default)]
pub struct NoopCache {}

#[async_trait]
impl Cache for NoopCache {
    async fn get_derivation(&self, _filename: &str) -> Result<Option<Derivation>, Error> {
        Ok(None)
    }

    async fn get_output(&self, _hash: &str) -> Result<Option<ArchiveReader>, Error> {
        Ok(None)
    }

    async fn put_derivation(&self, _drv: &Derivation) -> Result<(), Error> {
        Ok(())
    }

    async fn put_output(&self, _hash: &str, mut archive: ArchiveReader) -> Result<(), Error> {
        tokio::io::copy(&mut archive, &mut tokio::io::sink()).await?;
        Ok(())
    }
}

/// A cache in a local directory, holding `derivations/<filename>` and
/// `outputs/<hash>.tar`.
#[derive(Clone, Debug)]
pub struct LocalCache {
    root: PathBuf,
}

impl LocalCache {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        std::fs::create_dir_all(root.join("derivations"))?;
        std::fs::create_dir_all(root.join("outputs"))?;
        Ok(Self { root })
    }

    fn derivation_path(&self, filename: &str) -> PathBuf {
        self.root.join("derivations").join(filename)
    }

    fn output_path(&self, hash: &str) -> PathBuf {
        self.root.join("outputs").join(format!("{hash}.tar"))
    }
}

#[async_trait]
impl Cache for LocalCache {
    async fn get_derivation(&self, filename: &str) -> Result<Option<Derivation>, Error> {
        match tokio::fs::read(self.derivation_path(filename)).await {
            Ok(data) => Ok(Some(Derivation::from_json(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_output(&self, hash: &str) -> Result<Option<ArchiveReader>, Error> {
        match tokio::fs::File::open(self.output_path(hash)).await {
            Ok(f) => Ok(Some(Box::new(f))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put_derivation(&self, drv: &Derivation) -> Result<(), Error> {
        tokio::fs::write(self.derivation_path(&drv.filename()), drv.json()).await?;
        Ok(())
    }

    async fn put_output(&self, hash: &str, mut archive: ArchiveReader) -> Result<(), Error> {
        let dst = self.output_path(hash);
        if tokio::fs::try_exists(&dst).await? {
            tokio::io::copy(&mut archive, &mut tokio::io::sink()).await?;
            return Ok(());
        }
        let tmp = self.root.join("outputs").join(format!(".{hash}.tar.tmp"));
        let mut file = tokio::fs::File::create(&tmp).await?;
        tokio::io::copy(&mut archive, &mut file).await?;
        file.flush().await?;
        tokio::fs::rename(&tmp, &dst).await?;
        Ok(())
    }
}

/// Store entries an output refers to, including the output itself.
fn output_references(output_hash: &str, dependencies: &[String]) -> Vec<String> {
    std::iter::once(output_hash.to_string())
        .chain(dependencies.iter().cloned())
        .collect()
}

/// Uploads `drv` and all of its outputs to `cache`.
#[instrument(skip_all, fields(drv.name = %drv.name), err)]
pub async fn upload(cache: &dyn Cache, store: &Store, drv: &Derivation) -> Result<(), Error> {
    for output in &drv.outputs {
        let references: Vec<String> = output_references(&output.path, &output.dependencies)
            .iter()
            .map(|r| store.entry_path(r))
            .collect();
        let to_record = Replacements::prefix(
            &references,
            &format!("{}/", store.store_path()),
            &format!("{}/", store.prefix_of_record()),
        )?;

        let (w, r) = tokio::io::duplex(64 * 1024);
        let dir = store.join(&output.path);
        let write = async move {
            write_archive(&dir, w).await?;
            Ok::<_, Error>(())
        };
        let put = cache.put_output(&output.path, Box::new(ReplacingReader::new(to_record, r)));
        tokio::try_join!(write, put)?;
        debug!(output = %output.path, "uploaded output");
    }
    cache.put_derivation(&store.normalize_derivation(drv)?).await
}

/// Fetches the built version of `drv` and its outputs from `cache` into
/// `store`. Returns [None] if the cache doesn't have all of it.
#[instrument(skip_all, fields(drv.name = %drv.name), err)]
pub async fn download(
    cache: &dyn Cache,
    store: &Store,
    drv: &Derivation,
) -> Result<Option<Derivation>, Error> {
    let Some(cached) = cache.get_derivation(&drv.filename()).await? else {
        return Ok(None);
    };
    if cached.missing_output() {
        warn!("cached derivation has no outputs");
        return Ok(None);
    }

    for output in &cached.outputs {
        if tokio::fs::try_exists(store.join(&output.path)).await? {
            continue;
        }
        let Some(archive) = cache.get_output(&output.path).await? else {
            debug!(output = %output.path, "output missing from cache");
            return Ok(None);
        };
        let references: Vec<String> = output_references(&output.path, &output.dependencies)
            .iter()
            .map(|r| format!("{}/{r}", store.prefix_of_record()))
            .collect();
        let to_store = Replacements::prefix(
            &references,
            &format!("{}/", store.prefix_of_record()),
            &format!("{}/", store.store_path()),
        )?;

        let scratch = store.scratch_dir()?;
        unpack_archive(ReplacingReader::new(to_store, archive), scratch.path()).await?;

        // self references already carry the final name, null those out
        let dependency_paths: Vec<String> = output
            .dependencies
            .iter()
            .map(|d| store.entry_path(d))
            .collect();
        let hashed = store
            .hash_directory(scratch.path(), None, Some(&output.path), &dependency_paths)
            .await?;
        if hashed.hash != output.path {
            return Err(Error::HashMismatch {
                key: format!("cache output {}", output.path),
                wanted: output.path.clone(),
                got: hashed.hash,
            });
        }
        store.commit(hashed).await?;
    }

    let mut built = drv.clone();
    built.outputs = cached.outputs;
    store.write_derivation(&built).await?;
    Ok(Some(built))
}
