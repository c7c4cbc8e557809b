//! The content addressed store on disk.
//!
//! ```text
//! $BRAMBLE_PATH/
//!   store -> ./bramble_store_padding/...
//!   bramble_store_padding/.../<padded root>/
//!     <hash>-<name>.drv      derivations with their outputs
//!     <hash>/                build outputs and sources
//!     <hash>                 blobs
//!   var/config-registry/     links to known projects
//!   var/dependencies/
//! ```
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use regex::{Captures, Regex};
use tempfile::{NamedTempFile, TempDir};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio_util::io::InspectReader;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::archive::{unpack_archive, write_archive};
use crate::derivation::{find_placeholders, replace_placeholders, Derivation, Output};
use crate::hasher::{hash_string, Hasher, HASH_LENGTH};
use crate::paths::{padded_directory_name, BUILD_DIR_PREFIX, SCRATCH_RANDOM_LENGTH};
use crate::textreplace::{ReplacingReader, Replacements};
use crate::{Error, StoreConfig};

const VAR_DIR: &str = "var";
const CONFIG_REGISTRY_DIR: &str = "var/config-registry";
const DEPENDENCIES_DIR: &str = "var/dependencies";
const STORE_LINK: &str = "store";

/// Bramble path every store pretends to live at when hashing.
const BRAMBLE_PATH_OF_RECORD: &str = "/home/bramble/bramble";

const PIPE_SIZE: usize = 64 * 1024;

/// An output directory archived and hashed, but not yet moved into the
/// store.
#[derive(Debug)]
pub struct HashedDirectory {
    pub hash: String,
    /// Store entries the contents refer to.
    pub references: Vec<String>,
    archive: tokio::fs::File,
    folder_name: Option<String>,
}

#[derive(Debug)]
pub struct Store {
    bramble_path: PathBuf,
    root: String,
    prefix_of_record: String,
    record_path_re: Regex,
}

impl Store {
    /// Opens the store described by `config`, creating it if needed.
    #[instrument(err)]
    pub fn new(config: &StoreConfig) -> Result<Self, Error> {
        let bramble_path = config.resolve_bramble_path()?;
        let base = bramble_path
            .to_str()
            .ok_or_else(|| Error::NonUtf8Path(bramble_path.clone()))?;

        let name = padded_directory_name(base, config.padding_length)?;
        let root = format!("{base}{name}");
        let prefix_of_record = format!(
            "{BRAMBLE_PATH_OF_RECORD}{}",
            padded_directory_name(BRAMBLE_PATH_OF_RECORD, config.padding_length)?
        );

        // an existing link means the store was set up before, and its root
        // must still be there
        let link = bramble_path.join(STORE_LINK);
        if std::fs::symlink_metadata(&link).is_err() {
            std::fs::create_dir_all(&root)?;
            std::os::unix::fs::symlink(format!(".{name}"), &link)?;
        }
        for dir in [VAR_DIR, CONFIG_REGISTRY_DIR, DEPENDENCIES_DIR] {
            std::fs::create_dir_all(bramble_path.join(dir))?;
        }
        if !Path::new(&root).is_dir() {
            return Err(Error::StorePathMissing(root.into()));
        }

        let record_path_re = Regex::new(&format!(
            "{}/([a-z2-7]{{{HASH_LENGTH}}})",
            regex::escape(&prefix_of_record)
        ))
        .map_err(std::io::Error::other)?;

        info!(store.path = %root, "opened store");

        Ok(Self {
            bramble_path,
            root,
            prefix_of_record,
            record_path_re,
        })
    }

    pub fn bramble_path(&self) -> &Path {
        &self.bramble_path
    }

    /// The padded store root, without a trailing slash.
    pub fn store_path(&self) -> &str {
        &self.root
    }

    /// What [Store::store_path] is replaced with in normalized content.
    pub fn prefix_of_record(&self) -> &str {
        &self.prefix_of_record
    }

    pub fn join(&self, name: &str) -> PathBuf {
        Path::new(&self.root).join(name)
    }

    /// Absolute path of a store entry, as a string.
    pub fn entry_path(&self, name: &str) -> String {
        format!("{}/{name}", self.root)
    }

    pub fn config_registry_path(&self) -> PathBuf {
        self.bramble_path.join(CONFIG_REGISTRY_DIR)
    }

    /// A new empty directory in the store, exactly as long as a store entry.
    /// Removed when dropped.
    pub fn scratch_dir(&self) -> Result<TempDir, Error> {
        Ok(tempfile::Builder::new()
            .prefix(BUILD_DIR_PREFIX)
            .rand_bytes(SCRATCH_RANDOM_LENGTH)
            .tempdir_in(&self.root)?)
    }

    /// A new file in the store, named like [Store::scratch_dir].
    pub fn scratch_file(&self) -> Result<NamedTempFile, Error> {
        Ok(tempfile::Builder::new()
            .prefix(BUILD_DIR_PREFIX)
            .rand_bytes(SCRATCH_RANDOM_LENGTH)
            .tempfile_in(&self.root)?)
    }

    pub async fn load_derivation(&self, filename: &str) -> Result<Option<Derivation>, Error> {
        match tokio::fs::read(self.join(filename)).await {
            Ok(data) => Ok(Some(Derivation::from_json(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Finds the derivation stored under `hash`, whatever its name.
    pub async fn find_derivation(&self, hash: &str) -> Result<Option<Derivation>, Error> {
        let prefix = format!("{hash}-");
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with(&prefix) && name.ends_with(".drv") {
                return self.load_derivation(name).await;
            }
        }
        Ok(None)
    }

    /// Writes `drv` to the store, replacing any previous version.
    #[instrument(skip_all, fields(drv.name = %drv.name), err)]
    pub async fn write_derivation(&self, drv: &Derivation) -> Result<String, Error> {
        let filename = drv.filename();
        let tmp = self.scratch_file()?;
        tokio::fs::write(tmp.path(), drv.json()).await?;
        tokio::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o644)).await?;
        tmp.persist(self.join(&filename)).map_err(|e| e.error)?;
        debug!(filename, "wrote derivation");
        Ok(filename)
    }

    /// True if every output of `drv` is built and present in the store.
    pub async fn outputs_exist(&self, drv: &Derivation) -> bool {
        if drv.missing_output() {
            return false;
        }
        for output in &drv.outputs {
            if !tokio::fs::try_exists(self.join(&output.path))
                .await
                .unwrap_or(false)
            {
                return false;
            }
        }
        true
    }

    /// Returns the stored copy of `drv` if it was built before and all of its
    /// outputs are still around.
    pub async fn check_for_built_derivation(
        &self,
        drv: &Derivation,
    ) -> Result<Option<Derivation>, Error> {
        let Some(stored) = self.load_derivation(&drv.filename()).await? else {
            return Ok(None);
        };
        if self.outputs_exist(&stored).await {
            Ok(Some(stored))
        } else {
            Ok(None)
        }
    }

    /// Stores the contents of `reader` under their hash and returns it.
    #[instrument(skip_all, err)]
    pub async fn write_blob<R>(&self, reader: R) -> Result<String, Error>
    where
        R: AsyncRead + Unpin,
    {
        let tmp = self.scratch_file()?;
        let mut file = tokio::fs::File::from_std(tmp.reopen()?);
        let mut hasher = Hasher::new();
        {
            let mut reader = InspectReader::new(reader, |buf| hasher.update(buf));
            tokio::io::copy(&mut reader, &mut file).await?;
        }
        file.flush().await?;
        let hash = hasher.finish();

        let dst = self.join(&hash);
        if !tokio::fs::try_exists(&dst).await? {
            tokio::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o644))
                .await?;
            tmp.persist(&dst).map_err(|e| e.error)?;
        }
        Ok(hash)
    }

    /// Registers a project location so it can be found again later.
    pub async fn write_config_link(&self, location: &Path) -> Result<(), Error> {
        let s = location
            .to_str()
            .ok_or_else(|| Error::NonUtf8Path(location.to_path_buf()))?;
        let link = self.config_registry_path().join(hash_string(s));
        match tokio::fs::remove_file(&link).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::symlink(location, &link).await?;
        Ok(())
    }

    /// Copies the directory `src` into the store and returns its hash, for
    /// use as a [crate::derivation::Source].
    #[instrument(skip(self), err)]
    pub async fn store_sources(&self, src: &Path) -> Result<String, Error> {
        let hashed = self.hash_directory(src, None, None, &[]).await?;
        let hash = hashed.hash.clone();
        self.commit(hashed).await?;
        Ok(hash)
    }

    /// Store paths of the outputs `drv` depends on: those of its declared
    /// dependencies, and any store entry it names through the prefix of
    /// record.
    pub async fn dependency_store_paths(&self, drv: &Derivation) -> Result<Vec<String>, Error> {
        let mut paths = Vec::with_capacity(drv.dependencies.len());
        for dep in &drv.dependencies {
            let output = self
                .find_derivation(&dep.hash)
                .await?
                .and_then(|built| built.output(&dep.output).cloned())
                .ok_or_else(|| Error::DependencyNotBuilt(dep.to_string()))?;
            paths.push(self.entry_path(&output.path));
        }

        let json = drv.json();
        let recorded: Vec<String> = self
            .record_path_re
            .captures_iter(&String::from_utf8_lossy(&json))
            .map(|c| c[1].to_string())
            .collect();
        for hash in recorded {
            if tokio::fs::try_exists(self.join(&hash)).await? {
                paths.push(self.entry_path(&hash));
            }
        }

        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    /// Returns a copy of `drv` ready to be built by this store: normalized
    /// paths of existing store entries point into this store, and
    /// placeholders of built dependencies are replaced with their paths.
    #[instrument(skip_all, fields(drv.name = %drv.name), err)]
    pub async fn resolve_derivation(&self, drv: &Derivation) -> Result<Derivation, Error> {
        let json = String::from_utf8(drv.json())
            .map_err(|e| Error::invalid_derivation(&drv.name, e.to_string()))?;

        let json = self
            .record_path_re
            .replace_all(&json, |c: &Captures| {
                if self.join(&c[1]).exists() {
                    self.entry_path(&c[1])
                } else {
                    c[0].to_string()
                }
            })
            .into_owned();

        let mut known = HashMap::new();
        for dep in find_placeholders(&json) {
            let Some(built) = self.find_derivation(&dep.hash).await? else {
                continue;
            };
            if let Some(output) = built.output(&dep.output) {
                known.insert(dep.clone(), self.entry_path(&output.path));
            }
        }
        let json = replace_placeholders(&json, |dep| known.get(dep).cloned());
        Derivation::from_json(json.as_bytes())
    }

    /// Replaces this store's root with the prefix of record, making the
    /// derivation independent of where the store lives.
    pub fn normalize_derivation(&self, drv: &Derivation) -> Result<Derivation, Error> {
        drv.map_json(|json| json.replace(&self.root, &self.prefix_of_record))
    }

    /// Archives `dir` and computes its hash.
    ///
    /// The archive is kept as is, except that occurrences of `build_dir` are
    /// masked. The hash is computed over a normalized copy in which the paths
    /// in `dependency_paths` and the directory's own store path are moved to
    /// the prefix of record, and `folder_name` is nulled out.
    #[instrument(skip(self, dependency_paths), err)]
    pub async fn hash_directory(
        &self,
        dir: &Path,
        build_dir: Option<&str>,
        folder_name: Option<&str>,
        dependency_paths: &[String],
    ) -> Result<HashedDirectory, Error> {
        let build_dir_mask = build_dir.map(|d| {
            let keep = d.len().saturating_sub(HASH_LENGTH);
            (d.to_string(), format!("{}{}", &d[..keep], "x".repeat(d.len() - keep)))
        });
        let masked_build_dir = build_dir_mask.as_ref().map(|(_, masked)| masked.clone());
        let mask_build_dir = Replacements::new(build_dir_mask)?;
        // self references and the masked build dir move to the prefix of
        // record too, before the folder name is nulled
        let record_paths: Vec<String> = dependency_paths
            .iter()
            .cloned()
            .chain(folder_name.map(|f| self.entry_path(f)))
            .chain(masked_build_dir.clone())
            .collect();
        let to_record = Replacements::prefix(
            &record_paths,
            &format!("{}/", self.root),
            &format!("{}/", self.prefix_of_record),
        )?;
        let null_folder = Replacements::new(
            folder_name.map(|f| (f.to_string(), vec![0u8; f.len()])),
        )?;

        let archive_file = tokio::fs::File::from_std(tempfile::tempfile_in(&self.root)?);
        let (archive_w, archive_r) = tokio::io::duplex(PIPE_SIZE);
        let (hash_w, hash_r) = tokio::io::duplex(PIPE_SIZE);

        let write = async move {
            write_archive(dir, archive_w).await?;
            Ok::<_, Error>(())
        };

        let tee = async move {
            let mut masked = ReplacingReader::new(mask_build_dir, archive_r);
            let mut file = archive_file;
            let mut hash_w = hash_w;
            loop {
                let buf = masked.fill_buf().await?;
                if buf.is_empty() {
                    break;
                }
                file.write_all(buf).await?;
                hash_w.write_all(buf).await?;
                let n = buf.len();
                masked.consume(n);
            }
            file.flush().await?;
            hash_w.shutdown().await?;
            Ok::<_, Error>(file)
        };

        let hash = async move {
            let mut normalized =
                ReplacingReader::new(null_folder, ReplacingReader::new(to_record, hash_r));
            let mut hasher = Hasher::new();
            {
                let mut reader = InspectReader::new(&mut normalized, |buf| hasher.update(buf));
                tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
            }
            let prefix = format!("{}/", self.root);
            let mut references: Vec<String> = normalized
                .get_ref()
                .matched_patterns()
                .filter_map(|p| std::str::from_utf8(p).ok())
                .filter_map(|p| p.strip_prefix(&prefix))
                .filter(|p| Some(*p) != folder_name)
                .filter(|p| {
                    masked_build_dir.as_deref().and_then(|d| d.strip_prefix(&prefix)) != Some(*p)
                })
                .map(str::to_string)
                .collect();
            references.sort();
            Ok::<_, Error>((hasher.finish(), references))
        };

        let ((), archive, (hash, references)) = tokio::try_join!(write, tee, hash)?;

        debug!(hash, ?references, "hashed directory");

        Ok(HashedDirectory {
            hash,
            references,
            archive,
            folder_name: folder_name.map(str::to_string),
        })
    }

    /// Moves a hashed directory into the store under its hash. Returns false
    /// if the store already had an entry with that hash.
    #[instrument(skip_all, fields(hash = %hashed.hash), err)]
    pub async fn commit(&self, hashed: HashedDirectory) -> Result<bool, Error> {
        let HashedDirectory {
            hash,
            mut archive,
            folder_name,
            ..
        } = hashed;

        let dst = self.join(&hash);
        if tokio::fs::try_exists(&dst).await? {
            debug!("output already in store");
            return Ok(false);
        }

        archive.rewind().await?;
        let rename = Replacements::new(folder_name.map(|f| (f, hash.clone())))?;
        let reader = ReplacingReader::new(rename, BufReader::new(archive));

        let scratch = self.scratch_dir()?;
        unpack_archive(reader, scratch.path()).await?;
        tokio::fs::set_permissions(scratch.path(), std::fs::Permissions::from_mode(0o755))
            .await?;

        match tokio::fs::rename(scratch.path(), &dst).await {
            Ok(()) => {
                info!(path = %dst.display(), "output moved into store");
                Ok(true)
            }
            Err(e) if tokio::fs::try_exists(&dst).await.unwrap_or(false) => {
                warn!(err = %e, "output appeared in store concurrently");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Recomputes the hash of the stored `output` and reports whether it
    /// still matches its name.
    #[instrument(skip(self), err)]
    pub async fn verify_output(&self, output: &Output) -> Result<bool, Error> {
        let dependency_paths: Vec<String> = output
            .dependencies
            .iter()
            .map(|d| self.entry_path(d))
            .collect();
        let hashed = self
            .hash_directory(
                &self.join(&output.path),
                None,
                Some(&output.path),
                &dependency_paths,
            )
            .await?;
        Ok(hashed.hash == output.path)
    }
}

/// Copies the contents of `src` into the existing directory `dst`, keeping
/// permissions and symlinks.
pub(crate) async fn copy_directory(src: &Path, dst: &Path) -> Result<(), Error> {
    let src = src.to_path_buf();
    let dst = dst.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<(), Error> {
        for entry in WalkDir::new(&src).min_depth(1).sort_by_file_name() {
            let entry = entry?;
            let rel = entry
                .path()
                .strip_prefix(&src)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
            let target = dst.join(rel);
            let file_type = entry.file_type();
            if file_type.is_dir() {
                std::fs::create_dir_all(&target)?;
                std::fs::set_permissions(&target, entry.metadata()?.permissions())?;
            } else if file_type.is_symlink() {
                std::os::unix::fs::symlink(std::fs::read_link(entry.path())?, &target)?;
            } else {
                std::fs::copy(entry.path(), &target)?;
            }
        }
        Ok(())
    })
    .await?
}
