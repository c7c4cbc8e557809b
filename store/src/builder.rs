//! Building a single derivation.
//!
//! [Builder::build_derivation] stages sources, runs the builder, then moves
//! every output into the store under the hash of its normalized contents.
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use bstr::BStr;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, field, info, instrument, warn, Span};
use url::Url;

use crate::cache::{self, Cache, NoopCache};
use crate::derivation::{outputs_in_order, Derivation, Output, DEFAULT_OUTPUT};
use crate::fetch::{fetch_into, Fetcher};
use crate::lockfile::Lockfile;
use crate::sandbox::{Sandbox, SandboxRequest};
use crate::store::{copy_directory, Store};
use crate::Error;

/// Builder name of the built-in URL fetcher.
pub const FETCH_URL_BUILDER: &str = "basic_fetch_url";

/// Older name of [FETCH_URL_BUILDER].
const FETCH_URL_BUILDER_ALIAS: &str = "fetch_url";

/// Set to `true` in the env of a derivation that fetches a URL itself, to
/// have its output pinned like a [FETCH_URL_BUILDER] output.
pub const CONFIRM_FETCH_URL: &str = "confirm_fetch_url";

/// Like [CONFIRM_FETCH_URL], for derivations that check out a git
/// `reference` of `url`.
pub const CONFIRM_FETCH_GIT: &str = "confirm_fetch_git";

pub fn is_fetch_builder(builder: &str) -> bool {
    builder == FETCH_URL_BUILDER || builder == FETCH_URL_BUILDER_ALIAS
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// Build even if the derivation was built before.
    pub force_build: bool,
    /// Pass builder output through instead of capturing it.
    pub verbose: bool,
}

/// Builds derivations into a [Store].
pub struct Builder {
    store: Arc<Store>,
    sandbox: Arc<dyn Sandbox>,
    fetcher: Arc<dyn Fetcher>,
    lockfile: Arc<dyn Lockfile>,
    cache: Arc<dyn Cache>,
}

impl Builder {
    pub fn new(
        store: Arc<Store>,
        sandbox: Arc<dyn Sandbox>,
        fetcher: Arc<dyn Fetcher>,
        lockfile: Arc<dyn Lockfile>,
    ) -> Self {
        Self {
            store,
            sandbox,
            fetcher,
            lockfile,
            cache: Arc::new(NoopCache::default()),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Builds `drv` unless a built copy exists, returning the derivation with
    /// its outputs and whether a build happened.
    #[instrument(skip_all, fields(drv.name = %drv.name, drv.hash = field::Empty), err)]
    pub async fn build_derivation(
        &self,
        drv: Derivation,
        opts: &BuildOptions,
        cancel: &CancellationToken,
    ) -> Result<(Derivation, bool), Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let drv = drv.formatted();
        validate(&drv)?;
        Span::current().record("drv.hash", drv.hash().as_str());

        if !opts.force_build {
            if let Some(built) = self.store.check_for_built_derivation(&drv).await? {
                debug!("already built");
                return Ok((built, false));
            }
            match cache::download(self.cache.as_ref(), &self.store, &drv).await {
                Ok(Some(built)) => {
                    info!("fetched from cache");
                    return Ok((built, false));
                }
                Ok(None) => {}
                Err(e) => warn!(err = %e, "unable to fetch from cache"),
            }
        }

        info!(filename = %drv.filename(), "building derivation");
        let built = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            res = self.build(&drv, opts) => res?,
        };

        self.check_fetch_hashes(&built)?;
        self.store.write_derivation(&built).await?;

        if let Err(e) = cache::upload(self.cache.as_ref(), &self.store, &built).await {
            warn!(err = %e, "unable to upload to cache");
        }

        Ok((built, true))
    }

    /// Builds `drv` again and fails with [Error::Reproducibility] if any
    /// output differs from the one built before.
    #[instrument(skip_all, fields(drv.name = %drv.name), err)]
    pub async fn check_derivation(
        &self,
        drv: Derivation,
        opts: &BuildOptions,
        cancel: &CancellationToken,
    ) -> Result<Derivation, Error> {
        let drv = drv.formatted();
        let Some(previous) = self.store.check_for_built_derivation(&drv).await? else {
            let (built, _) = self.build_derivation(drv, opts, cancel).await?;
            return Ok(built);
        };

        let rebuilt = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            res = self.build(&drv, opts) => res?,
        };

        let changed: Vec<(String, String, String)> = drv
            .output_names
            .iter()
            .zip(previous.outputs.iter().zip(rebuilt.outputs.iter()))
            .filter(|(_, (a, b))| a.path != b.path)
            .map(|(name, (a, b))| (name.clone(), a.path.clone(), b.path.clone()))
            .collect();

        if !changed.is_empty() {
            return Err(Error::Reproducibility {
                filename: drv.filename(),
                changed,
            });
        }
        info!("outputs reproduced");
        Ok(previous)
    }

    async fn build(&self, drv: &Derivation, opts: &BuildOptions) -> Result<Derivation, Error> {
        let build_dir = self.store.scratch_dir()?;
        if !drv.source.path.is_empty() {
            copy_directory(&self.store.join(&drv.source.path), build_dir.path()).await?;
        }
        let output_dirs = drv
            .output_names
            .iter()
            .map(|name| Ok((name.clone(), self.store.scratch_dir()?)))
            .collect::<Result<Vec<_>, Error>>()?;

        let resolved = self.store.resolve_derivation(drv).await?;
        if let Some(dep) = resolved.unresolved_placeholders().first() {
            return Err(Error::DependencyNotBuilt(dep.to_string()));
        }
        let dependency_paths = self.store.dependency_store_paths(drv).await?;

        if is_fetch_builder(&resolved.builder) {
            self.fetch_url(&resolved, &output_dirs).await?;
        } else {
            self.run_builder(&resolved, build_dir.path(), &output_dirs, opts)
                .await?;
        }

        let outputs = self
            .hash_and_move_outputs(build_dir.path(), &output_dirs, &dependency_paths)
            .await?;

        let mut built = drv.clone();
        built.outputs = outputs_in_order(&drv.name, &drv.output_names, outputs)?;
        Ok(built)
    }

    async fn fetch_url(
        &self,
        drv: &Derivation,
        output_dirs: &[(String, TempDir)],
    ) -> Result<(), Error> {
        let out = match output_dirs {
            [(name, dir)] if name == DEFAULT_OUTPUT => dir,
            _ => {
                return Err(Error::invalid_derivation(
                    &drv.name,
                    format!("the {FETCH_URL_BUILDER} builder only has the output {DEFAULT_OUTPUT:?}"),
                ))
            }
        };
        let url = drv.env.get("url").ok_or_else(|| {
            Error::invalid_derivation(
                &drv.name,
                format!("the {FETCH_URL_BUILDER} builder needs the env var \"url\""),
            )
        })?;
        let url = Url::parse(url)
            .map_err(|e| Error::invalid_derivation(&drv.name, format!("bad url {url:?}: {e}")))?;

        info!(%url, "fetching");
        let scratch = tempfile::tempfile_in(self.store.store_path())?;
        fetch_into(self.fetcher.as_ref(), &url, out.path(), scratch).await
    }

    async fn run_builder(
        &self,
        drv: &Derivation,
        build_dir: &Path,
        output_dirs: &[(String, TempDir)],
        opts: &BuildOptions,
    ) -> Result<(), Error> {
        if !tokio::fs::try_exists(&drv.builder).await.unwrap_or(false) {
            return Err(Error::BuildFailed {
                name: drv.name.clone(),
                reason: format!("builder {:?} doesn't exist", drv.builder),
                stdout: Default::default(),
                stderr: Default::default(),
            });
        }

        let mut env = drv.env_vars();
        let mut mounts = vec![
            format!("{}:ro", self.store.store_path()),
            build_dir.to_string_lossy().into_owned(),
        ];
        for (name, dir) in output_dirs {
            let path = dir.path().to_string_lossy().into_owned();
            env.push((name.clone(), path.clone()));
            mounts.push(path);
        }

        let request = SandboxRequest {
            args: std::iter::once(drv.builder.clone())
                .chain(drv.args.iter().cloned())
                .collect(),
            env,
            dir: build_dir.join(&drv.source.relative_build_path),
            mounts,
            network: drv.network,
            capture_output: !opts.verbose,
        };

        let output = self
            .sandbox
            .run(request)
            .await
            .map_err(|e| Error::BuildFailed {
                name: drv.name.clone(),
                reason: format!("unable to run builder: {e}"),
                stdout: Default::default(),
                stderr: Default::default(),
            })?;
        if !output.success() {
            warn!(
                stdout = %BStr::new(&output.stdout),
                stderr = %BStr::new(&output.stderr),
                exit_code = output.exit_code,
                "build failed"
            );
            return Err(Error::BuildFailed {
                name: drv.name.clone(),
                reason: format!("builder exited with code {}", output.exit_code),
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        Ok(())
    }

    /// Hashes every output directory and moves it into the store.
    #[instrument(skip_all, err)]
    async fn hash_and_move_outputs(
        &self,
        build_dir: &Path,
        output_dirs: &[(String, TempDir)],
        dependency_paths: &[String],
    ) -> Result<BTreeMap<String, Output>, Error> {
        let build_dir = build_dir
            .to_str()
            .ok_or_else(|| Error::NonUtf8Path(build_dir.to_path_buf()))?;

        let outputs = futures::future::try_join_all(output_dirs.iter().map(|(name, dir)| {
            async move {
                let folder_name = dir
                    .path()
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| Error::NonUtf8Path(dir.path().to_path_buf()))?;
                let hashed = self
                    .store
                    .hash_directory(
                        dir.path(),
                        Some(build_dir),
                        Some(folder_name),
                        dependency_paths,
                    )
                    .await?;
                let output = Output {
                    path: hashed.hash.clone(),
                    dependencies: hashed.references.clone(),
                };
                self.store.commit(hashed).await?;
                info!(output = %name, path = %self.store.entry_path(&output.path), "output ready");
                Ok::<_, Error>((name.clone(), output))
            }
        }))
        .await?;

        Ok(outputs.into_iter().collect())
    }

    /// Pins the output hash of fetching derivations in the lockfile, or
    /// checks it against the pinned or declared one.
    fn check_fetch_hashes(&self, drv: &Derivation) -> Result<(), Error> {
        let Some(key) = fetch_key(drv) else {
            return Ok(());
        };
        let Some(got) = drv.output(drv.default_output()) else {
            return Ok(());
        };

        let wanted = drv
            .env
            .get("hash")
            .cloned()
            .or_else(|| self.lockfile.lookup(&key));
        match wanted {
            Some(wanted) if wanted != got.path => Err(Error::HashMismatch {
                key,
                wanted,
                got: got.path.clone(),
            }),
            _ => self.lockfile.record(&key, &got.path),
        }
    }
}

/// Key under which the output of a fetching derivation is pinned.
fn fetch_key(drv: &Derivation) -> Option<String> {
    let flag = |name: &str| drv.env.get(name).is_some_and(|v| v == "true");
    let url = drv.env.get("url")?;
    if is_fetch_builder(&drv.builder) || flag(CONFIRM_FETCH_URL) {
        Some(url.clone())
    } else if flag(CONFIRM_FETCH_GIT) {
        let reference = drv.env.get("reference").map(String::as_str).unwrap_or("");
        Some(format!("{url}@{reference}"))
    } else {
        None
    }
}

fn validate(drv: &Derivation) -> Result<(), Error> {
    if drv.name.is_empty() {
        return Err(Error::invalid_derivation(&drv.name, "name is empty"));
    }
    if drv.builder.is_empty() {
        return Err(Error::invalid_derivation(&drv.name, "builder is empty"));
    }
    if drv.output_names.is_empty() {
        return Err(Error::invalid_derivation(&drv.name, "no outputs"));
    }
    for (i, name) in drv.output_names.iter().enumerate() {
        if name.is_empty() || drv.output_names[..i].contains(name) {
            return Err(Error::invalid_derivation(
                &drv.name,
                format!("bad output name {name:?}"),
            ));
        }
    }
    Ok(())
}
