//! Builds a set of derivations in dependency order: walks their graph and
//! hands every patched derivation to a [Builder].
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use bramble_store::{BuildOptions, Builder, Dependency, Derivation};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::graph::{build_graph, derivation_map, DependencyGraph};
use crate::walker::{BuildOutput, Visited, WalkOptions, Walker};
use crate::Error;

/// Derivations handed over by a front end, and the outputs to build.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BuildRequest {
    pub derivations: Vec<Derivation>,
    /// Outputs to build. Empty means every output of every derivation that
    /// no other derivation depends on.
    #[serde(default)]
    pub requested: Vec<Dependency>,
}

impl BuildRequest {
    pub async fn load(path: &Path) -> Result<Self, Error> {
        let data = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// The outputs to build, see [BuildRequest::requested].
    pub fn requested_outputs(&self) -> Vec<Dependency> {
        if !self.requested.is_empty() {
            return self.requested.clone();
        }
        let needed: HashSet<&str> = self
            .derivations
            .iter()
            .flat_map(|d| d.dependencies.iter().map(|dep| dep.hash.as_str()))
            .collect();
        let mut requested: Vec<Dependency> = self
            .derivations
            .iter()
            .map(|d| (d.hash(), d))
            .filter(|(hash, _)| !needed.contains(hash.as_str()))
            .flat_map(|(_, d)| d.outputs_as_dependencies())
            .collect();
        requested.sort();
        requested.dedup();
        requested
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuiltDerivation {
    /// The derivation as stored, with outputs.
    pub derivation: Derivation,
    /// False if it was already in the store or fetched from a cache.
    pub did_build: bool,
}

#[derive(Debug, Default)]
pub struct BuildResult {
    /// Built derivations keyed by the hash they were requested under.
    pub built: HashMap<String, BuiltDerivation>,
    pub requested: Vec<Dependency>,
    pub graph: DependencyGraph,
}

impl BuildResult {
    /// Store entry of one requested output.
    pub fn output_path(&self, dep: &Dependency) -> Option<&str> {
        let built = &self.built.get(&dep.hash)?.derivation;
        built.output(&dep.output).map(|o| o.path.as_str())
    }
}

/// Points dependencies at the hashes their derivations were stored under,
/// which differ from the requested ones once placeholders are patched.
fn with_built_dependencies(
    mut drv: Derivation,
    built: &HashMap<String, BuiltDerivation>,
) -> Result<Derivation, Error> {
    for dep in drv.dependencies.iter_mut() {
        let Some(b) = built.get(&dep.hash) else {
            return Err(bramble_store::Error::DependencyNotBuilt(format!(
                "{} (needed by {})",
                dep, drv.name
            ))
            .into());
        };
        dep.hash = b.derivation.hash();
    }
    Ok(drv.formatted())
}

/// Builds everything `request` asks for, dependencies first.
#[instrument(skip_all, fields(derivations = request.derivations.len()), err)]
pub async fn build(
    builder: Arc<Builder>,
    request: BuildRequest,
    walk: &WalkOptions,
    opts: &BuildOptions,
    cancel: &CancellationToken,
) -> Result<BuildResult, Error> {
    let requested = request.requested_outputs();
    let derivations = derivation_map(request.derivations);
    let graph = build_graph(&requested, &derivations)?;
    info!(vertices = graph.len(), "built dependency graph");

    let built: Arc<Mutex<HashMap<String, BuiltDerivation>>> = Default::default();
    let walker = Walker::new(graph, derivations, walk.clone())?;
    let outcome = walker
        .walk(cancel, {
            let built = built.clone();
            let (opts, check) = (opts.clone(), walk.check);
            move |dep, drv, cancel: CancellationToken| {
                let (builder, built) = (builder.clone(), built.clone());
                let opts = opts.clone();
                async move {
                    let drv = with_built_dependencies(drv, &built.lock())?;
                    let (derivation, did_build) = if check {
                        (builder.check_derivation(drv, &opts, &cancel).await?, true)
                    } else {
                        builder.build_derivation(drv, &opts, &cancel).await?
                    };

                    let prefix = builder.store().prefix_of_record().to_string();
                    let outputs: Vec<BuildOutput> = derivation
                        .output_names
                        .iter()
                        .zip(&derivation.outputs)
                        .map(|(name, output)| BuildOutput {
                            dependency: Dependency::new(dep.hash.clone(), name.clone()),
                            output_path: format!("{prefix}/{}", output.path),
                        })
                        .collect();
                    built.lock().insert(
                        dep.hash,
                        BuiltDerivation {
                            derivation,
                            did_build,
                        },
                    );
                    Ok(Visited::Built(outputs))
                }
            }
        })
        .await?;

    let built = std::mem::take(&mut *built.lock());
    info!(
        built = built.values().filter(|b| b.did_build).count(),
        cached = built.values().filter(|b| !b.did_build).count(),
        "build complete"
    );
    Ok(BuildResult {
        built,
        requested,
        graph: outcome.graph,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::drv;
    use pretty_assertions::assert_eq;

    #[test]
    fn requested_defaults_to_top_level_outputs() {
        let a = drv("a", &[]);
        let mut b = drv("b", &[&a]);
        b.output_names = vec!["out".into(), "doc".into()];
        let c = drv("c", &[]);
        let request = BuildRequest {
            derivations: vec![a, b.clone(), c.clone()],
            requested: vec![],
        };

        let mut expected = vec![
            Dependency::new(b.hash(), "out"),
            Dependency::new(b.hash(), "doc"),
            Dependency::new(c.hash(), "out"),
        ];
        expected.sort();
        assert_eq!(expected, request.requested_outputs());
    }

    #[test]
    fn explicit_requests_are_kept() {
        let a = drv("a", &[]);
        let b = drv("b", &[&a]);
        let request = BuildRequest {
            requested: vec![Dependency::new(a.hash(), "out")],
            derivations: vec![a.clone(), b],
        };
        assert_eq!(vec![Dependency::new(a.hash(), "out")], request.requested_outputs());
    }

    #[test]
    fn request_json() {
        let a = drv("a", &[]);
        let json = serde_json::json!({
            "Derivations": [serde_json::from_slice::<serde_json::Value>(&a.json()).unwrap()],
        });
        let request: BuildRequest = serde_json::from_value(json).unwrap();
        assert_eq!(vec![a], request.derivations);
        assert!(request.requested.is_empty());
    }

    #[test]
    fn dependencies_are_mapped_to_built_hashes() {
        let a = drv("a", &[]);
        let b = drv("b", &[&a]);

        let mut stored = a.clone();
        stored.env.insert("patched".into(), "yes".into());
        let built = HashMap::from([(
            a.hash(),
            BuiltDerivation {
                derivation: stored.clone(),
                did_build: true,
            },
        )]);

        let mapped = with_built_dependencies(b.clone(), &built).unwrap();
        assert_eq!(vec![Dependency::new(stored.hash(), "out")], mapped.dependencies);

        assert!(matches!(
            with_built_dependencies(b, &HashMap::new()),
            Err(Error::Store(bramble_store::Error::DependencyNotBuilt(_)))
        ));
    }
}
