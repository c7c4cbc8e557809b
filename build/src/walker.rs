//! Walk-and-patch: visits every vertex of a [DependencyGraph] after all of
//! its dependencies, and rewrites the placeholders dependents hold for it
//! once it has been visited.
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use bramble_store::derivation::DEFAULT_OUTPUT;
use bramble_store::{Dependency, Derivation};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::graph::{build_graph, DependencyGraph, Vertex};
use crate::locked_map::LockedDerivationMap;
use crate::Error;

/// What to do once a vertex fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum FailurePolicy {
    /// Start nothing new and cancel what's running.
    #[default]
    FailFast,
    /// Keep building everything that doesn't depend on the failure.
    KeepGoing,
}

#[derive(Clone, Debug, Default)]
pub struct WalkOptions {
    /// Number of vertices visited at once, 0 for no limit.
    pub max_parallel: usize,
    pub failure_policy: FailurePolicy,
    /// Rebuild derivations that were built before and check the outputs
    /// come out the same.
    pub check: bool,
}

/// Value a visited output takes in the derivations depending on it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildOutput {
    pub dependency: Dependency,
    pub output_path: String,
}

/// A derivation standing in for the one that was visited, along with the
/// derivations it needs.
#[derive(Clone, Debug)]
pub struct Expansion {
    pub derivations: Vec<Derivation>,
    /// Must be the `out` output of one of `derivations`.
    pub replacement: Dependency,
}

#[derive(Clone, Debug)]
pub enum Visited {
    Built(Vec<BuildOutput>),
    /// Replace the visited vertex with a new sub-graph, which is walked
    /// before any dependent of the vertex.
    Expanded(Expansion),
}

/// The state of the walk once every vertex has been visited.
#[derive(Debug)]
pub struct WalkOutcome {
    pub graph: DependencyGraph,
    /// Every derivation, with all placeholders of visited outputs patched.
    pub derivations: HashMap<String, Derivation>,
}

struct Shared<F> {
    graph: RwLock<DependencyGraph>,
    derivations: Arc<LockedDerivationMap>,
    /// Outputs per visited derivation hash.
    visited: Mutex<HashMap<String, Vec<BuildOutput>>>,
    limiter: Option<Arc<Semaphore>>,
    failure_policy: FailurePolicy,
    cancel: CancellationToken,
    visit: F,
}

pub struct Walker {
    graph: DependencyGraph,
    derivations: HashMap<String, Derivation>,
    options: WalkOptions,
}

impl Walker {
    /// Fails if `graph` has a cycle.
    pub fn new(
        graph: DependencyGraph,
        derivations: HashMap<String, Derivation>,
        options: WalkOptions,
    ) -> Result<Self, Error> {
        graph.validate(|hash| derivations.get(hash).map(|d| d.name.clone()))?;
        Ok(Self {
            graph,
            derivations,
            options,
        })
    }

    /// Calls `visit` once per derivation hash, with the derivation as
    /// patched by everything visited before it. The token handed to `visit`
    /// is cancelled with the walk.
    #[instrument(skip_all, fields(vertices = self.graph.len(), indicatif.pb_show = 1), err)]
    pub async fn walk<F, Fut>(
        self,
        cancel: &CancellationToken,
        visit: F,
    ) -> Result<WalkOutcome, Error>
    where
        F: Fn(Dependency, Derivation, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Visited, Error>> + Send + 'static,
    {
        let span = Span::current();
        span.pb_set_style(&bramble_tracing::PB_PROGRESS_STYLE);
        span.pb_set_message("building");
        span.pb_set_length(self.graph.len() as u64);

        let cancel = cancel.child_token();
        let shared = Arc::new(Shared {
            graph: RwLock::new(self.graph),
            derivations: Arc::new(LockedDerivationMap::new(self.derivations)),
            visited: Mutex::new(HashMap::new()),
            limiter: (self.options.max_parallel > 0)
                .then(|| Arc::new(Semaphore::new(self.options.max_parallel))),
            failure_policy: self.options.failure_policy,
            cancel: cancel.clone(),
            visit,
        });

        let mut done: HashSet<Vertex> = HashSet::new();
        let mut running: HashSet<Vertex> = HashSet::new();
        // never visited again, which keeps their dependents waiting
        let mut failed: HashSet<Vertex> = HashSet::new();
        let mut tasks: JoinSet<(Vertex, Result<Option<Expansion>, Error>)> = JoinSet::new();
        let mut errors: Vec<Error> = Vec::new();

        loop {
            if !cancel.is_cancelled() {
                for vertex in ready(&shared.graph.read(), &done, &running, &failed) {
                    let Some(dep) = vertex.dependency().cloned() else {
                        done.insert(vertex);
                        span.pb_inc(1);
                        continue;
                    };
                    running.insert(vertex);
                    let shared = shared.clone();
                    tasks.spawn(async move {
                        let res = visit_vertex(&shared, &dep).await;
                        (Vertex::Output(dep), res)
                    });
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let (vertex, res) = match joined {
                Ok(joined) => joined,
                Err(e) => {
                    errors.push(bramble_store::Error::from(e).into());
                    if self.options.failure_policy == FailurePolicy::FailFast {
                        cancel.cancel();
                    }
                    continue;
                }
            };
            running.remove(&vertex);

            let res = match res {
                Ok(Some(expansion)) => splice(&shared, &vertex, expansion).map(|()| {
                    span.pb_set_length(shared.graph.read().len() as u64);
                }),
                Ok(None) => {
                    done.insert(vertex.clone());
                    span.pb_inc(1);
                    Ok(())
                }
                Err(e) => Err(e),
            };
            if let Err(e) = res {
                failed.insert(vertex);
                if e.is_cancelled() && cancel.is_cancelled() {
                    continue;
                }
                warn!(err = %e, "visit failed");
                errors.push(e);
                if self.options.failure_policy == FailurePolicy::FailFast {
                    cancel.cancel();
                }
            }
        }

        if errors.is_empty() && cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match errors.len() {
            0 => {
                info!(visited = done.len(), "walk complete");
                Ok(WalkOutcome {
                    graph: shared.graph.read().clone(),
                    derivations: shared.derivations.snapshot(),
                })
            }
            1 => Err(errors.remove(0)),
            _ => Err(Error::Aggregate(errors)),
        }
    }
}

/// Vertices whose dependencies are all done, that haven't been started.
fn ready(
    graph: &DependencyGraph,
    done: &HashSet<Vertex>,
    running: &HashSet<Vertex>,
    failed: &HashSet<Vertex>,
) -> Vec<Vertex> {
    let mut ready: Vec<Vertex> = graph
        .vertices()
        .filter(|v| !done.contains(*v) && !running.contains(*v) && !failed.contains(*v))
        .filter(|v| graph.dependencies(v).iter().all(|d| done.contains(d)))
        .cloned()
        .collect();
    ready.sort();
    ready
}

async fn visit_vertex<F, Fut>(shared: &Shared<F>, dep: &Dependency) -> Result<Option<Expansion>, Error>
where
    F: Fn(Dependency, Derivation, CancellationToken) -> Fut,
    Fut: Future<Output = Result<Visited, Error>>,
{
    let cancel = &shared.cancel;
    let _permit = match &shared.limiter {
        Some(limiter) => tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            permit = limiter.clone().acquire_owned() => {
                Some(permit.map_err(|_| Error::Cancelled)?)
            }
        },
        None => None,
    };

    let res = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = visit_and_patch(shared, dep) => res,
    };
    // cancel while the permit is still held, so no queued vertex starts
    if let Err(e) = &res {
        if !e.is_cancelled() && shared.failure_policy == FailurePolicy::FailFast {
            cancel.cancel();
        }
    }
    res
}

async fn visit_and_patch<F, Fut>(shared: &Shared<F>, dep: &Dependency) -> Result<Option<Expansion>, Error>
where
    F: Fn(Dependency, Derivation, CancellationToken) -> Fut,
    Fut: Future<Output = Result<Visited, Error>>,
{
    let guard = shared.derivations.lock(&dep.hash).await?;
    let cached = shared.visited.lock().get(&dep.hash).cloned();
    let visited = match cached {
        Some(outputs) => {
            debug!(%dep, "derivation already visited");
            Visited::Built(outputs)
        }
        None => {
            (shared.visit)(dep.clone(), (*guard).clone(), shared.cancel.clone()).await?
        }
    };

    // graph before visited, the same order as splice: an expansion either
    // sees these outputs or is among the dependents read here
    let mut dependents: Vec<String> = {
        let graph = shared.graph.read();
        if let Visited::Built(outputs) = &visited {
            shared
                .visited
                .lock()
                .entry(dep.hash.clone())
                .or_insert_with(|| outputs.clone());
        }
        graph
            .dependents(&Vertex::Output(dep.clone()))
            .into_iter()
            .filter_map(|v| v.dependency().map(|d| d.hash.clone()))
            .collect()
    };
    dependents.dedup();
    drop(guard);

    match visited {
        Visited::Built(outputs) => {
            let values: HashMap<Dependency, String> = outputs
                .into_iter()
                .map(|o| (o.dependency, o.output_path))
                .collect();
            for hash in dependents {
                let mut dependent = shared.derivations.lock(&hash).await?;
                let patched = dependent.patch_dependency_references(&values)?;
                dependent.update(patched);
            }
            Ok(None)
        }
        Visited::Expanded(expansion) => {
            if dep.output != DEFAULT_OUTPUT || expansion.replacement.output != DEFAULT_OUTPUT {
                return Err(Error::InvalidExpansion {
                    vertex: dep.to_string(),
                    reason: format!("only {DEFAULT_OUTPUT:?} outputs can be replaced"),
                });
            }
            for hash in dependents {
                let mut dependent = shared.derivations.lock(&hash).await?;
                let patched = dependent.patch_derivation_references(dep, &expansion.replacement)?;
                dependent.update(patched);
            }
            Ok(Some(expansion))
        }
    }
}

/// Swaps `vertex` for the graph of `expansion` in the live graph.
fn splice<F>(shared: &Shared<F>, vertex: &Vertex, expansion: Expansion) -> Result<(), Error> {
    let mut graph = shared.graph.write();

    // new derivations may use outputs that are already done, nothing else
    // patches those in
    let values: HashMap<Dependency, String> = shared
        .visited
        .lock()
        .values()
        .flatten()
        .map(|o| (o.dependency.clone(), o.output_path.clone()))
        .collect();
    for drv in expansion.derivations {
        let hash = drv.hash();
        if shared.derivations.get(&hash).is_some() {
            continue;
        }
        let patched = drv.patch_dependency_references(&values)?;
        shared.derivations.insert(hash, patched.formatted());
    }
    let known = shared.derivations.snapshot();
    let sub = build_graph(std::slice::from_ref(&expansion.replacement), &known)?;

    let mut live = graph.clone();
    live.replace_vertex(vertex, Vertex::Output(expansion.replacement.clone()));
    let merged = DependencyGraph::merge([live, sub]);
    merged.validate(|hash| known.get(hash).map(|d| d.name.clone()))?;

    info!(%vertex, replacement = %expansion.replacement, "expanded graph");
    *graph = merged;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use crate::fixtures::{drv, multi_output_drv};
    use crate::graph::derivation_map;

    fn fake_path(dep: &Dependency) -> String {
        format!("/fake/{}-{}", dep.hash, dep.output)
    }

    /// Outputs for every output of `drv`.
    fn fake_outputs(dep: &Dependency, drv: &Derivation) -> Vec<BuildOutput> {
        drv.output_names
            .iter()
            .map(|name| {
                let dependency = Dependency::new(dep.hash.clone(), name.clone());
                BuildOutput {
                    output_path: fake_path(&dependency),
                    dependency,
                }
            })
            .collect()
    }

    fn walker(requested: &[&Derivation], all: &[&Derivation], options: WalkOptions) -> Walker {
        let derivations = derivation_map(all.iter().map(|d| (*d).clone()));
        let requested: Vec<Dependency> = requested
            .iter()
            .flat_map(|d| d.outputs_as_dependencies())
            .collect();
        let graph = build_graph(&requested, &derivations).unwrap();
        Walker::new(graph, derivations, options).unwrap()
    }

    /// a <- b(out, lib) <- c, d <- e
    fn diamond() -> Vec<Derivation> {
        let a = drv("a", &[]);
        let b = multi_output_drv("b", &["out", "lib"], &[&a]);
        let c = drv("c", &[&b]);
        let d = drv("d", &[&b]);
        let e = drv("e", &[&c, &d]);
        vec![a, b, c, d, e]
    }

    #[rstest]
    #[case::sequential(1)]
    #[case::limited(2)]
    #[case::unbounded(0)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn dependencies_first(#[case] max_parallel: usize) {
        let drvs = diamond();
        let all: Vec<&Derivation> = drvs.iter().collect();
        let w = walker(
            &[&drvs[4], &drvs[1]],
            &all,
            WalkOptions {
                max_parallel,
                ..Default::default()
            },
        );

        let finished: Arc<Mutex<Vec<String>>> = Default::default();
        let calls: Arc<Mutex<HashMap<String, usize>>> = Default::default();
        let (active, peak) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
        let outcome = w
            .walk(&CancellationToken::new(), {
                let (finished, calls) = (finished.clone(), calls.clone());
                let (active, peak) = (active.clone(), peak.clone());
                move |dep, drv, _cancel| {
                    let (finished, calls) = (finished.clone(), calls.clone());
                    let (active, peak) = (active.clone(), peak.clone());
                    async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        // everything this derivation needs is patched in
                        assert!(drv.unresolved_placeholders().is_empty());
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        *calls.lock().entry(drv.name.clone()).or_default() += 1;
                        finished.lock().push(drv.name.clone());
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, Error>(Visited::Built(fake_outputs(&dep, &drv)))
                    }
                }
            })
            .await
            .unwrap();

        let finished = finished.lock().clone();
        let position = |name: &str| finished.iter().position(|n| n == name).unwrap();
        assert!(position("a") < position("b"));
        assert!(position("b") < position("c"));
        assert!(position("b") < position("d"));
        assert!(position("c") < position("e"));
        assert!(position("d") < position("e"));

        // b has two vertices but one visit
        assert!(calls.lock().values().all(|c| *c == 1));
        assert_eq!(5, calls.lock().len());

        if max_parallel > 0 {
            assert!(peak.load(Ordering::SeqCst) <= max_parallel);
        }

        let e = &outcome.derivations[&drvs[4].hash()];
        let c_out = Dependency::new(drvs[2].hash(), "out");
        assert!(e.args.contains(&fake_path(&c_out)));
    }

    #[tokio::test]
    async fn failures_are_aggregated() {
        let a = drv("a", &[]);
        let b = drv("b", &[]);
        let c = drv("c", &[&a]);
        let w = walker(
            &[&b, &c],
            &[&a, &b, &c],
            WalkOptions {
                failure_policy: FailurePolicy::KeepGoing,
                ..Default::default()
            },
        );
        let visited: Arc<Mutex<Vec<String>>> = Default::default();
        let cancel_token = CancellationToken::new();
        let walk = w.walk(&cancel_token, {
            let visited = visited.clone();
            move |_dep, drv, _cancel| {
                let visited = visited.clone();
                async move {
                    visited.lock().push(drv.name.clone());
                    Err::<Visited, Error>(bramble_store::Error::DependencyNotBuilt(drv.name).into())
                }
            }
        });
        // failed vertices are not retried, so the walk ends
        let err = tokio::time::timeout(Duration::from_secs(5), walk)
            .await
            .expect("walk should finish")
            .unwrap_err();

        let Error::Aggregate(errors) = err else {
            panic!("unexpected error {err:?}");
        };
        assert_eq!(2, errors.len());
        // c depends on a failure and is never visited
        let mut visited = visited.lock().clone();
        visited.sort();
        assert_eq!(vec!["a", "b"], visited);
    }

    #[tokio::test]
    async fn fail_fast_returns_the_failure() {
        let a = drv("a", &[]);
        let b = drv("b", &[&a]);
        let w = walker(&[&b], &[&a, &b], WalkOptions::default());
        let err = w
            .walk(&CancellationToken::new(), |_dep, drv, _cancel| async move {
                Err::<Visited, Error>(bramble_store::Error::DependencyNotBuilt(drv.name).into())
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Store(bramble_store::Error::DependencyNotBuilt(name)) if name == "a"
        ));
    }

    #[tokio::test]
    async fn fail_fast_stops_running_visits() {
        let bad = drv("bad", &[]);
        let slow = drv("slow", &[]);
        let w = walker(&[&bad, &slow], &[&bad, &slow], WalkOptions::default());

        let cancel_token = CancellationToken::new();
        let walk = w.walk(&cancel_token, |dep, drv, cancel| async move {
            if drv.name == "bad" {
                return Err::<Visited, Error>(
                    bramble_store::Error::DependencyNotBuilt(drv.name).into(),
                );
            }
            tokio::select! {
                _ = cancel.cancelled() => Err(Error::Cancelled),
                _ = tokio::time::sleep(Duration::from_secs(30)) => {
                    Ok(Visited::Built(fake_outputs(&dep, &drv)))
                }
            }
        });
        let err = tokio::time::timeout(Duration::from_secs(5), walk)
            .await
            .expect("walk should stop once bad fails")
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Store(bramble_store::Error::DependencyNotBuilt(name)) if name == "bad"
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fail_fast_starts_nothing_after_a_failure() {
        let a = drv("a", &[]);
        let b = drv("b", &[]);
        let c = drv("c", &[]);
        let w = walker(
            &[&a, &b, &c],
            &[&a, &b, &c],
            WalkOptions {
                max_parallel: 1,
                ..Default::default()
            },
        );

        let calls = Arc::new(AtomicUsize::new(0));
        let err = w
            .walk(&CancellationToken::new(), {
                let calls = calls.clone();
                move |_dep, drv, _cancel| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        Err::<Visited, Error>(bramble_store::Error::DependencyNotBuilt(drv.name).into())
                    }
                }
            })
            .await
            .unwrap_err();

        // the first failure cancels the walk before its slot is handed on
        assert_eq!(1, calls.load(Ordering::SeqCst));
        assert!(matches!(
            err,
            Error::Store(bramble_store::Error::DependencyNotBuilt(_))
        ));
    }

    #[tokio::test]
    async fn placeholders_are_patched_everywhere() {
        let a = drv("a", &[]);
        let mut b = Derivation::new("b", format!("{}/bin/sh", a.placeholder("out")));
        b.env.insert("A".into(), a.placeholder("out"));
        b.dependencies = vec![Dependency::new(a.hash(), "out")];
        let b = b.formatted();
        let mut c = Derivation::new("c", "/bin/sh");
        c.env.insert("B".into(), format!("{}/lib", b.placeholder("out")));
        c.args = vec![a.placeholder("out")];
        c.dependencies = vec![
            Dependency::new(a.hash(), "out"),
            Dependency::new(b.hash(), "out"),
        ];
        let c = c.formatted();

        let w = walker(&[&c], &[&a, &b, &c], WalkOptions::default());
        let outcome = w
            .walk(&CancellationToken::new(), |dep, drv, _cancel| async move {
                assert!(drv.unresolved_placeholders().is_empty(), "{drv:?}");
                Ok::<_, Error>(Visited::Built(fake_outputs(&dep, &drv)))
            })
            .await
            .unwrap();

        assert_eq!(3, outcome.derivations.len());
        assert!(outcome
            .derivations
            .values()
            .all(|d| d.unresolved_placeholders().is_empty()));
        let b = &outcome.derivations[&b.hash()];
        let a_out = fake_path(&Dependency::new(a.hash(), "out"));
        assert_eq!(format!("{a_out}/bin/sh"), b.builder);
        assert_eq!(Some(&a_out), b.env.get("A"));
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let a = drv("a", &[]);
        let w = walker(&[&a], &[&a], WalkOptions::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = Arc::new(AtomicUsize::new(0));
        let res = w
            .walk(&cancel, {
                let calls = calls.clone();
                move |dep, drv, _cancel| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Ok::<_, Error>(Visited::Built(fake_outputs(&dep, &drv))) }
                }
            })
            .await;
        assert!(matches!(res, Err(Error::Cancelled)));
        assert_eq!(0, calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn expansion_replaces_vertex() {
        let a = drv("a", &[]);
        let c = drv("c", &[]);
        let top = drv("top", &[&a, &c]);

        // c turns out to be built by d, which needs x
        let x = drv("x", &[]);
        let d = drv("d", &[&x]);

        let w = walker(&[&top], &[&a, &c, &top], WalkOptions::default());
        let visited: Arc<Mutex<Vec<String>>> = Default::default();
        let outcome = w
            .walk(&CancellationToken::new(), {
                let visited = visited.clone();
                let (c_hash, x, d) = (c.hash(), x.clone(), d.clone());
                move |dep, drv, _cancel| {
                    let visited = visited.clone();
                    let (c_hash, x, d) = (c_hash.clone(), x.clone(), d.clone());
                    async move {
                        visited.lock().push(drv.name.clone());
                        if dep.hash == c_hash {
                            return Ok::<_, Error>(Visited::Expanded(Expansion {
                                replacement: Dependency::new(d.hash(), "out"),
                                derivations: vec![x, d],
                            }));
                        }
                        Ok(Visited::Built(fake_outputs(&dep, &drv)))
                    }
                }
            })
            .await
            .unwrap();

        let visited = visited.lock().clone();
        let position = |name: &str| visited.iter().position(|n| n == name).unwrap();
        assert!(position("c") < position("x"));
        assert!(position("x") < position("d"));
        assert!(position("d") < position("top"));

        let c_vertex = Vertex::Output(Dependency::new(c.hash(), "out"));
        let d_vertex = Vertex::Output(Dependency::new(d.hash(), "out"));
        assert!(!outcome.graph.contains(&c_vertex));
        let top = &outcome.derivations[&top.hash()];
        assert!(top.args.contains(&fake_path(&Dependency::new(d.hash(), "out"))));
        assert!(top.dependencies.contains(d_vertex.dependency().unwrap()));
    }

    #[tokio::test]
    async fn expansion_into_a_cycle_fails() {
        let c = drv("c", &[]);
        let top = drv("top", &[&c]);
        let w = walker(&[&top], &[&c, &top], WalkOptions::default());

        let top_hash = top.hash();
        let err = w
            .walk(&CancellationToken::new(), move |dep, drv, _cancel| {
                let top_hash = top_hash.clone();
                async move {
                    if drv.name == "c" {
                        // depends on its own dependent
                        let mut d = Derivation::new("d", "/bin/sh");
                        d.dependencies = vec![Dependency::new(top_hash, "out")];
                        return Ok::<_, Error>(Visited::Expanded(Expansion {
                            replacement: Dependency::new(d.hash(), "out"),
                            derivations: vec![d],
                        }));
                    }
                    Ok(Visited::Built(fake_outputs(&dep, &drv)))
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::GraphCycle(_)), "{err:?}");
    }
}
