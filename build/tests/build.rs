use std::collections::HashSet;
use std::os::unix::fs::symlink;
use std::path::Path;
use std::sync::Arc;

use async_compression::tokio::write::GzipEncoder;
use bramble_build::{build, BuildRequest, BuildResult, Error, FailurePolicy, WalkOptions};
use bramble_store::builder::FETCH_URL_BUILDER;
use bramble_store::fetch::HttpFetcher;
use bramble_store::lockfile::{Lockfile, MemoryLockfile};
use bramble_store::sandbox::ProcessSandbox;
use bramble_store::{BuildOptions, Builder, Dependency, Derivation, Store, StoreConfig};
use pretty_assertions::assert_eq;
use rstest::rstest;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

struct Harness {
    dir: TempDir,
    store: Arc<Store>,
    lockfile: Arc<MemoryLockfile>,
    builder: Arc<Builder>,
}

impl Harness {
    /// A store in a fresh directory, next to a `pkg.tar.gz` holding `bin/sh`.
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let pkg = dir.path().join("pkg");
        std::fs::create_dir_all(pkg.join("bin")).unwrap();
        symlink("/bin/sh", pkg.join("bin/sh")).unwrap();
        write_tarball(&pkg, &dir.path().join("pkg.tar.gz")).await;

        let store = Arc::new(Store::new(&StoreConfig::with_bramble_path(dir.path().join("b"))).unwrap());
        let lockfile = Arc::new(MemoryLockfile::default());
        let builder = Arc::new(Builder::new(
            store.clone(),
            Arc::new(ProcessSandbox::default()),
            Arc::new(HttpFetcher::default()),
            lockfile.clone(),
        ));
        Self {
            dir,
            store,
            lockfile,
            builder,
        }
    }

    fn pkg_url(&self) -> String {
        format!("file://{}", self.dir.path().join("pkg.tar.gz").display())
    }

    async fn build_with(
        &self,
        request: BuildRequest,
        walk: WalkOptions,
        opts: BuildOptions,
    ) -> Result<BuildResult, Error> {
        build(
            self.builder.clone(),
            request,
            &walk,
            &opts,
            &CancellationToken::new(),
        )
        .await
    }

    async fn build(&self, request: BuildRequest) -> Result<BuildResult, Error> {
        self.build_with(request, WalkOptions::default(), BuildOptions::default())
            .await
    }

    fn read(&self, result: &BuildResult, dep: &Dependency, file: &str) -> String {
        let path = result.output_path(dep).unwrap();
        std::fs::read_to_string(self.store.join(path).join(file)).unwrap()
    }
}

async fn write_tarball(src: &Path, dst: &Path) {
    let file = tokio::fs::File::create(dst).await.unwrap();
    let mut encoder = bramble_store::archive::write_archive(src, GzipEncoder::new(file))
        .await
        .unwrap();
    encoder.shutdown().await.unwrap();
}

fn fetch(url: &str) -> Derivation {
    let mut drv = Derivation::new("pkg", FETCH_URL_BUILDER);
    drv.env.insert("url".into(), url.into());
    drv
}

/// Runs `script` with the host shell. `deps` are made available to it, and
/// `{name}` in the script expands to the `out` placeholder of that
/// dependency.
fn shell(name: &str, script: &str, deps: &[&Derivation]) -> Derivation {
    let mut script = script.to_string();
    let mut drv = Derivation::new(name, "/bin/sh");
    for dep in deps {
        let dependency = Dependency::new(dep.hash(), "out");
        script = script.replace(&format!("{{{}}}", dep.name), &dependency.placeholder());
        drv.dependencies.push(dependency);
    }
    drv.args = vec!["-c".into(), script];
    drv.formatted()
}

fn request(derivations: &[&Derivation], requested: &[&Derivation]) -> BuildRequest {
    BuildRequest {
        derivations: derivations.iter().map(|d| (*d).clone()).collect(),
        requested: requested
            .iter()
            .map(|d| Dependency::new(d.hash(), "out"))
            .collect(),
    }
}

/// pkg <- hello <- greeting, with hello running the fetched shell.
fn hello_world(pkg_url: &str) -> (Derivation, Derivation, Derivation) {
    let pkg = fetch(pkg_url);
    let pkg_out = Dependency::new(pkg.hash(), "out");
    let mut hello = Derivation::new("hello", format!("{}/bin/sh", pkg_out.placeholder()));
    hello.args = vec!["-c".into(), "echo hello > $out/greeting".into()];
    hello.dependencies = vec![pkg_out];
    let greeting = shell(
        "greeting",
        "cat {hello}/greeting > $out/greeting; echo world >> $out/greeting",
        &[&hello],
    );
    (pkg, hello, greeting)
}

#[tokio::test]
async fn fetch_then_build_chain() {
    let h = Harness::new().await;
    let (pkg, hello, greeting) = hello_world(&h.pkg_url());
    let result = h.build(request(&[&pkg, &hello, &greeting], &[])).await.unwrap();

    let requested = Dependency::new(greeting.hash(), "out");
    assert_eq!(vec![requested.clone()], result.requested);
    assert_eq!("hello\nworld\n", h.read(&result, &requested, "greeting"));

    assert_eq!(3, result.built.len());
    assert!(result.built.values().all(|b| b.did_build));

    // fetched hash was pinned
    let pkg_built = &result.built[&pkg.hash()].derivation;
    assert_eq!(
        Some(pkg_built.outputs[0].path.clone()),
        h.lockfile.lookup(&h.pkg_url())
    );

    // dependents were patched and point at the stored dependencies
    let stored = &result.built[&greeting.hash()].derivation;
    assert!(stored.unresolved_placeholders().is_empty());
    let hello_built = &result.built[&hello.hash()].derivation;
    assert_eq!(
        vec![Dependency::new(hello_built.hash(), "out")],
        stored.dependencies
    );
    assert_eq!(
        Some(stored),
        h.store
            .load_derivation(&stored.filename())
            .await
            .unwrap()
            .as_ref()
    );
}

#[tokio::test]
async fn stores_produce_the_same_outputs() {
    let a = Harness::new().await;
    let b = Harness::new().await;
    assert_ne!(a.store.store_path(), b.store.store_path());

    let paths = |h: &Harness, result: &BuildResult| -> Vec<String> {
        let mut paths: Vec<String> = result
            .built
            .values()
            .flat_map(|b| b.derivation.outputs.iter().map(|o| o.path.clone()))
            .collect();
        paths.sort();
        assert!(paths.iter().all(|p| h.store.join(p).exists()));
        paths
    };

    // the pkg url differs between harnesses, so only shell builds compare
    let x = shell("x", "echo $out > $out/self; pwd > $out/pwd", &[]);
    let y = shell("y", "cat {x}/self {x}/pwd > $out/x", &[&x]);
    let ra = a.build(request(&[&x, &y], &[&y])).await.unwrap();
    let rb = b.build(request(&[&x, &y], &[&y])).await.unwrap();
    assert_eq!(paths(&a, &ra), paths(&b, &rb));
}

#[tokio::test]
async fn second_build_reuses_outputs() {
    let h = Harness::new().await;
    let (pkg, hello, greeting) = hello_world(&h.pkg_url());
    let req = request(&[&pkg, &hello, &greeting], &[&greeting]);

    let first = h.build(req.clone()).await.unwrap();
    let second = h.build(req).await.unwrap();

    assert!(second.built.values().all(|b| !b.did_build));
    for (hash, built) in &first.built {
        assert_eq!(built.derivation, second.built[hash].derivation);
    }
}

#[tokio::test]
async fn multiple_outputs_are_built_once() {
    let h = Harness::new().await;
    let mut split = Derivation::new("split", "/bin/sh");
    split.output_names = vec!["out".into(), "lib".into()];
    split.args = vec![
        "-c".into(),
        "echo $$ > $out/pid; cp $out/pid $lib/pid".into(),
    ];
    let lib = Dependency::new(split.hash(), "lib");
    let mut user = shell("user", "cat {split}/pid > $out/out-pid", &[&split]);
    user.args[1] = format!("{}; cat {}/pid > $out/lib-pid", user.args[1], lib.placeholder());
    user.dependencies.push(lib.clone());
    let user = user.formatted();

    let req = BuildRequest {
        derivations: vec![split.clone(), user.clone()],
        requested: vec![
            Dependency::new(user.hash(), "out"),
            lib.clone(),
        ],
    };
    let result = h.build(req).await.unwrap();

    let user_out = Dependency::new(user.hash(), "out");
    assert_eq!(
        h.read(&result, &user_out, "out-pid"),
        h.read(&result, &user_out, "lib-pid")
    );
    assert_eq!(h.read(&result, &lib, "pid"), h.read(&result, &user_out, "lib-pid"));
}

#[tokio::test]
async fn same_content_under_different_names() {
    let h = Harness::new().await;
    let a = shell("a", "echo same > $out/f", &[]);
    let b = shell("b", "echo same > $out/f", &[]);
    let result = h.build(request(&[&a, &b], &[&a, &b])).await.unwrap();

    let outputs: HashSet<&str> = result
        .built
        .values()
        .map(|b| b.derivation.outputs[0].path.as_str())
        .collect();
    assert_eq!(1, outputs.len());
}

#[rstest]
#[case::keep_going(FailurePolicy::KeepGoing)]
#[case::fail_fast(FailurePolicy::FailFast)]
#[tokio::test]
async fn failures(#[case] failure_policy: FailurePolicy) {
    let h = Harness::new().await;
    let bad = shell("bad", "echo broken >&2; exit 1", &[]);
    let worse = shell("worse", "exit 2", &[]);
    let after = shell("after", "cat {bad}/f > $out/f", &[&bad]);

    let err = h
        .build_with(
            request(&[&bad, &worse, &after], &[&worse, &after]),
            WalkOptions {
                max_parallel: 1,
                failure_policy,
                ..Default::default()
            },
            BuildOptions::default(),
        )
        .await
        .unwrap_err();

    match failure_policy {
        FailurePolicy::KeepGoing => {
            let Error::Aggregate(errors) = err else {
                panic!("unexpected error {err:?}");
            };
            assert_eq!(2, errors.len());
        }
        FailurePolicy::FailFast => {
            // whichever failure comes first stops the rest
            assert!(
                matches!(
                    &err,
                    Error::Store(bramble_store::Error::BuildFailed { name, .. })
                        if name == "bad" || name == "worse"
                ),
                "{err:?}"
            );
        }
    }
    assert!(h
        .store
        .check_for_built_derivation(&after)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn check_mode() {
    let h = Harness::new().await;
    let stable = shell("stable", "echo stable > $out/f", &[]);
    let unstable = shell("unstable", "echo $$ > $out/f", &[]);
    let check = WalkOptions {
        check: true,
        ..Default::default()
    };

    h.build(request(&[&stable, &unstable], &[&stable, &unstable]))
        .await
        .unwrap();

    h.build_with(
        request(&[&stable], &[&stable]),
        check.clone(),
        BuildOptions::default(),
    )
    .await
    .unwrap();

    let err = h
        .build_with(
            request(&[&unstable], &[&unstable]),
            check,
            BuildOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            Error::Store(bramble_store::Error::Reproducibility { .. })
        ),
        "{err:?}"
    );
}

#[tokio::test]
async fn missing_dependency() {
    let h = Harness::new().await;
    let (_, hello, greeting) = hello_world(&h.pkg_url());
    let err = h.build(request(&[&hello, &greeting], &[])).await.unwrap_err();
    assert!(
        matches!(
            &err,
            Error::DerivationNotFound { referenced_by: Some(name), .. } if name == "hello"
        ),
        "{err:?}"
    );
}

#[tokio::test]
async fn cancelled_before_start() {
    let h = Harness::new().await;
    let a = shell("a", "echo a > $out/f", &[]);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = build(
        h.builder.clone(),
        request(&[&a], &[&a]),
        &WalkOptions::default(),
        &BuildOptions::default(),
        &cancel,
    )
    .await
    .unwrap_err();
    assert!(err.is_cancelled(), "{err:?}");
}
