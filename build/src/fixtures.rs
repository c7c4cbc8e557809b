use bramble_store::{Dependency, Derivation};

/// A derivation with an `out` output that refers to the `out` output of each
/// of `deps`.
pub(crate) fn drv(name: &str, deps: &[&Derivation]) -> Derivation {
    multi_output_drv(name, &["out"], deps)
}

pub(crate) fn multi_output_drv(name: &str, outputs: &[&str], deps: &[&Derivation]) -> Derivation {
    let mut drv = Derivation::new(name, "/bin/sh");
    drv.output_names = outputs.iter().map(|o| o.to_string()).collect();
    for dep in deps {
        drv.args.push(dep.placeholder("out"));
        drv.dependencies.push(Dependency::new(dep.hash(), "out"));
    }
    drv.formatted()
}
