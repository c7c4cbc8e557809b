//! Placeholders stand in for the store path of a dependency output that has
//! not been built yet. They look like `{{ <hash>:<output> }}`; the filename
//! form `{{ <hash>-<name>.drv:<output> }}` is accepted as well and refers to
//! the same [Dependency].
use std::borrow::Cow;
use std::collections::BTreeSet;

use lazy_static::lazy_static;
use regex::{Captures, Regex};

use super::Dependency;

lazy_static! {
    static ref PLACEHOLDER_RE: Regex =
        Regex::new(r"\{\{ ([0-9a-z]{32})(?:-[^\s:{}]+?\.drv)?:(.+?) \}\}")
            .expect("invalid placeholder regex");
}

/// Formats the placeholder for the given derivation hash and output name.
pub fn placeholder(hash: &str, output: &str) -> String {
    format!("{{{{ {hash}:{output} }}}}")
}

pub fn contains_placeholder(s: &str) -> bool {
    PLACEHOLDER_RE.is_match(s)
}

/// Returns every dependency referenced by a placeholder in `s`.
pub fn find_placeholders(s: &str) -> BTreeSet<Dependency> {
    PLACEHOLDER_RE
        .captures_iter(s)
        .map(|c| Dependency::new(&c[1], &c[2]))
        .collect()
}

/// Replaces placeholders in `s` with the value returned by `f`.
/// Placeholders for which `f` returns [None] are left untouched.
pub fn replace_placeholders<'a, F>(s: &'a str, mut f: F) -> Cow<'a, str>
where
    F: FnMut(&Dependency) -> Option<String>,
{
    PLACEHOLDER_RE.replace_all(s, |c: &Captures| {
        let dependency = Dependency::new(&c[1], &c[2]);
        f(&dependency).unwrap_or_else(|| c[0].to_string())
    })
}
