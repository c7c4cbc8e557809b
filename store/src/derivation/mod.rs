//! The [Derivation] is the basic building block of a bramble build.
//!
//! A derivation is identified by the hash of its canonical JSON form with
//! [Derivation::outputs] cleared, and stored as `{hash}-{name}.drv`.
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hasher::hash_string;
use crate::Error;

mod placeholder;

pub use placeholder::{contains_placeholder, find_placeholders, placeholder, replace_placeholders};

/// Name of the output every derivation has unless told otherwise.
pub const DEFAULT_OUTPUT: &str = "out";

/// A build step.
///
/// Fields are declared in alphabetical order, which keeps the serialized
/// JSON key order stable.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Derivation {
    /// Arguments passed to the builder.
    #[serde(with = "nullable", default)]
    pub args: Vec<String>,
    /// Either the name of a built-in builder (like `basic_fetch_url`), or the
    /// path of an executable in the store.
    pub builder: String,
    /// Outputs of other derivations used as inputs to this one.
    #[serde(with = "nullable", default)]
    pub dependencies: Vec<Dependency>,
    /// Environment variables set during the build.
    #[serde(with = "nullable", default)]
    pub env: BTreeMap<String, String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub network: bool,
    #[serde(with = "nullable", default)]
    pub output_names: Vec<String>,
    /// Build results, parallel to [Derivation::output_names].
    /// Excluded from the derivation hash.
    #[serde(with = "nullable", default)]
    pub outputs: Vec<Output>,
    /// Platform this derivation was built on.
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub source: Source,
    /// Platform this derivation is built for. Empty means [Derivation::platform].
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,
}

/// The result of building one named output.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Output {
    /// Hash of the output contents, which is also its directory name in the
    /// store.
    pub path: String,
    /// Store entries this output references at runtime.
    #[serde(with = "nullable", default)]
    pub dependencies: Vec<String>,
}

/// Source files staged into the build directory before a build.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Source {
    /// Directory within the staged sources the builder runs from.
    pub relative_build_path: String,
    /// Store entry holding the sources, empty if there are none.
    pub path: String,
}

/// A reference to one output of one derivation.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Dependency {
    pub hash: String,
    pub output: String,
}

impl Dependency {
    pub fn new(hash: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            output: output.into(),
        }
    }

    pub fn placeholder(&self) -> String {
        placeholder(&self.hash, &self.output)
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hash, self.output)
    }
}

impl Derivation {
    pub fn new(name: impl Into<String>, builder: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            builder: builder.into(),
            output_names: vec![DEFAULT_OUTPUT.to_string()],
            ..Default::default()
        }
    }

    /// Returns a copy with dependencies sorted and deduplicated.
    pub fn formatted(mut self) -> Self {
        self.dependencies.sort();
        self.dependencies.dedup();
        self
    }

    /// Canonical JSON encoding of the derivation, as written to the store.
    pub fn json(&self) -> Vec<u8> {
        // Serializing plain strings and maps can't fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn pretty_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn from_json(data: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Content hash of the derivation, ignoring any outputs.
    pub fn hash(&self) -> String {
        let mut copy = self.clone().formatted();
        copy.outputs.clear();
        hash_string(copy.json())
    }

    pub fn filename(&self) -> String {
        format!("{}-{}.drv", self.hash(), self.name)
    }

    /// Placeholder other derivations use to reference `output` of this one.
    pub fn placeholder(&self, output: &str) -> String {
        placeholder(&self.hash(), output)
    }

    /// One [Dependency] per declared output.
    pub fn outputs_as_dependencies(&self) -> Vec<Dependency> {
        let hash = self.hash();
        self.output_names
            .iter()
            .map(|name| Dependency::new(hash.clone(), name.clone()))
            .collect()
    }

    pub fn has_output(&self, name: &str) -> bool {
        self.output_names.iter().any(|n| n == name)
    }

    /// The built output with the given name, if present.
    pub fn output(&self, name: &str) -> Option<&Output> {
        self.output_names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.outputs.get(i))
            .filter(|o| !o.path.is_empty())
    }

    /// Name of the output used when a derivation is referenced without one.
    pub fn default_output(&self) -> &str {
        if self.has_output(DEFAULT_OUTPUT) || self.output_names.is_empty() {
            DEFAULT_OUTPUT
        } else {
            &self.output_names[0]
        }
    }

    /// True if the derivation has not been built, or is missing any output.
    pub fn missing_output(&self) -> bool {
        self.outputs.is_empty()
            || self.outputs.len() != self.output_names.len()
            || self.outputs.iter().any(|o| o.path.is_empty())
    }

    /// Rewrites every placeholder for which `outputs` has a value.
    pub fn patch_dependency_references(
        &self,
        outputs: &HashMap<Dependency, String>,
    ) -> Result<Self, Error> {
        self.map_json(|json| replace_placeholders(json, |dep| outputs.get(dep).cloned()).into_owned())
    }

    /// Points every reference to `old` at `new` instead, used when a
    /// dependency is swapped for a different derivation.
    pub fn patch_derivation_references(
        &self,
        old: &Dependency,
        new: &Dependency,
    ) -> Result<Self, Error> {
        let mut patched = self.map_json(|json| {
            replace_placeholders(json, |dep| (dep == old).then(|| new.placeholder())).into_owned()
        })?;
        for dep in patched.dependencies.iter_mut() {
            if dep == old {
                *dep = new.clone();
            }
        }
        Ok(patched.formatted())
    }

    /// Applies a textual transformation to the JSON form and parses the
    /// result back.
    pub(crate) fn map_json<F>(&self, f: F) -> Result<Self, Error>
    where
        F: FnOnce(&str) -> String,
    {
        let json = String::from_utf8(self.json()).map_err(|e| {
            Error::invalid_derivation(&self.name, format!("non utf-8 json: {e}"))
        })?;
        Self::from_json(f(&json).as_bytes())
    }

    /// Returns all placeholders still present in the derivation.
    pub fn unresolved_placeholders(&self) -> Vec<Dependency> {
        let json = String::from_utf8_lossy(&self.json()).into_owned();
        find_placeholders(&json).into_iter().collect()
    }

    /// Environment in `KEY=value` form.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Orders `outputs` by `names`, failing if any name has no output.
pub(crate) fn outputs_in_order(
    drv_name: &str,
    names: &[String],
    mut outputs: BTreeMap<String, Output>,
) -> Result<Vec<Output>, Error> {
    if names.len() != outputs.len() {
        return Err(Error::invalid_derivation(
            drv_name,
            format!(
                "expected outputs {:?}, got {:?}",
                names,
                outputs.keys().collect::<Vec<_>>()
            ),
        ));
    }
    names
        .iter()
        .map(|name| {
            outputs.remove(name).ok_or_else(|| {
                Error::invalid_derivation(drv_name, format!("missing output {name:?}"))
            })
        })
        .collect()
}

/// Serializes empty collections as `null`, and reads `null` back as empty.
mod nullable {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S, C>(value: &C, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        C: Serialize,
        for<'a> &'a C: IntoIterator,
    {
        if value.into_iter().next().is_none() {
            serializer.serialize_none()
        } else {
            value.serialize(serializer)
        }
    }

    pub fn deserialize<'de, D, C>(deserializer: D) -> Result<C, D::Error>
    where
        D: Deserializer<'de>,
        C: Deserialize<'de> + Default,
    {
        Ok(Option::<C>::deserialize(deserializer)?.unwrap_or_default())
    }
}
