//! The dependency graph of derivation outputs.
//!
//! Vertices are single outputs of derivations. An edge `a -> b` means `a`
//! needs `b` to be built first. When more than one output is requested, a
//! synthetic [Vertex::Root] ties them together so the graph has a single
//! root.
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::{self, Write};

use bramble_store::{Dependency, Derivation};
use petgraph::algo::tarjan_scc;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::Direction;
use tracing::instrument;

use crate::Error;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Vertex {
    /// Ties several requested outputs together. Never built.
    Root,
    Output(Dependency),
}

impl Vertex {
    pub fn dependency(&self) -> Option<&Dependency> {
        match self {
            Vertex::Root => None,
            Vertex::Output(dep) => Some(dep),
        }
    }
}

impl fmt::Display for Vertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Vertex::Root => f.write_str("root"),
            Vertex::Output(dep) => write!(f, "{dep}"),
        }
    }
}

impl From<Dependency> for Vertex {
    fn from(dep: Dependency) -> Self {
        Vertex::Output(dep)
    }
}

#[derive(Clone, Debug, Default)]
pub struct DependencyGraph {
    graph: StableDiGraph<Vertex, ()>,
    indices: HashMap<Vertex, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_vertex(&mut self, vertex: Vertex) -> NodeIndex {
        if let Some(ix) = self.indices.get(&vertex) {
            return *ix;
        }
        let ix = self.graph.add_node(vertex.clone());
        self.indices.insert(vertex, ix);
        ix
    }

    /// Records that `dependent` needs `dependency`, adding either vertex if
    /// it's missing.
    pub fn connect(&mut self, dependent: Vertex, dependency: Vertex) {
        let a = self.add_vertex(dependent);
        let b = self.add_vertex(dependency);
        self.graph.update_edge(a, b, ());
    }

    pub fn contains(&self, vertex: &Vertex) -> bool {
        self.indices.contains_key(vertex)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn vertices(&self) -> impl Iterator<Item = &Vertex> {
        self.graph.node_weights()
    }

    /// All edges as `(dependent, dependency)`.
    pub fn edges(&self) -> impl Iterator<Item = (&Vertex, &Vertex)> {
        self.graph
            .edge_references()
            .map(|e| (&self.graph[e.source()], &self.graph[e.target()]))
    }

    fn neighbors(&self, vertex: &Vertex, direction: Direction) -> Vec<Vertex> {
        let Some(ix) = self.indices.get(vertex) else {
            return vec![];
        };
        let mut out: Vec<Vertex> = self
            .graph
            .neighbors_directed(*ix, direction)
            .map(|n| self.graph[n].clone())
            .collect();
        out.sort();
        out
    }

    /// The vertices `vertex` needs.
    pub fn dependencies(&self, vertex: &Vertex) -> Vec<Vertex> {
        self.neighbors(vertex, Direction::Outgoing)
    }

    /// The vertices needing `vertex`.
    pub fn dependents(&self, vertex: &Vertex) -> Vec<Vertex> {
        self.neighbors(vertex, Direction::Incoming)
    }

    /// Vertices nothing depends on.
    pub fn roots(&self) -> Vec<Vertex> {
        let mut roots: Vec<Vertex> = self
            .graph
            .node_indices()
            .filter(|ix| {
                self.graph
                    .neighbors_directed(*ix, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|ix| self.graph[ix].clone())
            .collect();
        roots.sort();
        roots
    }

    /// The single root of the graph, if there is exactly one.
    pub fn root(&self) -> Option<Vertex> {
        let mut roots = self.roots();
        (roots.len() == 1).then(|| roots.remove(0))
    }

    pub fn remove_vertex(&mut self, vertex: &Vertex) -> bool {
        match self.indices.remove(vertex) {
            Some(ix) => self.graph.remove_node(ix).is_some(),
            None => false,
        }
    }

    /// Points every edge into `old` at `new` and removes `old`.
    pub fn replace_vertex(&mut self, old: &Vertex, new: Vertex) {
        let dependents = self.dependents(old);
        self.remove_vertex(old);
        let new_ix = self.add_vertex(new);
        for dependent in dependents {
            let ix = self.add_vertex(dependent);
            self.graph.update_edge(ix, new_ix, ());
        }
    }

    /// Ties all roots to a single [Vertex::Root] if there is more than one.
    pub fn reroot(&mut self) {
        let roots = self.roots();
        if roots.len() > 1 {
            for root in roots.into_iter().filter(|r| r != &Vertex::Root) {
                self.connect(Vertex::Root, root);
            }
        }
    }

    /// Union of all vertices and edges of `graphs`, with a single root.
    pub fn merge(graphs: impl IntoIterator<Item = DependencyGraph>) -> DependencyGraph {
        let mut graphs = graphs.into_iter();
        let mut out = graphs.next().unwrap_or_default();
        for graph in graphs {
            for vertex in graph.vertices() {
                out.add_vertex(vertex.clone());
            }
            for (a, b) in graph.edges() {
                out.connect(a.clone(), b.clone());
            }
        }
        out.reroot();
        out
    }

    /// Fails with [Error::GraphCycle] if the graph isn't acyclic. `name`
    /// looks up derivation names for the error message.
    pub fn validate<F>(&self, name: F) -> Result<(), Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        for component in tarjan_scc(&self.graph) {
            let cyclic = component.len() > 1
                || component
                    .first()
                    .is_some_and(|ix| self.graph.contains_edge(*ix, *ix));
            if !cyclic {
                continue;
            }
            let mut vertices: Vec<String> = component
                .iter()
                .map(|ix| describe(&self.graph[*ix], &name))
                .collect();
            vertices.sort();
            return Err(Error::GraphCycle(vertices));
        }
        Ok(())
    }

    /// Graphviz rendering with derivation hashes replaced by `names`, for
    /// debugging.
    pub fn to_dot(&self, names: &HashMap<String, String>) -> String {
        let label = |v: &Vertex| match v {
            Vertex::Root => "root".to_string(),
            Vertex::Output(dep) => format!(
                "{}:{}",
                names.get(&dep.hash).unwrap_or(&dep.hash),
                dep.output
            ),
        };
        let edges: BTreeSet<(String, String)> =
            self.edges().map(|(a, b)| (label(a), label(b))).collect();
        let lonely: BTreeSet<String> = self
            .graph
            .node_indices()
            .filter(|ix| self.graph.neighbors_undirected(*ix).next().is_none())
            .map(|ix| label(&self.graph[ix]))
            .collect();

        let mut out = String::from("digraph {\n");
        for vertex in lonely {
            let _ = writeln!(out, "  {vertex:?}");
        }
        for (a, b) in edges {
            let _ = writeln!(out, "  {a:?} -> {b:?}");
        }
        out.push('}');
        out
    }
}

fn describe<F: Fn(&str) -> Option<String>>(vertex: &Vertex, name: &F) -> String {
    match vertex {
        Vertex::Root => "root".to_string(),
        Vertex::Output(dep) => match name(&dep.hash) {
            Some(name) => format!("{name} ({dep})"),
            None => dep.to_string(),
        },
    }
}

/// Derivations keyed by their hash.
pub fn derivation_map(
    derivations: impl IntoIterator<Item = Derivation>,
) -> HashMap<String, Derivation> {
    derivations
        .into_iter()
        .map(|drv| (drv.hash(), drv.formatted()))
        .collect()
}

/// Builds the graph of everything needed to build `requested`, looking
/// derivations up by hash in `derivations`.
#[instrument(skip_all, fields(requested = requested.len()), err)]
pub fn build_graph(
    requested: &[Dependency],
    derivations: &HashMap<String, Derivation>,
) -> Result<DependencyGraph, Error> {
    let mut graph = DependencyGraph::new();
    for dep in requested {
        graph.add_vertex(dep.clone().into());
    }

    let mut queue: Vec<(Dependency, Option<String>)> =
        requested.iter().map(|dep| (dep.clone(), None)).collect();
    let mut seen = HashSet::new();
    while let Some((dep, referenced_by)) = queue.pop() {
        if !seen.insert(dep.clone()) {
            continue;
        }
        let drv = derivations
            .get(&dep.hash)
            .ok_or_else(|| Error::DerivationNotFound {
                hash: dep.hash.clone(),
                referenced_by,
            })?;
        if !drv.has_output(&dep.output) {
            return Err(Error::UnknownOutput {
                hash: dep.hash.clone(),
                name: drv.name.clone(),
                output: dep.output.clone(),
            });
        }
        for child in &drv.dependencies {
            graph.connect(dep.clone().into(), child.clone().into());
            queue.push((child.clone(), Some(drv.name.clone())));
        }
    }

    graph.reroot();
    graph.validate(|hash| derivations.get(hash).map(|d| d.name.clone()))?;
    Ok(graph)
}

/// The graph of outputs needed at runtime by the outputs of `built`: each
/// output points at the outputs its contents refer to.
pub fn runtime_dependency_graph(built: &[Derivation]) -> DependencyGraph {
    let mut producers: HashMap<&str, Dependency> = HashMap::new();
    for drv in built {
        let hash = drv.hash();
        for (name, output) in drv.output_names.iter().zip(&drv.outputs) {
            producers.insert(&output.path, Dependency::new(hash.clone(), name.clone()));
        }
    }

    let mut graph = DependencyGraph::new();
    for drv in built {
        let hash = drv.hash();
        for (name, output) in drv.output_names.iter().zip(&drv.outputs) {
            let vertex = Vertex::Output(Dependency::new(hash.clone(), name.clone()));
            graph.add_vertex(vertex.clone());
            for path in &output.dependencies {
                if let Some(producer) = producers.get(path.as_str()) {
                    let producer = Vertex::Output(producer.clone());
                    if producer != vertex {
                        graph.connect(vertex.clone(), producer);
                    }
                }
            }
        }
    }
    graph.reroot();
    graph
}
