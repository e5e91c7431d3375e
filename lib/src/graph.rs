//! The dependency graph engine (spec.md §4.1).
//!
//! Nodes live in a flat `Vec` owned by [`Graph`]; edges are index lists, per
//! spec.md §9's design note ("Represent nodes by indices into a flat vector
//! and edges by index lists... a single owner (the graph) holds them, and
//! the traversal borrows"). This sidesteps the shared-mutable-ownership
//! graph patterns (`Rc<RefCell<_>>`) that the design note explicitly warns
//! against.

use std::collections::HashMap;

use crate::error::{ChariotError, Result};
use crate::manifest::Manifest;
use crate::tag::{Tag, TagKind};

/// An index into [`Graph::nodes`]. Never invalidated: nodes are never
/// removed once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(usize);

/// The unit-typed payload of a node — a tagged variant with fields the
/// assembler and orchestrator dispatch on, per spec.md §9's recommendation
/// ("represent this as a tagged variant with a dispatch function, not as a
/// captured closure whose lifetime is hard to reason about").
#[derive(Debug, Clone)]
pub enum UnitPayload {
    Source(crate::manifest::SourceUnit),
    Host(crate::manifest::HostTarget),
    Standard(crate::manifest::StandardTarget),
}

/// A graph vertex: one declared unit plus its build-time state (spec.md
/// §3.1 "Node").
#[derive(Debug, Clone)]
pub struct Node {
    pub tag: Tag,
    pub unit: UnitPayload,
    /// Build-order predecessors: edges that must complete before this node
    /// may execute.
    pub dependencies: Vec<NodeIndex>,
    /// Materialize-only predecessors (spec.md §4.1): staged at execution
    /// time, but do not participate in ordering.
    pub runtime_dependencies: Vec<NodeIndex>,
    pub built: bool,
    pub touched: bool,
    pub redo: bool,
}

/// The dependency graph: nodes plus a `Tag -> NodeIndex` index used during
/// (memoized) construction and by callers resolving CLI-provided tags.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    by_tag: HashMap<Tag, NodeIndex>,
}

impl Graph {
    pub fn node(&self, idx: NodeIndex) -> &Node {
        &self.nodes[idx.0]
    }

    pub fn node_mut(&mut self, idx: NodeIndex) -> &mut Node {
        &mut self.nodes[idx.0]
    }

    pub fn find(&self, tag: &Tag) -> Option<NodeIndex> {
        self.by_tag.get(tag).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every node's index, in construction order. Used to seed `built`
    /// state from on-disk cache presence before a traversal (spec.md §6:
    /// "presence of `built/<id>`... is the sole 'done' signal").
    pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        (0..self.nodes.len()).map(NodeIndex)
    }

    /// Build the full graph from a manifest, following every dependency and
    /// modifier-`source` reference reachable from the manifest's own
    /// declared units. Fails with [`ChariotError::UndefinedTarget`] on a
    /// dangling reference, matching spec.md §3.2's invariant.
    pub fn build(manifest: &Manifest) -> Result<Graph> {
        let mut graph = Graph::default();
        // Construction follows every declared unit so modifier `source`
        // references and standalone sources not reachable from any
        // requested tag are still validated up front (spec.md §3.2).
        for id in manifest.sources.keys() {
            graph.ensure(manifest, &Tag::source(id.clone()))?;
        }
        for id in manifest.hosts.keys() {
            graph.ensure(manifest, &Tag::host(id.clone()))?;
        }
        for id in manifest.targets.keys() {
            graph.ensure(manifest, &Tag::standard(id.clone()))?;
        }
        graph.detect_cycles()?;
        Ok(graph)
    }

    /// Memoized ensure-by-tag: returns the existing node index if already
    /// constructed, otherwise creates the node and recursively ensures each
    /// dependency (spec.md §4.1 "Construction").
    fn ensure(&mut self, manifest: &Manifest, tag: &Tag) -> Result<NodeIndex> {
        if let Some(idx) = self.by_tag.get(tag) {
            return Ok(*idx);
        }

        let (unit, dep_ids, runtime_dep_ids, modifier_sources): (
            UnitPayload,
            Vec<String>,
            Vec<String>,
            Vec<String>,
        ) = match tag.kind {
            TagKind::Source => {
                let src = manifest
                    .sources
                    .get(&tag.id)
                    .ok_or_else(|| ChariotError::UndefinedTarget { tag: tag.clone() })?;
                let modifier_sources = src
                    .modifiers
                    .iter()
                    .filter_map(|m| m.source.clone())
                    .collect();
                (
                    UnitPayload::Source(src.clone()),
                    src.dependencies.clone(),
                    Vec::new(),
                    modifier_sources,
                )
            }
            TagKind::Host => {
                let host = manifest
                    .hosts
                    .get(&tag.id)
                    .ok_or_else(|| ChariotError::UndefinedTarget { tag: tag.clone() })?;
                (
                    UnitPayload::Host(host.clone()),
                    host.dependencies.clone(),
                    host.runtime_dependencies.clone(),
                    Vec::new(),
                )
            }
            TagKind::Standard => {
                let target = manifest
                    .targets
                    .get(&tag.id)
                    .ok_or_else(|| ChariotError::UndefinedTarget { tag: tag.clone() })?;
                (
                    UnitPayload::Standard(target.clone()),
                    target.dependencies.clone(),
                    Vec::new(),
                    Vec::new(),
                )
            }
        };

        // Reserve the node's slot before recursing so a cycle just becomes a
        // repeated `ensure` call on an already-reserved tag; full cycle
        // rejection happens afterwards via `detect_cycles`'s coloring DFS.
        let idx = NodeIndex(self.nodes.len());
        self.nodes.push(Node {
            tag: tag.clone(),
            unit,
            dependencies: Vec::new(),
            runtime_dependencies: Vec::new(),
            built: false,
            touched: false,
            redo: false,
        });
        self.by_tag.insert(tag.clone(), idx);

        let mut dependencies = Vec::with_capacity(dep_ids.len() + modifier_sources.len());
        for dep in dep_ids.iter().map(|s| parse_dep_tag(s)) {
            dependencies.push(self.ensure(manifest, &dep)?);
        }
        // A modifier's `source` reference implicitly adds a `source:{id}`
        // edge (spec.md §4.1), and per spec.md §9's noted fix, modifier
        // sources are materialized as ordered dependencies so their fetch
        // always precedes this unit's own actions, regardless of manifest
        // sibling order.
        for src_id in &modifier_sources {
            dependencies.push(self.ensure(manifest, &Tag::source(src_id.clone()))?);
        }

        let mut runtime_dependencies = Vec::with_capacity(runtime_dep_ids.len());
        for dep in runtime_dep_ids.iter().map(|s| parse_dep_tag(s)) {
            runtime_dependencies.push(self.ensure(manifest, &dep)?);
        }

        let node = &mut self.nodes[idx.0];
        node.dependencies = dependencies;
        node.runtime_dependencies = runtime_dependencies;

        Ok(idx)
    }

    /// Reject cycles in the build-order edge relation (runtime-only edges
    /// never participate). A 3-color DFS: white (unvisited), gray
    /// (on the current path), black (fully explored). A back-edge to a gray
    /// node is a cycle. This corrects spec.md §3.2's noted original bug
    /// ("the original permits accidental re-entry").
    fn detect_cycles(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }
        let mut colors = vec![Color::White; self.nodes.len()];

        fn visit(graph: &Graph, colors: &mut [Color], idx: NodeIndex) -> Result<()> {
            colors[idx.0] = Color::Gray;
            for &dep in &graph.node(idx).dependencies {
                match colors[dep.0] {
                    Color::White => visit(graph, colors, dep)?,
                    Color::Gray => {
                        return Err(ChariotError::CycleDetected {
                            tag: graph.node(dep).tag.clone(),
                        })
                    }
                    Color::Black => {}
                }
            }
            colors[idx.0] = Color::Black;
            Ok(())
        }

        for i in 0..self.nodes.len() {
            if colors[i] == Color::White {
                visit(self, &mut colors, NodeIndex(i))?;
            }
        }
        Ok(())
    }

    /// Depth-first post-order traversal from each requested tag (spec.md
    /// §4.1 "Traversal"). `redo` marks the nodes explicitly named on the
    /// invocation line. `execute` performs the unit's action and is called
    /// at most once per node, only for nodes that need (re)building.
    pub fn traverse<F>(
        &mut self,
        requested: &[Tag],
        redo: &[Tag],
        mut execute: F,
    ) -> Result<()>
    where
        F: FnMut(&mut Graph, NodeIndex) -> Result<()>,
    {
        for tag in redo {
            let idx = self
                .find(tag)
                .ok_or_else(|| ChariotError::UndefinedTarget { tag: tag.clone() })?;
            self.node_mut(idx).redo = true;
        }

        for tag in requested {
            let idx = self
                .find(tag)
                .ok_or_else(|| ChariotError::UndefinedTarget { tag: tag.clone() })?;
            self.visit(idx, &mut execute)?;
        }
        Ok(())
    }

    fn visit<F>(&mut self, idx: NodeIndex, execute: &mut F) -> Result<()>
    where
        F: FnMut(&mut Graph, NodeIndex) -> Result<()>,
    {
        if self.node(idx).touched {
            return Ok(());
        }
        self.node_mut(idx).touched = true;

        let deps = self.node(idx).dependencies.clone();
        for dep in deps {
            self.visit(dep, execute)?;
        }

        let node = self.node(idx);
        if node.built && !node.redo {
            return Ok(());
        }
        self.node_mut(idx).redo = false;

        execute(self, idx)?;
        self.node_mut(idx).built = true;
        Ok(())
    }
}

/// Parse a dependency-list entry into a [`Tag`]. Manifest dependency
/// strings use the same `kind:id`/`id` grammar as CLI-positional tags.
fn parse_dep_tag(s: &str) -> Tag {
    s.parse().unwrap_or_else(|_| Tag::standard(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(text: &str) -> Manifest {
        Manifest::parse(text).unwrap()
    }

    #[test]
    fn test_build_simple() {
        let m = manifest(
            r#"
            [project]
            name = "t"
            [source.hello]
            type = "local"
            url = "/tmp/hello"
            "#,
        );
        let graph = Graph::build(&m).unwrap();
        assert_eq!(graph.len(), 1);
        assert!(graph.find(&Tag::source("hello")).is_some());
    }

    #[test]
    fn test_undefined_dependency_fails() {
        let m = manifest(
            r#"
            [project]
            name = "t"
            [target.app]
            dependencies = ["host:missing"]
            "#,
        );
        assert!(matches!(
            Graph::build(&m),
            Err(ChariotError::UndefinedTarget { .. })
        ));
    }

    #[test]
    fn test_cycle_rejected() {
        let m = manifest(
            r#"
            [project]
            name = "t"
            [target.a]
            dependencies = ["b"]
            [target.b]
            dependencies = ["a"]
            "#,
        );
        assert!(matches!(
            Graph::build(&m),
            Err(ChariotError::CycleDetected { .. })
        ));
    }

    #[test]
    fn test_modifier_source_becomes_dependency() {
        let m = manifest(
            r#"
            [project]
            name = "t"
            [source.patch-pkg]
            type = "local"
            url = "/tmp/patch-pkg"
            [source.hello]
            type = "local"
            url = "/tmp/hello"
            [[source.hello.modifiers]]
            type = "patch"
            source = "patch-pkg"
            file = "01.diff"
            "#,
        );
        let graph = Graph::build(&m).unwrap();
        let hello = graph.find(&Tag::source("hello")).unwrap();
        let patch_pkg = graph.find(&Tag::source("patch-pkg")).unwrap();
        assert!(graph.node(hello).dependencies.contains(&patch_pkg));
    }

    #[test]
    fn test_traversal_order_and_skip() {
        let m = manifest(
            r#"
            [project]
            name = "t"
            [host.cmake]
            build = ["build-cmake"]
            [source.app-src]
            type = "local"
            url = "/tmp/app-src"
            [target.app]
            dependencies = ["host:cmake", "source:app-src"]
            build = ["cmake"]
            "#,
        );
        let mut graph = Graph::build(&m).unwrap();
        let mut executed = Vec::new();
        graph
            .traverse(&[Tag::standard("app")], &[], |g, idx| {
                executed.push(g.node(idx).tag.clone());
                Ok(())
            })
            .unwrap();
        assert_eq!(
            executed,
            vec![Tag::host("cmake"), Tag::source("app-src"), Tag::standard("app")]
        );

    }

    /// Simulates a second invocation (a fresh `Graph`, `touched` all false)
    /// where the cache directories from a prior run already exist: `built`
    /// is pre-seeded true for every node, so the traversal should visit but
    /// not execute any of them (spec.md §8 property 4 / scenario S5).
    #[test]
    fn test_incremental_skip_of_already_built_nodes() {
        let m = manifest(
            r#"
            [project]
            name = "t"
            [host.cmake]
            build = ["build-cmake"]
            [source.app-src]
            type = "local"
            url = "/tmp/app-src"
            [target.app]
            dependencies = ["host:cmake", "source:app-src"]
            build = ["cmake"]
            "#,
        );
        let mut graph = Graph::build(&m).unwrap();
        for idx in [
            graph.find(&Tag::host("cmake")).unwrap(),
            graph.find(&Tag::source("app-src")).unwrap(),
        ] {
            graph.node_mut(idx).built = true;
        }

        let mut executed = Vec::new();
        graph
            .traverse(&[Tag::standard("app")], &[], |g, idx| {
                executed.push(g.node(idx).tag.clone());
                Ok(())
            })
            .unwrap();

        // Only the explicitly requested, not-yet-built `app` executes.
        assert_eq!(executed, vec![Tag::standard("app")]);
    }

    #[test]
    fn test_redo_forces_reexecution() {
        let m = manifest(
            r#"
            [project]
            name = "t"
            [target.app]
            build = ["cmake"]
            "#,
        );
        let mut graph = Graph::build(&m).unwrap();
        let app = graph.find(&Tag::standard("app")).unwrap();
        graph.node_mut(app).built = true;

        let mut ran = false;
        graph
            .traverse(&[Tag::standard("app")], &[Tag::standard("app")], |_, _| {
                ran = true;
                Ok(())
            })
            .unwrap();
        assert!(ran, "redo should force re-execution of an already-built node");
        assert!(!graph.node(app).redo, "redo clears on first execution");
    }
}
