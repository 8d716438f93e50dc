//! The build graph: aliases, stamps, nodes and their dependency bookkeeping.
//!
//! A node owns one `Buildable` plus three disjoint dependency maps (static,
//! dynamic, output) and the stamp recorded by its last successful build.
//! Execution lives in `work.rs`; persistence in `db.rs`.

use crate::fs::FileSystem;
use crate::future::Future;
use crate::hash::{serialize_any_fingerprint, Fingerprint};
use crate::serial::{ArchiveWriter, ARCHIVE_VERSION};
use crate::work::BuildOutcome;
use anyhow::bail;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

/// Globally unique identifier of a buildable entity, namespaced by category:
/// `"File://src/main.c"`, `"Cache://Actions/link"`.  Ordering is plain
/// string order.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BuildAlias(String);

impl BuildAlias {
    /// Builds a `<category>://<path>` alias.  Both parts must be non-empty.
    pub fn new(category: &str, path: &str) -> BuildAlias {
        assert!(
            !category.is_empty() && !path.is_empty(),
            "degenerate alias {:?}://{:?}",
            category,
            path
        );
        BuildAlias(format!("{}://{}", category, path))
    }

    /// Validates an alias string: non-empty category and path around `://`.
    pub fn parse(s: &str) -> anyhow::Result<BuildAlias> {
        match s.split_once("://") {
            Some((cat, path)) if !cat.is_empty() && !path.is_empty() => {
                Ok(BuildAlias(s.to_string()))
            }
            _ => bail!("malformed alias {:?}", s),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn category(&self) -> &str {
        self.0.split_once("://").map(|(c, _)| c).unwrap_or("")
    }
}

impl fmt::Display for BuildAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for BuildAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// The state of a buildable the last time it was successfully built.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct BuildStamp {
    pub mtime: SystemTime,
    pub content: Fingerprint,
}

impl BuildStamp {
    /// The "never built" stamp; `is_valid()` is false.
    pub fn zero() -> BuildStamp {
        BuildStamp {
            mtime: SystemTime::UNIX_EPOCH,
            content: Fingerprint::ZERO,
        }
    }

    /// A valid stamp always carries a non-zero content fingerprint.
    pub fn is_valid(&self) -> bool {
        self.content.is_valid()
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DepKind {
    Static,
    Dynamic,
    Output,
}

impl fmt::Display for DepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DepKind::Static => "static",
            DepKind::Dynamic => "dynamic",
            DepKind::Output => "output",
        })
    }
}

/// The capability contract every graph entity implements.
pub trait Buildable: Send + Sync {
    /// Stable identity.
    fn alias(&self) -> BuildAlias;

    /// Downcast hook so callers can inspect a concrete unit's state after
    /// a build (e.g. read a file probe's digest).
    fn as_any(&self) -> &dyn std::any::Any;

    /// Registered type name; keys the serialization registry.
    fn type_name(&self) -> &'static str;

    /// Persist the buildable's state.  The same bytes feed the node's
    /// content fingerprint, so they must be deterministic.
    fn serialize(&self, w: &mut ArchiveWriter) -> anyhow::Result<()>;

    /// Execute one build step.  Dynamic dependencies and outputs are
    /// declared through the context as they are discovered.
    fn build(&mut self, ctx: &mut crate::work::ExecuteContext) -> anyhow::Result<()>;
}

/// The three dependency maps.  An alias lives in at most one of them.
#[derive(Default, PartialEq)]
pub(crate) struct DepMaps {
    pub statics: BTreeMap<BuildAlias, BuildStamp>,
    pub dynamics: BTreeMap<BuildAlias, BuildStamp>,
    pub outputs: BTreeMap<BuildAlias, BuildStamp>,
}

impl DepMaps {
    pub fn kind_of(&self, alias: &BuildAlias) -> Option<DepKind> {
        if self.statics.contains_key(alias) {
            Some(DepKind::Static)
        } else if self.dynamics.contains_key(alias) {
            Some(DepKind::Dynamic)
        } else if self.outputs.contains_key(alias) {
            Some(DepKind::Output)
        } else {
            None
        }
    }

    /// Inserts a dependency, asserting the disjointness invariant.
    /// Re-declaring under the same kind refreshes the stamp; re-declaring
    /// under a different kind is a programming error.
    pub fn insert(&mut self, kind: DepKind, alias: BuildAlias, stamp: BuildStamp) {
        if let Some(existing) = self.kind_of(&alias) {
            if existing != kind {
                panic!(
                    "dependency {} already declared as {}, cannot redeclare as {}",
                    alias, existing, kind
                );
            }
        }
        let map = match kind {
            DepKind::Static => &mut self.statics,
            DepKind::Dynamic => &mut self.dynamics,
            DepKind::Output => &mut self.outputs,
        };
        map.insert(alias, stamp);
    }
}

pub(crate) struct NodeInner {
    pub buildable: Box<dyn Buildable>,
    pub stamp: BuildStamp,
    pub deps: DepMaps,
}

/// One vertex of the build graph.  All mutable state sits behind the inner
/// lock; the in-flight future has its own mutex so that launching a build
/// never contends with stamp reads.
pub struct BuildNode {
    alias: BuildAlias,
    pub(crate) inner: RwLock<NodeInner>,
    pub(crate) flight: Mutex<Option<Future<BuildOutcome>>>,
}

impl BuildNode {
    fn new(buildable: Box<dyn Buildable>, static_deps: &[BuildAlias]) -> BuildNode {
        let alias = buildable.alias();
        let mut deps = DepMaps::default();
        for dep in static_deps {
            assert!(*dep != alias, "node {} cannot depend on itself", alias);
            deps.insert(DepKind::Static, dep.clone(), BuildStamp::zero());
        }
        BuildNode {
            alias,
            inner: RwLock::new(NodeInner {
                buildable,
                stamp: BuildStamp::zero(),
                deps,
            }),
            flight: Mutex::new(None),
        }
    }

    /// Reassembles a node from its persisted parts; used by `db::open`.
    pub(crate) fn restored(
        buildable: Box<dyn Buildable>,
        stamp: BuildStamp,
        deps: DepMaps,
    ) -> BuildNode {
        BuildNode {
            alias: buildable.alias(),
            inner: RwLock::new(NodeInner {
                buildable,
                stamp,
                deps,
            }),
            flight: Mutex::new(None),
        }
    }

    pub fn alias(&self) -> &BuildAlias {
        &self.alias
    }

    pub fn build_stamp(&self) -> BuildStamp {
        self.inner.read().unwrap().stamp
    }

    /// True if this node statically or dynamically depends on any of the
    /// given aliases.
    pub fn depends_on(&self, aliases: &[BuildAlias]) -> bool {
        let inner = self.inner.read().unwrap();
        aliases
            .iter()
            .any(|a| inner.deps.statics.contains_key(a) || inner.deps.dynamics.contains_key(a))
    }

    /// Read access to the buildable without exposing the lock guard.
    pub fn with_buildable<R>(&self, f: impl FnOnce(&dyn Buildable) -> R) -> R {
        f(self.inner.read().unwrap().buildable.as_ref())
    }

    pub(crate) fn add_dep(&self, kind: DepKind, alias: BuildAlias, stamp: BuildStamp) {
        assert!(alias != self.alias, "node {} cannot depend on itself", self.alias);
        self.inner.write().unwrap().deps.insert(kind, alias, stamp);
    }

    /// The static and dynamic dependency aliases, for callers assembling a
    /// node's input closure.
    pub fn input_aliases(&self) -> Vec<BuildAlias> {
        let inner = self.inner.read().unwrap();
        inner
            .deps
            .statics
            .keys()
            .chain(inner.deps.dynamics.keys())
            .cloned()
            .collect()
    }

    /// Resets the stamp, the discovered (dynamic/output) edges, and any
    /// memoized in-flight result.  Static edges survive: they are
    /// re-declared identically on every re-initialization, while
    /// dynamic/output edges are found fresh on every actual build.
    pub(crate) fn make_dirty(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.stamp = BuildStamp::zero();
        inner.deps.dynamics.clear();
        inner.deps.outputs.clear();
        drop(inner);
        *self.flight.lock().unwrap() = None;
    }

    /// Replaces the buildable and the static-dependency set, preserving
    /// stamps of static deps that are retained.
    fn reinitialize(&self, buildable: Box<dyn Buildable>, static_deps: &[BuildAlias]) {
        self.make_dirty();
        let mut inner = self.inner.write().unwrap();
        let old = std::mem::take(&mut inner.deps.statics);
        inner.buildable = buildable;
        for dep in static_deps {
            assert!(*dep != self.alias, "node {} cannot depend on itself", self.alias);
            let stamp = old.get(dep).copied().unwrap_or_else(BuildStamp::zero);
            inner.deps.insert(DepKind::Static, dep.clone(), stamp);
        }
    }

    fn static_set_matches(&self, static_deps: &[BuildAlias]) -> bool {
        let inner = self.inner.read().unwrap();
        inner.deps.statics.len() == static_deps.len()
            && static_deps.iter().all(|a| inner.deps.statics.contains_key(a))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeEvent {
    Created,
    Invalidated,
    Built,
}

type Observer = Box<dyn Fn(&BuildAlias, NodeEvent) + Send + Sync>;

#[derive(Clone)]
pub struct GraphOptions {
    /// Salt fed into every fingerprint; bumping it invalidates all stamps.
    pub seed: Fingerprint,
    /// When false, builds run lazily on the joining thread, giving a
    /// deterministic single-threaded order for debugging.
    pub concurrent: bool,
}

impl Default for GraphOptions {
    fn default() -> Self {
        GraphOptions {
            seed: Fingerprint::of_str(
                Fingerprint::ZERO,
                &format!("incra-archive-v{}", ARCHIVE_VERSION),
            ),
            concurrent: true,
        }
    }
}

/// The orchestrator: a concurrent alias → node map plus a revision counter
/// that tracks whether the graph differs from its persisted form.
pub struct BuildGraph {
    pub(crate) nodes: DashMap<BuildAlias, Arc<BuildNode>>,
    fs: Arc<dyn FileSystem>,
    options: GraphOptions,
    revision: AtomicU64,
    saved_revision: AtomicU64,
    observers: Mutex<Vec<Observer>>,
}

impl BuildGraph {
    pub fn new(fs: Arc<dyn FileSystem>, options: GraphOptions) -> BuildGraph {
        BuildGraph {
            nodes: DashMap::new(),
            fs,
            options,
            revision: AtomicU64::new(0),
            saved_revision: AtomicU64::new(0),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    pub fn seed(&self) -> Fingerprint {
        self.options.seed
    }

    pub fn concurrent(&self) -> bool {
        self.options.concurrent
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, alias: &BuildAlias) -> Option<Arc<BuildNode>> {
        self.nodes.get(alias).map(|entry| entry.value().clone())
    }

    /// All nodes in alias order, for persistence and inspection.
    pub fn sorted_nodes(&self) -> Vec<Arc<BuildNode>> {
        let mut nodes: Vec<_> = self
            .nodes
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        nodes.sort_by(|a, b| a.alias().cmp(b.alias()));
        nodes
    }

    /// True when the graph changed since the last save/load.
    pub fn dirty(&self) -> bool {
        self.revision.load(Ordering::Acquire) != self.saved_revision.load(Ordering::Acquire)
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    pub(crate) fn bump_revision(&self) {
        self.revision.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn mark_saved(&self) {
        self.saved_revision
            .store(self.revision.load(Ordering::Acquire), Ordering::Release);
    }

    pub(crate) fn mark_unsaved(&self) {
        self.bump_revision();
    }

    /// Registers an observer for node lifecycle events.
    pub fn subscribe(&self, observer: impl Fn(&BuildAlias, NodeEvent) + Send + Sync + 'static) {
        self.observers.lock().unwrap().push(Box::new(observer));
    }

    pub(crate) fn notify(&self, alias: &BuildAlias, event: NodeEvent) {
        for observer in self.observers.lock().unwrap().iter() {
            observer(alias, event);
        }
    }

    /// Drops a node's stamp, discovered edges and memoized result so the
    /// next build request re-executes it.  Returns false if no node with
    /// that alias exists.
    pub fn invalidate(&self, alias: &BuildAlias) -> bool {
        match self.node(alias) {
            Some(node) => {
                node.make_dirty();
                self.bump_revision();
                self.notify(alias, NodeEvent::Invalidated);
                true
            }
            None => false,
        }
    }

    /// Idempotent upsert by alias.
    ///
    /// If the node already exists with an identical static-dependency set
    /// and no force is requested, it is returned unchanged.  Any difference
    /// in the static set (count or membership), or `force`, marks the node
    /// dirty, drops its cached future and fires an invalidation event.
    pub fn create(
        &self,
        buildable: Box<dyn Buildable>,
        static_deps: &[BuildAlias],
        force: bool,
    ) -> Arc<BuildNode> {
        let alias = buildable.alias();
        let existing = match self.node(&alias) {
            Some(node) => Some((node, buildable)),
            None => {
                // Insert-if-absent; a racing create may beat us to it.
                let mut buildable = Some(buildable);
                let node = self
                    .nodes
                    .entry(alias.clone())
                    .or_insert_with(|| {
                        Arc::new(BuildNode::new(buildable.take().unwrap(), static_deps))
                    })
                    .clone();
                match buildable {
                    None => {
                        self.bump_revision();
                        self.notify(&alias, NodeEvent::Created);
                        return node;
                    }
                    Some(b) => Some((node, b)),
                }
            }
        };
        let (node, buildable) = existing.unwrap();
        if !force && node.static_set_matches(static_deps) {
            return node;
        }
        node.reinitialize(buildable, static_deps);
        self.bump_revision();
        self.notify(&alias, NodeEvent::Invalidated);
        node
    }

    /// Inserts a deserialized node wholesale; used by `db::load`.
    pub(crate) fn insert_node(&self, node: Arc<BuildNode>) {
        self.nodes.insert(node.alias().clone(), node);
    }

    /// Content fingerprint of a buildable's serialized state under the
    /// graph seed.  This is what catches "the node's own configuration
    /// changed even though its dependencies did not".
    pub fn buildable_fingerprint(&self, buildable: &dyn Buildable) -> anyhow::Result<Fingerprint> {
        let mut payload = Vec::new();
        {
            let mut w = ArchiveWriter::new(&mut payload);
            buildable.serialize(&mut w)?;
        }
        Ok(serialize_any_fingerprint(self.options.seed, |w| {
            w.write_str(buildable.type_name());
            w.write_bytes(&payload);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_validation() {
        assert!(BuildAlias::parse("File://a/b.c").is_ok());
        assert!(BuildAlias::parse("").is_err());
        assert!(BuildAlias::parse("no-separator").is_err());
        assert!(BuildAlias::parse("://path").is_err());
        assert!(BuildAlias::parse("Cat://").is_err());
        assert_eq!(BuildAlias::new("File", "x").category(), "File");
    }

    #[test]
    #[should_panic(expected = "degenerate alias")]
    fn empty_alias_panics() {
        BuildAlias::new("", "x");
    }

    #[test]
    fn stamp_validity() {
        assert!(!BuildStamp::zero().is_valid());
        let stamp = BuildStamp {
            mtime: SystemTime::UNIX_EPOCH,
            content: Fingerprint::of_bytes(Fingerprint::ZERO, b"x"),
        };
        assert!(stamp.is_valid());
    }

    #[test]
    fn dep_maps_disjoint() {
        let mut deps = DepMaps::default();
        let a = BuildAlias::new("File", "a");
        deps.insert(DepKind::Static, a.clone(), BuildStamp::zero());
        // Same kind again is a refresh, not a violation.
        deps.insert(DepKind::Static, a.clone(), BuildStamp::zero());
        assert_eq!(deps.kind_of(&a), Some(DepKind::Static));
    }

    #[test]
    #[should_panic(expected = "already declared as static")]
    fn dep_reclassification_panics() {
        let mut deps = DepMaps::default();
        let a = BuildAlias::new("File", "a");
        deps.insert(DepKind::Static, a.clone(), BuildStamp::zero());
        deps.insert(DepKind::Dynamic, a, BuildStamp::zero());
    }

    #[test]
    #[should_panic(expected = "already declared as dynamic")]
    fn dep_output_over_dynamic_panics() {
        let mut deps = DepMaps::default();
        let a = BuildAlias::new("File", "a");
        deps.insert(DepKind::Dynamic, a.clone(), BuildStamp::zero());
        deps.insert(DepKind::Output, a, BuildStamp::zero());
    }
}
