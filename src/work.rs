//! Build execution: single-flight launch, the rebuild decision procedure,
//! and the context handed to a `Buildable::build` call.
//!
//! The primary correctness property is at-most-once execution per node: a
//! second concurrent request for the same alias is served the in-flight
//! future rather than a duplicate execution.

use crate::fs::{FileSystem, MTime};
use crate::graph::{
    BuildAlias, BuildGraph, BuildNode, BuildStamp, Buildable, DepKind, NodeEvent,
};
use crate::future::Future;
use crate::hash::Fingerprint;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, error};

/// What a resolved build hands to its dependents.
#[derive(Clone, Debug)]
pub struct BuildResult {
    pub stamp: BuildStamp,
    /// False when `need_to_build` decided the node was already up to date.
    pub rebuilt: bool,
}

pub type BuildOutcome = Result<BuildResult, BuildError>;

/// Build failures carry the dependency kind so a caller can tell "my input
/// is broken" apart from "my own logic is broken".  `Failed` is logged once
/// at its origin; `Dependency` wrappers are not re-logged as the failure
/// fans out to dependents.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BuildError {
    #[error("{kind} dependency {alias} failed")]
    Dependency { kind: DepKind, alias: BuildAlias },
    #[error("no node registered for dependency {0}")]
    MissingNode(BuildAlias),
    #[error("build of {alias} failed: {message}")]
    Failed { alias: BuildAlias, message: String },
}

/// One link in the "who is building whom" chain.
struct CallLink {
    alias: BuildAlias,
    parent: Option<Arc<CallLink>>,
}

#[derive(Clone, Default)]
pub struct BuildOptions {
    /// Rebuild even if the node appears up to date.
    pub force: bool,
    caller: Option<Arc<CallLink>>,
}

impl BuildOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forced() -> Self {
        BuildOptions {
            force: true,
            caller: None,
        }
    }

    /// Options for work launched from inside `alias`'s execution: the chain
    /// grows by one link and `force` is chosen by the call site.
    fn within(&self, alias: &BuildAlias, force: bool) -> BuildOptions {
        BuildOptions {
            force,
            caller: Some(Arc::new(CallLink {
                alias: alias.clone(),
                parent: self.caller.clone(),
            })),
        }
    }

    fn chain_contains(&self, alias: &BuildAlias) -> bool {
        let mut link = self.caller.as_deref();
        while let Some(l) = link {
            if l.alias == *alias {
                return true;
            }
            link = l.parent.as_deref();
        }
        false
    }

    /// The chain, outermost caller first.
    fn chain(&self) -> Vec<BuildAlias> {
        let mut chain = Vec::new();
        let mut link = self.caller.as_deref();
        while let Some(l) = link {
            chain.push(l.alias.clone());
            link = l.parent.as_deref();
        }
        chain.reverse();
        chain
    }
}

fn cycle_panic(opts: &BuildOptions, target: &BuildAlias) -> ! {
    let mut chain = opts.chain();
    chain.push(target.clone());
    let rendered: Vec<&str> = chain.iter().map(|a| a.as_str()).collect();
    panic!("cyclic build graph detected:\n  {}", rendered.join("\n  -> "));
}

/// Content stamp of a file on disk: mtime from stat, fingerprint from
/// content.  `None` means the file is absent.
pub(crate) fn digest_file(graph: &BuildGraph, path: &Path) -> anyhow::Result<Option<BuildStamp>> {
    let stat = graph.fs().stat(path)?;
    let mtime = match stat.mtime {
        MTime::Missing => return Ok(None),
        MTime::Stamp(t) => t,
    };
    let content = graph.fs().read(path)?;
    Ok(Some(BuildStamp {
        mtime,
        content: Fingerprint::of_bytes(graph.seed(), &content),
    }))
}

impl BuildGraph {
    /// Looks up the node for `alias` and launches (or reuses) its build.
    pub fn build(
        self: &Arc<Self>,
        alias: &BuildAlias,
        options: &BuildOptions,
    ) -> anyhow::Result<(Arc<BuildNode>, Future<BuildOutcome>)> {
        let node = self
            .node(alias)
            .ok_or_else(|| anyhow::anyhow!("unknown alias {}", alias))?;
        let fut = self.launch(&node, options);
        Ok((node, fut))
    }

    /// Single-flight: when a future already exists for the node and no force
    /// is requested, it is returned unchanged.
    pub(crate) fn launch(
        self: &Arc<Self>,
        node: &Arc<BuildNode>,
        options: &BuildOptions,
    ) -> Future<BuildOutcome> {
        if options.chain_contains(node.alias()) {
            cycle_panic(options, node.alias());
        }
        let mut flight = node.flight.lock().unwrap();
        if let Some(fut) = flight.as_ref() {
            if !options.force {
                return fut.clone();
            }
        }
        let graph = self.clone();
        let target = node.clone();
        let exec_opts = options.within(node.alias(), options.force);
        let work = move || execute_node(&graph, &target, &exec_opts);
        let fut = if self.concurrent() {
            Future::spawn(work)
        } else {
            Future::lazy(work)
        };
        *flight = Some(fut.clone());
        fut
    }
}

/// The decision procedure plus the build itself; runs inside the node's
/// single-flight future.
fn execute_node(graph: &Arc<BuildGraph>, node: &Arc<BuildNode>, opts: &BuildOptions) -> BuildOutcome {
    let (stamp, statics, dynamics, outputs) = {
        let inner = node.inner.read().unwrap();
        (
            inner.stamp,
            inner.deps.statics.clone(),
            inner.deps.dynamics.clone(),
            inner.deps.outputs.clone(),
        )
    };

    let mut need = opts.force;
    let mut resolved: Vec<(DepKind, BuildAlias, BuildStamp)> = Vec::new();

    if statics.is_empty() && dynamics.is_empty() && outputs.is_empty() {
        // A node with no dependencies at all is a root probe (e.g. a live
        // filesystem stat); it is always rebuilt.
        need = true;
    } else {
        // Fan out every static and dynamic dependency in parallel through
        // the same single-flight mechanism.
        let dep_opts = BuildOptions {
            force: false,
            caller: opts.caller.clone(),
        };
        let mut pending: Vec<(DepKind, BuildAlias, BuildStamp, Future<BuildOutcome>)> = Vec::new();
        for (kind, map) in [(DepKind::Static, &statics), (DepKind::Dynamic, &dynamics)] {
            for (alias, recorded) in map {
                if opts.chain_contains(alias) {
                    // The dependency is an ancestor currently mid-build.
                    // For a forced build (the output back-edge pattern)
                    // its new stamp is recorded by the ancestor's own
                    // commit; anything else is a real cycle.
                    if opts.force {
                        continue;
                    }
                    cycle_panic(opts, alias);
                }
                let dep = match graph.node(alias) {
                    Some(dep) => dep,
                    None => return Err(BuildError::MissingNode(alias.clone())),
                };
                let fut = graph.launch(&dep, &dep_opts);
                pending.push((kind, alias.clone(), *recorded, fut));
            }
        }

        // Outputs are special-cased: their digest comes from a direct stat,
        // never a recursive rebuild, to avoid a build-output-build loop.
        for (alias, recorded) in &outputs {
            match current_output_stamp(graph, alias) {
                // mtime is informational only; a touched-but-identical
                // output does not count as modified.
                Ok(Some(current)) if current.content == recorded.content => {}
                Ok(Some(_)) => need = true,
                Ok(None) => {
                    // A missing output forces a rebuild to regenerate it.
                    debug!(alias = %node.alias(), output = %alias, "output missing, rebuilding");
                    need = true;
                }
                Err(err) => {
                    error!(alias = %node.alias(), output = %alias, error = %err, "output probe failed");
                    return Err(BuildError::Dependency {
                        kind: DepKind::Output,
                        alias: alias.clone(),
                    });
                }
            }
        }

        for (kind, alias, recorded, fut) in pending {
            match fut.join() {
                // The origin already logged this failure; a failed input
                // suppresses our own rebuild.
                Err(_) => return Err(BuildError::Dependency { kind, alias }),
                Ok(res) => {
                    if res.stamp.content != recorded.content {
                        need = true;
                    }
                    resolved.push((kind, alias, res.stamp));
                }
            }
        }

        if !need {
            // No dependency changed; the node's own serialized configuration
            // may still have.
            match node.with_buildable(|b| graph.buildable_fingerprint(b)) {
                Ok(current) => {
                    if current != stamp.content {
                        need = true;
                    }
                }
                Err(err) => {
                    error!(alias = %node.alias(), error = %err, "fingerprint failed");
                    return Err(BuildError::Failed {
                        alias: node.alias().clone(),
                        message: format!("{:#}", err),
                    });
                }
            }
        }
    }

    if !need {
        debug!(alias = %node.alias(), "up to date");
        return Ok(BuildResult {
            stamp,
            rebuilt: false,
        });
    }

    let mut ctx = ExecuteContext {
        graph,
        alias: node.alias().clone(),
        opts: opts.clone(),
        dynamics: BTreeMap::new(),
        outputs: BTreeMap::new(),
        timestamp: None,
    };

    let mut inner = node.inner.write().unwrap();
    match inner.buildable.build(&mut ctx) {
        Ok(()) => {}
        Err(err) => {
            // Log once, at the origin; the prior stamp stays untouched.
            error!(alias = %node.alias(), error = format!("{:#}", err), "build failed");
            return Err(BuildError::Failed {
                alias: node.alias().clone(),
                message: format!("{:#}", err),
            });
        }
    }

    let content = match graph.buildable_fingerprint(inner.buildable.as_ref()) {
        Ok(fp) => fp,
        Err(err) => {
            error!(alias = %node.alias(), error = %err, "fingerprint failed");
            return Err(BuildError::Failed {
                alias: node.alias().clone(),
                message: format!("{:#}", err),
            });
        }
    };
    let new_stamp = BuildStamp {
        mtime: ctx.timestamp.unwrap_or_else(SystemTime::now),
        content,
    };

    // Commit dependency bookkeeping: static stamps refresh in place,
    // dynamic and output edges are replaced by what this build discovered.
    let mut new_deps = crate::graph::DepMaps::default();
    for (alias, stamp) in &inner.deps.statics {
        new_deps.insert(DepKind::Static, alias.clone(), *stamp);
    }
    for (kind, alias, stamp) in resolved {
        if kind == DepKind::Static {
            new_deps.insert(DepKind::Static, alias, stamp);
        }
    }
    for (alias, stamp) in ctx.dynamics {
        if new_deps.statics.contains_key(&alias) {
            // Re-declared while building; refresh the static stamp instead
            // of reclassifying.
            new_deps.insert(DepKind::Static, alias, stamp);
        } else {
            new_deps.insert(DepKind::Dynamic, alias, stamp);
        }
    }
    for (alias, stamp) in ctx.outputs {
        new_deps.insert(DepKind::Output, alias, stamp);
    }

    // A recommit of identical state (a re-statted probe whose file did not
    // change) leaves the graph clean, so a no-op rerun needs no save.
    let changed = inner.stamp != new_stamp || inner.deps != new_deps;
    inner.stamp = new_stamp;
    inner.deps = new_deps;
    drop(inner);

    if changed {
        graph.bump_revision();
    }
    graph.notify(node.alias(), NodeEvent::Built);
    debug!(alias = %node.alias(), "rebuilt");
    Ok(BuildResult {
        stamp: new_stamp,
        rebuilt: true,
    })
}

/// Current stamp of an output dependency: file outputs are stat-digested,
/// node outputs read their recorded stamp.
fn current_output_stamp(
    graph: &Arc<BuildGraph>,
    alias: &BuildAlias,
) -> anyhow::Result<Option<BuildStamp>> {
    if alias.category() == crate::units::FILE_CATEGORY {
        return digest_file(graph, Path::new(crate::units::alias_path(alias)));
    }
    Ok(graph
        .node(alias)
        .map(|node| node.build_stamp())
        .filter(|stamp| stamp.is_valid()))
}

/// The file identity + content pair the action cache is built on.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FileDigest {
    pub source: PathBuf,
    pub digest: Fingerprint,
}

/// Handed to `Buildable::build`; declares dynamic dependencies and outputs
/// as they are discovered, resolving each through the same single-flight
/// machinery as top-level builds.
pub struct ExecuteContext<'a> {
    graph: &'a Arc<BuildGraph>,
    alias: BuildAlias,
    opts: BuildOptions,
    dynamics: BTreeMap<BuildAlias, BuildStamp>,
    outputs: BTreeMap<BuildAlias, BuildStamp>,
    timestamp: Option<SystemTime>,
}

impl<'a> ExecuteContext<'a> {
    pub fn graph(&self) -> &Arc<BuildGraph> {
        self.graph
    }

    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        self.graph.fs()
    }

    /// The alias currently being built.
    pub fn alias(&self) -> &BuildAlias {
        &self.alias
    }

    /// Stat + content-digest a file without declaring a dependency on it.
    pub fn digest_file(&self, path: &Path) -> anyhow::Result<Option<BuildStamp>> {
        digest_file(self.graph, path)
    }

    /// Override the node's recorded modification time (e.g. to the probed
    /// file's own mtime, so an unchanged file is not mistaken for modified
    /// between runs).
    pub fn timestamp(&mut self, t: SystemTime) {
        self.timestamp = Some(t);
    }

    /// Registers dynamic dependencies on already-known aliases and resolves
    /// them, blocking until each is built.
    pub fn depends_on(&mut self, aliases: &[BuildAlias]) -> anyhow::Result<()> {
        for alias in aliases {
            let node = self
                .graph
                .node(alias)
                .ok_or_else(|| BuildError::MissingNode(alias.clone()))?;
            let stamp = self.resolve_dynamic(&node)?;
            self.dynamics.insert(alias.clone(), stamp);
        }
        Ok(())
    }

    /// Declares and resolves a dynamic dependency on a file, returning its
    /// content digest.
    pub fn need_file(&mut self, path: &Path) -> anyhow::Result<FileDigest> {
        let unit = crate::units::FileUnit::new(path);
        let node = self.graph.create(Box::new(unit), &[], false);
        let stamp = self.resolve_dynamic(&node)?;
        self.dynamics.insert(node.alias().clone(), stamp);
        let digest = node
            .with_buildable(|b| {
                b.as_any()
                    .downcast_ref::<crate::units::FileUnit>()
                    .map(|u| u.digest())
            })
            .ok_or_else(|| anyhow::anyhow!("alias {} is not a file probe", node.alias()))?;
        Ok(FileDigest {
            source: path.to_path_buf(),
            digest,
        })
    }

    /// Declares and resolves a dynamic dependency on a directory listing.
    pub fn need_directory(&mut self, path: &Path, pattern: &str) -> anyhow::Result<BuildStamp> {
        let unit = crate::units::DirectoryUnit::new(path, pattern);
        self.need_buildable(Box::new(unit))
    }

    /// Declares and resolves a dynamic dependency on an arbitrary buildable,
    /// creating its node if absent.
    pub fn need_buildable(&mut self, buildable: Box<dyn Buildable>) -> anyhow::Result<BuildStamp> {
        let node = self.graph.create(buildable, &[], false);
        let stamp = self.resolve_dynamic(&node)?;
        self.dynamics.insert(node.alias().clone(), stamp);
        Ok(stamp)
    }

    /// Like [`need_buildable`](Self::need_buildable), but the factory is
    /// consulted only when no node exists for the alias yet.
    pub fn need_factory(
        &mut self,
        alias: &BuildAlias,
        factory: impl FnOnce() -> Box<dyn Buildable>,
    ) -> anyhow::Result<BuildStamp> {
        let node = match self.graph.node(alias) {
            Some(node) => node,
            None => self.graph.create(factory(), &[], false),
        };
        let stamp = self.resolve_dynamic(&node)?;
        self.dynamics.insert(alias.clone(), stamp);
        Ok(stamp)
    }

    /// Registers a file this build produced.  The file gets its own node
    /// with a forced rebuild and a static back-edge to the producer, and is
    /// tracked as an output dependency.
    pub fn output_file(&mut self, path: &Path) -> anyhow::Result<FileDigest> {
        let unit = crate::units::FileUnit::new(path);
        let back_edge = [self.alias.clone()];
        let node = self.graph.create(Box::new(unit), &back_edge, false);
        // When the file's node is an ancestor currently mid-build (a
        // consumer probed the file, which triggered this producer), joining
        // it would deadlock; the ancestor commits its own stamp from the
        // file we just wrote.  Either way the recorded output stamp is the
        // raw content digest, since output revalidation stat-digests the
        // file directly instead of rebuilding its node.
        let stamp = if self.opts.chain_contains(node.alias()) {
            digest_file(self.graph, path)?
                .ok_or_else(|| anyhow::anyhow!("output not found: {}", path.display()))?
        } else {
            self.resolve_forced(&node, DepKind::Output)?;
            let digest = node
                .with_buildable(|b| {
                    b.as_any()
                        .downcast_ref::<crate::units::FileUnit>()
                        .map(|u| u.digest())
                })
                .ok_or_else(|| anyhow::anyhow!("alias {} is not a file probe", node.alias()))?;
            BuildStamp {
                mtime: node.build_stamp().mtime,
                content: digest,
            }
        };
        self.outputs.insert(node.alias().clone(), stamp);
        Ok(FileDigest {
            source: path.to_path_buf(),
            digest: stamp.content,
        })
    }

    /// Registers a sub-node this build produced.
    pub fn output_node(&mut self, buildable: Box<dyn Buildable>) -> anyhow::Result<BuildStamp> {
        let back_edge = [self.alias.clone()];
        let node = self.graph.create(buildable, &back_edge, false);
        let stamp = self.resolve_forced(&node, DepKind::Output)?;
        self.outputs.insert(node.alias().clone(), stamp);
        Ok(stamp)
    }

    fn resolve_dynamic(&self, node: &Arc<BuildNode>) -> anyhow::Result<BuildStamp> {
        let fut = self.graph.launch(node, &BuildOptions {
            force: false,
            caller: self.opts.caller.clone(),
        });
        match fut.join() {
            Ok(res) => Ok(res.stamp),
            Err(_) => Err(BuildError::Dependency {
                kind: DepKind::Dynamic,
                alias: node.alias().clone(),
            }
            .into()),
        }
    }

    fn resolve_forced(&self, node: &Arc<BuildNode>, kind: DepKind) -> anyhow::Result<BuildStamp> {
        let fut = self.graph.launch(node, &BuildOptions {
            force: true,
            caller: self.opts.caller.clone(),
        });
        match fut.join() {
            Ok(res) => Ok(res.stamp),
            Err(_) => Err(BuildError::Dependency {
                kind,
                alias: node.alias().clone(),
            }
            .into()),
        }
    }
}
