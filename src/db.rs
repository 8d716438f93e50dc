//! Build-graph persistence: the whole node map in one binary archive.
//!
//! The archive starts with the format header (magic, version, feature tags)
//! and then one record per node: alias, type GUID + payload, stamp, and the
//! three dependency maps.  Saving is skipped entirely when the graph is not
//! dirty; writing goes through the atomic-replace contract so a crash never
//! leaves a half-written graph behind.

use crate::fs::FileSystem;
use crate::graph::{BuildAlias, BuildGraph, BuildNode, BuildStamp, DepKind, GraphOptions};
use crate::serial::{read_header, write_header, ArchiveReader, ArchiveWriter, Registry};
use anyhow::{bail, Context};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

const DEP_KINDS: [DepKind; 3] = [DepKind::Static, DepKind::Dynamic, DepKind::Output];

/// Serializes the graph to `path`.  Returns false (and writes nothing) when
/// the graph has not changed since the last save or load.
pub fn save(graph: &BuildGraph, registry: &Registry, path: &Path) -> anyhow::Result<bool> {
    if !graph.dirty() {
        debug!(path = %path.display(), "graph unchanged, skipping save");
        return Ok(false);
    }

    let mut buf = Vec::new();
    {
        let mut w = ArchiveWriter::new(&mut buf);
        write_header(&mut w, &registry.feature_tags())?;
        let nodes = graph.sorted_nodes();
        w.write_u32(nodes.len() as u32)?;
        for node in nodes {
            write_node(&mut w, graph, registry, &node)
                .with_context(|| format!("serialize node {}", node.alias()))?;
        }
    }
    graph
        .fs()
        .write(path, &buf)
        .with_context(|| format!("write graph archive {}", path.display()))?;
    graph.mark_saved();
    debug!(path = %path.display(), nodes = graph.len(), "graph saved");
    Ok(true)
}

fn write_node(
    w: &mut ArchiveWriter,
    graph: &BuildGraph,
    registry: &Registry,
    node: &Arc<BuildNode>,
) -> anyhow::Result<()> {
    let inner = node.inner.read().unwrap();
    let type_name = inner.buildable.type_name();
    let guid = match registry.guid_of(type_name) {
        Some(guid) => guid,
        None => bail!("buildable type {:?} is not registered", type_name),
    };
    w.write_str(node.alias().as_str())?;
    w.write_guid(guid)?;
    let mut payload = Vec::new();
    inner
        .buildable
        .serialize(&mut ArchiveWriter::new(&mut payload))?;
    w.write_bytes(&payload)?;
    write_stamp(w, &inner.stamp)?;
    for kind in DEP_KINDS {
        let map = match kind {
            DepKind::Static => &inner.deps.statics,
            DepKind::Dynamic => &inner.deps.dynamics,
            DepKind::Output => &inner.deps.outputs,
        };
        w.write_u32(map.len() as u32)?;
        for (alias, stamp) in map {
            w.write_str(alias.as_str())?;
            write_stamp(w, stamp)?;
        }
    }
    Ok(())
}

fn write_stamp(w: &mut ArchiveWriter, stamp: &BuildStamp) -> std::io::Result<()> {
    w.write_time(stamp.mtime)?;
    w.write_fingerprint(&stamp.content)
}

fn read_stamp(r: &mut ArchiveReader) -> std::io::Result<BuildStamp> {
    Ok(BuildStamp {
        mtime: r.read_time()?,
        content: r.read_fingerprint()?,
    })
}

/// Loads a persisted graph, or returns an empty one when no archive exists.
/// Corrupt magic, a newer version, or an unregistered type are hard errors
/// rather than silent misreads.
pub fn open(
    fs: Arc<dyn FileSystem>,
    options: GraphOptions,
    registry: &Registry,
    path: &Path,
) -> anyhow::Result<BuildGraph> {
    let bytes = match fs.read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no graph archive, starting empty");
            return Ok(BuildGraph::new(fs, options));
        }
        Err(err) => {
            return Err(err).with_context(|| format!("read graph archive {}", path.display()))
        }
    };

    let mut cur = &bytes[..];
    let mut r = ArchiveReader::new(&mut cur);
    let tags =
        read_header(&mut r).with_context(|| format!("graph archive {}", path.display()))?;

    let graph = BuildGraph::new(fs, options);
    let count = r.read_u32().context("read node count")?;
    for _ in 0..count {
        let node = read_node(&mut r, registry).context("read node record")?;
        graph.insert_node(Arc::new(node));
    }

    if tags != registry.feature_tags() {
        // The registered feature set changed since this archive was written;
        // make sure the next save is not skipped.
        debug!(path = %path.display(), "feature tags changed, marking graph dirty");
        graph.mark_unsaved();
    }
    debug!(path = %path.display(), nodes = graph.len(), "graph loaded");
    Ok(graph)
}

fn read_node(r: &mut ArchiveReader, registry: &Registry) -> anyhow::Result<BuildNode> {
    let alias = BuildAlias::parse(&r.read_str()?)?;
    let guid = r.read_guid()?;
    let payload = r.read_bytes()?;
    let mut cur = &payload[..];
    let buildable = registry.deserialize(guid, &mut ArchiveReader::new(&mut cur))?;
    if buildable.alias() != alias {
        bail!(
            "node record for {} deserialized to alias {}",
            alias,
            buildable.alias()
        );
    }
    let stamp = read_stamp(r)?;
    let mut deps = crate::graph::DepMaps::default();
    for kind in DEP_KINDS {
        let count = r.read_u32()?;
        for _ in 0..count {
            let dep = BuildAlias::parse(&r.read_str()?)?;
            let dep_stamp = read_stamp(r)?;
            deps.insert(kind, dep, dep_stamp);
        }
    }
    Ok(BuildNode::restored(buildable, stamp, deps))
}
