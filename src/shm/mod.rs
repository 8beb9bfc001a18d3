//! Node-shared dataset buffer
//!
//! One segment per node group holds the whole dataset. Access is split by
//! capability:
//!
//! - [`OwnerBuffer`]: held by the node owner; can write the slots, cannot read them
//! - [`AttachedBuffer`]: held by every other member; no data access at all
//! - [`SharedView`]: read-only, obtainable from either buffer only with a
//!   [`Published`] token
//!
//! A `Published` token is only produced by [`publish`], the node-wide barrier
//! that follows population, so no member can read the segment before its owner
//! has finished writing it.
//!
//! Segments are files in a shared-memory directory (see [`default_shm_dir`]).
//! The owner unlinks the file as soon as the barrier has passed; the mappings
//! stay valid until the views are dropped.

pub mod mapping;

use crate::distributed::{collective, CommError, Communicator};
use crate::topology::Role;
use crate::Result;
use anyhow::Context;
use mapping::Mapping;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Directory for shared segments
///
/// `/dev/shm` when present (tmpfs on Linux), otherwise the system temp directory.
pub fn default_shm_dir() -> PathBuf {
    let dev_shm = Path::new("/dev/shm");
    if dev_shm.is_dir() {
        dev_shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

/// Proof that a node group passed its publication barrier
#[derive(Debug)]
pub struct Published {
    group: String,
}

/// Publication barrier on the node group
///
/// Every member calls this once the owner has populated the buffer.
pub fn publish(node: &dyn Communicator) -> std::result::Result<Published, CommError> {
    node.barrier()?;
    Ok(Published {
        group: node.group_id().to_string(),
    })
}

/// Backing file of a segment, removed when dropped
struct SegmentFile {
    path: PathBuf,
}

impl Drop for SegmentFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove shared segment {}: {}", self.path.display(), e);
            }
        }
    }
}

/// The node owner's handle: write access, no reads
pub struct OwnerBuffer {
    mapping: Mapping,
    file: Option<SegmentFile>,
    group: String,
    populated: bool,
}

impl OwnerBuffer {
    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|f| f.path.as_path())
    }

    /// Copy the dataset into the segment
    ///
    /// `values` must have exactly the length the buffer was allocated with. The
    /// buffer is written once; a second call is an error.
    pub fn populate(&mut self, values: &[f64]) -> Result<()> {
        if self.populated {
            anyhow::bail!("Shared buffer of group '{}' is already populated", self.group);
        }
        if values.len() != self.len() {
            anyhow::bail!(
                "Dataset has {} values but the shared buffer of group '{}' holds {}",
                values.len(),
                self.group,
                self.len()
            );
        }
        self.mapping.as_mut_slice()?.copy_from_slice(values);
        self.populated = true;
        Ok(())
    }
}

/// A non-owner's handle: attached to the owner's segment, no data access
pub struct AttachedBuffer {
    mapping: Mapping,
    group: String,
}

impl AttachedBuffer {
    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }
}

/// What allocation handed this member
pub enum NodeBuffer {
    Owner(OwnerBuffer),
    Attached(AttachedBuffer),
}

impl NodeBuffer {
    pub fn len(&self) -> usize {
        match self {
            NodeBuffer::Owner(buf) => buf.len(),
            NodeBuffer::Attached(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn group(&self) -> &str {
        match self {
            NodeBuffer::Owner(buf) => &buf.group,
            NodeBuffer::Attached(buf) => &buf.group,
        }
    }

    /// Exchange the buffer for a read-only view
    ///
    /// The token must come from this buffer's node group. On the owner this
    /// unlinks the backing file.
    pub fn into_view(self, token: &Published) -> Result<SharedView> {
        if token.group != self.group() {
            anyhow::bail!(
                "Publication token of group '{}' does not cover the buffer of group '{}'",
                token.group,
                self.group()
            );
        }

        let mapping = match self {
            NodeBuffer::Owner(buf) => {
                if !buf.populated {
                    anyhow::bail!("Shared buffer of group '{}' was published unpopulated", buf.group);
                }
                // Dropping the file unlinks it; attached members mapped it before the barrier
                drop(buf.file);
                buf.mapping
            }
            NodeBuffer::Attached(buf) => buf.mapping,
        };
        Ok(SharedView { mapping })
    }

    /// Pass the publication barrier and obtain the view in one step
    ///
    /// An owner that has not populated its buffer fails before the barrier, so
    /// the caller can abort peers that would otherwise wait in it.
    pub fn publish(self, node: &dyn Communicator) -> Result<SharedView> {
        if let NodeBuffer::Owner(ref buf) = self {
            if !buf.populated {
                anyhow::bail!("Shared buffer of group '{}' must be populated before publishing", buf.group);
            }
        }
        let token = publish(node)?;
        self.into_view(&token)
    }
}

/// Read-only view of a published node buffer
///
/// `Sync`, so a thread pool can read disjoint ranges concurrently.
pub struct SharedView {
    mapping: Mapping,
}

impl SharedView {
    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        self.mapping.as_slice()
    }

    /// Values in `range`; out-of-bounds ranges are an error
    pub fn slice(&self, range: Range<usize>) -> Result<&[f64]> {
        self.as_slice().get(range.clone()).with_context(|| {
            format!(
                "Range {}..{} outside shared buffer of {} values",
                range.start,
                range.end,
                self.len()
            )
        })
    }
}

/// Allocate (owner) or attach to (everyone else) the node group's buffer
///
/// Collective over `node`. Every member must pass the same `len`. The owner
/// creates the segment in `dir` and broadcasts its path; members attach to it
/// read-only. A failed creation is returned to the owner, whose caller is
/// expected to abort the run so attaching members do not stay blocked.
pub fn allocate_shared(node: &dyn Communicator, role: Role, len: usize, dir: &Path) -> Result<NodeBuffer> {
    let is_owner = node.rank() == 0;
    if is_owner != role.owns_node_buffer() {
        anyhow::bail!(
            "Role {} does not match node-local rank {} in group '{}'",
            role,
            node.rank(),
            node.group_id()
        );
    }

    let group = node.group_id().to_string();

    if is_owner {
        let (mapping, file) = if len == 0 {
            (Mapping::empty(), None)
        } else {
            let path = dir.join(segment_name(&group));
            let mapping = Mapping::create(&path, len)?;
            (mapping, Some(SegmentFile { path }))
        };
        let path = file.as_ref().map(|f| f.path.to_string_lossy().into_owned());

        collective::broadcast(node, 0, Some(&(len as u64, path)))
            .context("Failed to announce shared segment")?;

        tracing::debug!(group = %group, len, path = ?file.as_ref().map(|f| &f.path), "Allocated shared buffer");

        Ok(NodeBuffer::Owner(OwnerBuffer {
            mapping,
            file,
            group,
            populated: len == 0,
        }))
    } else {
        let (owner_len, path): (u64, Option<String>) =
            collective::broadcast(node, 0, None).context("Failed to receive shared segment")?;

        if owner_len != len as u64 {
            anyhow::bail!(
                "Shared buffer length disagrees in group '{}': owner allocated {}, member expected {}",
                group,
                owner_len,
                len
            );
        }

        let mapping = match path {
            Some(path) => Mapping::open(Path::new(&path), len)?,
            None if len == 0 => Mapping::empty(),
            None => anyhow::bail!("Owner of group '{}' announced no segment for {} values", group, len),
        };

        tracing::debug!(group = %group, len, "Attached to shared buffer");

        Ok(NodeBuffer::Attached(AttachedBuffer { mapping, group }))
    }
}

/// File name of a new segment, unique per process, group and instant
fn segment_name(group: &str) -> String {
    let sanitized: String = group
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("shmreduce-{}-{}-{}", std::process::id(), sanitized, nanos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::LocalCluster;
    use crate::topology::resolve_node_groups;
    use tempfile::TempDir;

    #[test]
    fn test_segment_name_is_path_safe() {
        let name = segment_name("world/1.0");
        assert!(name.starts_with(&format!("shmreduce-{}-world_1.0-", std::process::id())));
        assert!(!name.contains('/'));
    }

    #[test]
    fn test_members_read_owner_values_after_publish() {
        let dir = TempDir::new().unwrap();
        let cluster = LocalCluster::new(15, 5).unwrap();

        let results = cluster
            .run(|comm, node_id| {
                let topo = resolve_node_groups(&comm, &node_id)?;
                let mut buffer = allocate_shared(topo.node.as_ref(), topo.role, 3, dir.path())?;
                if let NodeBuffer::Owner(ref mut owner) = buffer {
                    owner.populate(&[1.0, 2.0, 3.0])?;
                }
                let view = buffer.publish(topo.node.as_ref())?;
                Ok(view.as_slice()[1])
            })
            .unwrap();

        assert_eq!(results, vec![2.0; 15]);
        // Owners unlink their segments once published
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_empty_dataset_allocates_nothing() {
        let dir = TempDir::new().unwrap();
        let cluster = LocalCluster::new(3, 1).unwrap();

        let results = cluster
            .run(|comm, node_id| {
                let topo = resolve_node_groups(&comm, &node_id)?;
                let buffer = allocate_shared(topo.node.as_ref(), topo.role, 0, dir.path())?;
                let view = buffer.publish(topo.node.as_ref())?;
                Ok(view.len())
            })
            .unwrap();

        assert_eq!(results, vec![0, 0, 0]);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_unpopulated_owner_fails_before_barrier() {
        let dir = TempDir::new().unwrap();
        let cluster = LocalCluster::new(2, 1).unwrap();

        let err = cluster
            .run(|comm, node_id| {
                let topo = resolve_node_groups(&comm, &node_id)?;
                let buffer = allocate_shared(topo.node.as_ref(), topo.role, 2, dir.path())?;
                buffer.publish(topo.node.as_ref())?;
                Ok(())
            })
            .unwrap_err();

        assert!(format!("{:#}", err).contains("must be populated"));
        // The failed owner's segment is removed with its buffer
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_populate_checks_length_and_is_single_shot() {
        let dir = TempDir::new().unwrap();
        let cluster = LocalCluster::new(1, 1).unwrap();

        cluster
            .run(|comm, node_id| {
                let topo = resolve_node_groups(&comm, &node_id)?;
                let buffer = allocate_shared(topo.node.as_ref(), topo.role, 2, dir.path())?;
                let NodeBuffer::Owner(mut owner) = buffer else {
                    anyhow::bail!("single member must own the buffer");
                };
                assert!(owner.path().unwrap().exists());
                assert!(owner.populate(&[1.0]).is_err());
                owner.populate(&[1.0, 2.0])?;
                assert!(owner.populate(&[1.0, 2.0]).is_err());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_token_from_other_group_is_rejected() {
        let dir = TempDir::new().unwrap();
        let cluster = LocalCluster::new(1, 1).unwrap();

        cluster
            .run(|comm, node_id| {
                let topo = resolve_node_groups(&comm, &node_id)?;
                let mut buffer = allocate_shared(topo.node.as_ref(), topo.role, 1, dir.path())?;
                if let NodeBuffer::Owner(ref mut owner) = buffer {
                    owner.populate(&[4.0])?;
                }

                let world_token = publish(&comm)?;
                assert!(buffer.into_view(&world_token).is_err());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_role_must_match_node_rank() {
        let dir = TempDir::new().unwrap();
        let cluster = LocalCluster::new(1, 1).unwrap();

        let err = cluster
            .run(|comm, _| Ok(allocate_shared(&comm, Role::Worker, 1, dir.path()).map(|_| ())?))
            .unwrap_err();
        assert!(format!("{:#}", err).contains("does not match"));
    }

    #[test]
    fn test_view_slice_bounds() {
        let dir = TempDir::new().unwrap();
        let cluster = LocalCluster::new(1, 1).unwrap();

        let sums = cluster
            .run(|comm, node_id| {
                let topo = resolve_node_groups(&comm, &node_id)?;
                let mut buffer = allocate_shared(topo.node.as_ref(), topo.role, 4, dir.path())?;
                if let NodeBuffer::Owner(ref mut owner) = buffer {
                    owner.populate(&[1.0, 2.0, 3.0, 4.0])?;
                }
                let view = buffer.publish(topo.node.as_ref())?;
                assert!(view.slice(3..5).is_err());
                assert!(view.slice(4..4)?.is_empty());
                Ok(view.slice(1..3)?.iter().sum::<f64>())
            })
            .unwrap();

        assert_eq!(sums, vec![5.0]);
    }
}
