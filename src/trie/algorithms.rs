//! `find` and `upsert` (C4, §4.4): the core trie walk and batch-update
//! algorithms. `commit` (§4.4.3) is one layer up, in [`crate::db`], since it
//! needs the metadata block (C6) which this module does not depend on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::chunk::pool::Ring;
use crate::error::Result;
use crate::node::codec::{hash_node, ChildRecord, Node};
use crate::trie::cursor::{FindOutcome, FindResult, NodeCursor};
use crate::trie::requests::Requests;
use crate::trie::store::NodeStore;
use crate::trie::update::Update;

/// Walks from `root` consuming `key_nibbles`, per §4.4.1. Returns `Err` only
/// for genuine I/O/corruption failures; every structural outcome (mismatch,
/// missing branch, expiry, success) is carried in the returned
/// [`FindResult`], including the cursor at the point the walk stopped —
/// `upsert`'s structural-repair path depends on that partial cursor.
pub fn find(
    store: &NodeStore,
    min_version: &AtomicU64,
    root: NodeCursor,
    key_nibbles: &[u8],
    version: u64,
) -> Result<FindResult> {
    if version < min_version.load(Ordering::Acquire) {
        return Ok(FindResult {
            cursor: root,
            outcome: FindOutcome::VersionExpired,
        });
    }
    let mut node = match root.node.clone() {
        Some(n) => n,
        None => {
            return Ok(FindResult {
                cursor: root,
                outcome: FindOutcome::RootIsNull,
            })
        }
    };
    let mut prefix_index = root.prefix_index;

    loop {
        let path_matches = prefix_index + node.path.len() <= key_nibbles.len()
            && node
                .path
                .iter()
                .enumerate()
                .all(|(i, &nib)| key_nibbles[prefix_index + i] == nib);
        if !path_matches {
            return Ok(FindResult {
                cursor: NodeCursor {
                    node: Some(node),
                    prefix_index,
                },
                outcome: FindOutcome::KeyMismatch { prefix_index },
            });
        }
        prefix_index += node.path.len();

        if prefix_index == key_nibbles.len() {
            let outcome = match &node.value {
                Some(v) => FindOutcome::Success(v.clone()),
                None => FindOutcome::KeyEndsInsideNode { prefix_index },
            };
            return Ok(FindResult {
                cursor: NodeCursor {
                    node: Some(node),
                    prefix_index,
                },
                outcome,
            });
        }

        let nibble = key_nibbles[prefix_index];
        if !node.has_child(nibble) {
            return Ok(FindResult {
                cursor: NodeCursor {
                    node: Some(node),
                    prefix_index,
                },
                outcome: FindOutcome::BranchMissing { nibble },
            });
        }
        let child_idx = node.to_child_index(nibble);

        let loaded_peek = node.children[child_idx].in_memory.read().clone();
        let child_node = match loaded_peek {
            Some(child) => child,
            None => {
                if version < min_version.load(Ordering::Acquire) {
                    return Ok(FindResult {
                        cursor: NodeCursor {
                            node: Some(node),
                            prefix_index,
                        },
                        outcome: FindOutcome::VersionExpired,
                    });
                }
                let offset = node.children[child_idx].offset;
                let loaded = store.read_node(offset)?;
                // Upgrade shared -> unique: install only if nobody raced us.
                let mut slot = node.children[child_idx].in_memory.write();
                match slot.clone() {
                    Some(already) => already,
                    None => {
                        *slot = Some(loaded.clone());
                        loaded
                    }
                }
            }
        };
        prefix_index += 1;
        node = child_node;
    }
}

/// Applies one version's batch of updates against `root`, returning the new
/// root node (not yet persisted) or `None` if the trie became empty.
/// Implements §4.4.2: top-down classification, bottom-up emission, with
/// path-split/pass-through/collapse handled uniformly by `merge`.
pub fn upsert(
    store: &NodeStore,
    root: Option<Arc<Node>>,
    updates: Vec<Update>,
    version: u64,
) -> Result<Option<Arc<Node>>> {
    let flat = flatten(updates);
    merge(store, root, flat, 0, version).map(|n| n.map(Arc::new))
}

/// Flattens `nested` updates into the top-level list. A nested entry is
/// itself a full-key update (see [`crate::trie::update::Update`]); the
/// `incarnation` flag on its parent is not separately modeled here — a
/// nested batch is merged against whatever already exists at its own key,
/// same as any other update (see DESIGN.md, Open Questions).
fn flatten(updates: Vec<Update>) -> Vec<Update> {
    let mut out = Vec::with_capacity(updates.len());
    for mut u in updates {
        let nested = std::mem::take(&mut u.nested);
        let nested_was_empty = nested.is_empty();
        if !nested_was_empty {
            out.extend(flatten(nested));
        }
        if u.value.is_some() || nested_was_empty {
            out.push(u);
        }
    }
    out
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Core recursive merge: combines an optional existing subtree with a set of
/// updates whose keys all begin, at `consumed`, inside this subtree.
fn merge(
    store: &NodeStore,
    existing: Option<Arc<Node>>,
    updates: Vec<Update>,
    consumed: usize,
    version: u64,
) -> Result<Option<Node>> {
    match existing {
        None => {
            let updates: Vec<Update> = updates.into_iter().filter(|u| !u.is_deletion()).collect();
            if updates.is_empty() {
                return Ok(None);
            }
            let reference = &updates[0].key_nibbles[consumed..];
            let mut common = reference.len();
            for u in &updates[1..] {
                let suffix = &u.key_nibbles[consumed..];
                common = common.min(common_prefix_len(reference, suffix));
            }
            let path = reference[..common].to_vec();
            assemble(store, None, updates, consumed + common, version, path)
        }
        Some(node) => {
            let path = node.path.clone();
            let split_at = updates
                .iter()
                .map(|u| common_prefix_len(&u.key_nibbles[consumed..], &path))
                .min()
                .unwrap_or(path.len());

            if split_at == path.len() {
                assemble(store, Some(&node), updates, consumed + path.len(), version, path)
            } else {
                split_existing(store, &node, &path, split_at, updates, consumed, version)
            }
        }
    }
}

/// Builds the value/children of a node whose own path is already fixed
/// (either freshly computed from a common prefix, or inherited unchanged
/// from an existing node), merging `updates` (indexed at `consumed`) against
/// any existing value/children.
fn assemble(
    store: &NodeStore,
    existing_node: Option<&Node>,
    updates: Vec<Update>,
    consumed: usize,
    version: u64,
    path: Vec<u8>,
) -> Result<Option<Node>> {
    let (mut req, _) = Requests::split_into_sublists(updates, consumed);
    let mut mask = existing_node.map_or(0, |n| n.mask);
    mask |= req.mask;

    let mut children = Vec::with_capacity(mask.count_ones() as usize);
    for nibble in 0u8..16 {
        if mask & (1u16 << nibble) == 0 {
            continue;
        }
        let touched = req.mask & (1u16 << nibble) != 0;
        if touched {
            let sub_updates = std::mem::take(&mut req.sublists[nibble as usize]);
            let existing_child = match existing_node.and_then(|n| n.child(nibble)) {
                Some(rec) => Some(store.read_node(rec.offset)?),
                None => None,
            };
            match merge(store, existing_child, sub_updates, consumed + 1, version)? {
                Some(child_node) => children.push((nibble, persist_child(store, &child_node)?)),
                None => mask &= !(1u16 << nibble),
            }
        } else {
            let rec = existing_node.and_then(|n| n.child(nibble)).expect("untouched bit implies existing child");
            children.push((nibble, rec.clone()));
        }
    }

    let value = if let Some(u) = &req.leaf_here {
        u.value.clone()
    } else {
        existing_node.and_then(|n| n.value.clone())
    };

    finalize(store, mask, path, value, children)
}

/// Splits an existing node's inline path at `split_at` (strictly inside it),
/// producing a branch node whose path is the common prefix, one child
/// continuing the shortened existing subtree, and one child per other
/// diverging update group.
fn split_existing(
    store: &NodeStore,
    node: &Node,
    path: &[u8],
    split_at: usize,
    updates: Vec<Update>,
    consumed: usize,
    version: u64,
) -> Result<Option<Node>> {
    let branch_nibble = path[split_at];
    let shortened = Arc::new(Node {
        mask: node.mask,
        path: path[split_at + 1..].to_vec(),
        value: node.value.clone(),
        children: node.children.clone(),
    });

    let (mut req, _) = Requests::split_into_sublists(updates, consumed + split_at);
    let mut mask = req.mask | (1u16 << branch_nibble);
    let mut children = Vec::with_capacity(mask.count_ones() as usize);

    for nibble in 0u8..16 {
        if mask & (1u16 << nibble) == 0 {
            continue;
        }
        let sub_updates = std::mem::take(&mut req.sublists[nibble as usize]);
        let existing_for_branch = if nibble == branch_nibble {
            Some(shortened.clone())
        } else {
            None
        };
        match merge(store, existing_for_branch, sub_updates, consumed + split_at + 1, version)? {
            Some(child_node) => children.push((nibble, persist_child(store, &child_node)?)),
            None => mask &= !(1u16 << nibble),
        }
    }

    let value = req.leaf_here.as_ref().and_then(|u| u.value.clone());
    finalize(store, mask, path[..split_at].to_vec(), value, children)
}

/// Assembles the final node from a dense `(nibble, record)` list already in
/// ascending nibble order, applying the single-child/no-value collapse rule
/// (§4.4.2) and the empty-subtree deletion rule.
fn finalize(
    store: &NodeStore,
    mask: u16,
    path: Vec<u8>,
    value: Option<Vec<u8>>,
    children: Vec<(u8, ChildRecord)>,
) -> Result<Option<Node>> {
    if mask == 0 && value.is_none() {
        return Ok(None);
    }
    if mask.count_ones() == 1 && value.is_none() {
        let (nibble, rec) = children.into_iter().next().expect("mask has one bit set");
        let child = match rec.in_memory.read().clone() {
            Some(arc) => arc,
            None => store.read_node(rec.offset)?,
        };
        let mut new_path = path;
        new_path.push(nibble);
        new_path.extend_from_slice(&child.path);
        return Ok(Some(Node {
            mask: child.mask,
            path: new_path,
            value: child.value.clone(),
            children: child.children.clone(),
        }));
    }
    Ok(Some(Node {
        mask,
        path,
        value,
        children: children.into_iter().map(|(_, rec)| rec).collect(),
    }))
}

fn persist_child(store: &NodeStore, node: &Node) -> Result<ChildRecord> {
    let hash = hash_node(&node.encode(store.pool().chunk_size));
    let vco = store.write_node(node, Ring::Fast)?;
    Ok(ChildRecord::written(vco.offset, hash, Arc::new(node.clone())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::offset::PAGE_SIZE;
    use crate::chunk::pool::StoragePool;
    use crate::trie::nibbles::bytes_to_nibbles;
    use std::io::Write;
    use std::sync::atomic::AtomicU64;

    fn test_store() -> (tempfile::NamedTempFile, NodeStore) {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        let chunk_bytes = PAGE_SIZE as u64 * 16;
        f.write_all(&vec![0u8; (chunk_bytes * 8) as usize]).unwrap();
        f.flush().unwrap();
        let pool = StoragePool::open(&[f.path()], chunk_bytes, 8, false, false).unwrap();
        let store = NodeStore::new(Arc::new(pool), 1 << 20);
        (f, store)
    }

    #[test]
    fn single_insert_and_find() {
        let (_f, store) = test_store();
        let key = bytes_to_nibbles(&[0xab, 0xcd]);
        let updates = vec![Update::write(key.clone(), vec![0x11], 1)];
        let new_root = upsert(&store, None, updates, 1).unwrap().unwrap();

        let min_version = AtomicU64::new(0);
        let result = find(&store, &min_version, NodeCursor::root(new_root), &key, 1).unwrap();
        match result.outcome {
            FindOutcome::Success(v) => assert_eq!(v, vec![0x11]),
            other => panic!("expected Success, got {:?}", other),
        }
    }

    #[test]
    fn two_keys_split_into_branch() {
        let (_f, store) = test_store();
        let key_a = bytes_to_nibbles(&[0x12]);
        let key_b = bytes_to_nibbles(&[0x13]);
        let updates = vec![
            Update::write(key_a.clone(), vec![0xAA], 1),
            Update::write(key_b.clone(), vec![0xBB], 1),
        ];
        let new_root = upsert(&store, None, updates, 1).unwrap().unwrap();

        let min_version = AtomicU64::new(0);
        let result_a = find(&store, &min_version, NodeCursor::root(new_root.clone()), &key_a, 1).unwrap();
        let result_b = find(&store, &min_version, NodeCursor::root(new_root), &key_b, 1).unwrap();
        assert!(matches!(result_a.outcome, FindOutcome::Success(ref v) if *v == vec![0xAA]));
        assert!(matches!(result_b.outcome, FindOutcome::Success(ref v) if *v == vec![0xBB]));
    }

    #[test]
    fn overwrite_existing_key_across_versions() {
        let (_f, store) = test_store();
        let key = bytes_to_nibbles(&[0x00, 0x00]);
        let root1 = upsert(&store, None, vec![Update::write(key.clone(), vec![0xAA], 1)], 1)
            .unwrap()
            .unwrap();
        let root2 = upsert(&store, Some(root1), vec![Update::write(key.clone(), vec![0xBB], 2)], 2)
            .unwrap()
            .unwrap();

        let min_version = AtomicU64::new(0);
        let result = find(&store, &min_version, NodeCursor::root(root2), &key, 2).unwrap();
        assert!(matches!(result.outcome, FindOutcome::Success(ref v) if *v == vec![0xBB]));
    }

    #[test]
    fn erase_removes_key() {
        let (_f, store) = test_store();
        let key_a = bytes_to_nibbles(&[0x01]);
        let key_b = bytes_to_nibbles(&[0x02]);
        let root1 = upsert(
            &store,
            None,
            vec![
                Update::write(key_a.clone(), vec![0xAA], 1),
                Update::write(key_b.clone(), vec![0xBB], 1),
            ],
            1,
        )
        .unwrap()
        .unwrap();

        let root2 = upsert(&store, Some(root1), vec![Update::erase(key_a.clone(), 2)], 2).unwrap();
        let root2 = root2.expect("one key remains");

        let min_version = AtomicU64::new(0);
        let missing = find(&store, &min_version, NodeCursor::root(root2.clone()), &key_a, 2).unwrap();
        assert!(matches!(
            missing.outcome,
            FindOutcome::BranchMissing { .. } | FindOutcome::KeyMismatch { .. }
        ));
        let present = find(&store, &min_version, NodeCursor::root(root2), &key_b, 2).unwrap();
        assert!(matches!(present.outcome, FindOutcome::Success(ref v) if *v == vec![0xBB]));
    }

    #[test]
    fn delete_of_absent_key_is_noop() {
        let (_f, store) = test_store();
        let key = bytes_to_nibbles(&[0x99]);
        let result = upsert(&store, None, vec![Update::erase(key, 1)], 1).unwrap();
        assert!(result.is_none());
    }
}
