//! Nested checkpoint trees and the tree walker
//!
//! A [`Tree`] is an ordered, nested structure of maps and lists whose leaves
//! are [`Tensor`] values. The walker assigns each leaf a stable storage key
//! derived from its path from the root; the same order drives both save and
//! restore, so a rebuilt tree reproduces container kinds and key order
//! exactly.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, Result};
use crate::tensor::Tensor;

/// One element of a leaf path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathElem {
    /// Map key
    Key(String),
    /// List index
    Index(usize),
}

impl fmt::Display for PathElem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathElem::Key(k) => f.write_str(k),
            PathElem::Index(i) => write!(f, "{}", i),
        }
    }
}

/// Path of a leaf from the tree root
pub type TreePath = Vec<PathElem>;

/// Storage key of a leaf: path elements joined with '.'
pub fn storage_key(path: &[PathElem]) -> String {
    path.iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

/// Validate a map key for use in storage paths
///
/// Keys must be non-empty and must not contain the path separator `'.'` or
/// the directory separator `'/'`.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidConfig {
            message: "tree keys must be non-empty".to_string(),
        });
    }
    if key.contains('.') || key.contains('/') {
        return Err(Error::InvalidConfig {
            message: format!("tree key '{}' contains a reserved separator", key),
        });
    }
    Ok(())
}

/// A nested tree of array leaves
#[derive(Debug, Clone, PartialEq)]
pub enum Tree {
    /// Insertion-ordered string-keyed mapping
    Map(Vec<(String, Tree)>),
    /// Ordered sequence
    List(Vec<Tree>),
    /// Terminal array value
    Leaf(Tensor),
}

/// Value-free mirror of a tree recording container kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Structure {
    Map(Vec<(String, Structure)>),
    List(Vec<Structure>),
    Leaf,
}

impl Tree {
    /// Wrap a tensor as a leaf node
    pub fn leaf(tensor: Tensor) -> Self {
        Tree::Leaf(tensor)
    }

    /// All leaves with their paths, in deterministic walk order
    ///
    /// Map keys are visited in stored order, list indices in numeric order.
    pub fn leaves(&self) -> Vec<(TreePath, &Tensor)> {
        let mut out = Vec::new();
        let mut path = Vec::new();
        self.collect_leaves(&mut path, &mut out);
        out
    }

    fn collect_leaves<'a>(
        &'a self,
        path: &mut TreePath,
        out: &mut Vec<(TreePath, &'a Tensor)>,
    ) {
        match self {
            Tree::Map(entries) => {
                for (key, child) in entries {
                    path.push(PathElem::Key(key.clone()));
                    child.collect_leaves(path, out);
                    path.pop();
                }
            }
            Tree::List(items) => {
                for (i, child) in items.iter().enumerate() {
                    path.push(PathElem::Index(i));
                    child.collect_leaves(path, out);
                    path.pop();
                }
            }
            Tree::Leaf(tensor) => out.push((path.clone(), tensor)),
        }
    }

    /// Consume the tree into its leaves, same order as [`Tree::leaves`]
    pub fn into_leaves(self) -> Vec<(TreePath, Tensor)> {
        let mut out = Vec::new();
        let mut path = Vec::new();
        self.drain_leaves(&mut path, &mut out);
        out
    }

    fn drain_leaves(self, path: &mut TreePath, out: &mut Vec<(TreePath, Tensor)>) {
        match self {
            Tree::Map(entries) => {
                for (key, child) in entries {
                    path.push(PathElem::Key(key));
                    child.drain_leaves(path, out);
                    path.pop();
                }
            }
            Tree::List(items) => {
                for (i, child) in items.into_iter().enumerate() {
                    path.push(PathElem::Index(i));
                    child.drain_leaves(path, out);
                    path.pop();
                }
            }
            Tree::Leaf(tensor) => out.push((path.clone(), tensor)),
        }
    }

    /// Number of leaves in the tree
    pub fn num_leaves(&self) -> usize {
        match self {
            Tree::Map(entries) => entries.iter().map(|(_, c)| c.num_leaves()).sum(),
            Tree::List(items) => items.iter().map(|c| c.num_leaves()).sum(),
            Tree::Leaf(_) => 1,
        }
    }

    /// The container-kind skeleton of this tree
    pub fn structure(&self) -> Structure {
        match self {
            Tree::Map(entries) => Structure::Map(
                entries
                    .iter()
                    .map(|(k, c)| (k.clone(), c.structure()))
                    .collect(),
            ),
            Tree::List(items) => Structure::List(items.iter().map(|c| c.structure()).collect()),
            Tree::Leaf(_) => Structure::Leaf,
        }
    }

    /// Rebuild a tree from its structure and leaves keyed by storage key
    ///
    /// Inverse of walking: the rebuilt tree reproduces the structure's
    /// container kinds and key order exactly. Every structural leaf must be
    /// present in `leaves`.
    pub fn rebuild(structure: &Structure, leaves: &mut HashMap<String, Tensor>) -> Result<Tree> {
        let mut path = Vec::new();
        Self::rebuild_node(structure, &mut path, leaves)
    }

    fn rebuild_node(
        structure: &Structure,
        path: &mut TreePath,
        leaves: &mut HashMap<String, Tensor>,
    ) -> Result<Tree> {
        match structure {
            Structure::Map(entries) => {
                let mut out = Vec::with_capacity(entries.len());
                for (key, child) in entries {
                    path.push(PathElem::Key(key.clone()));
                    out.push((key.clone(), Self::rebuild_node(child, path, leaves)?));
                    path.pop();
                }
                Ok(Tree::Map(out))
            }
            Structure::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, child) in items.iter().enumerate() {
                    path.push(PathElem::Index(i));
                    out.push(Self::rebuild_node(child, path, leaves)?);
                    path.pop();
                }
                Ok(Tree::List(out))
            }
            Structure::Leaf => {
                let key = storage_key(path);
                leaves.remove(&key).map(Tree::Leaf).ok_or(Error::LeafNotFound { leaf: key })
            }
        }
    }

    /// Build a tree of nested maps from flat storage keys
    ///
    /// Used for metadata-less restore: container kinds are unknowable, so
    /// every interior node becomes a map and list indices stay string keys.
    pub fn from_flat(leaves: Vec<(String, Tensor)>) -> Result<Tree> {
        let mut root = Tree::Map(Vec::new());
        for (key, tensor) in leaves {
            let segments: Vec<&str> = key.split('.').collect();
            insert_flat(&mut root, &key, &segments, tensor)?;
        }
        Ok(root)
    }

    /// Look up a leaf by its storage key
    pub fn leaf_at(&self, key: &str) -> Option<&Tensor> {
        let mut node = self;
        for segment in key.split('.') {
            node = match node {
                Tree::Map(entries) => entries
                    .iter()
                    .find(|(k, _)| k == segment)
                    .map(|(_, c)| c)?,
                Tree::List(items) => items.get(segment.parse::<usize>().ok()?)?,
                Tree::Leaf(_) => return None,
            };
        }
        match node {
            Tree::Leaf(tensor) => Some(tensor),
            _ => None,
        }
    }
}

fn insert_flat(node: &mut Tree, key: &str, segments: &[&str], tensor: Tensor) -> Result<()> {
    let Tree::Map(entries) = node else {
        return Err(Error::CheckpointCorrupted {
            path: key.to_string(),
            reason: "leaf key conflicts with an existing leaf".to_string(),
        });
    };

    let (head, rest) = (segments[0], &segments[1..]);
    let position = entries.iter().position(|(k, _)| k.as_str() == head);

    if rest.is_empty() {
        if position.is_some() {
            return Err(Error::CheckpointCorrupted {
                path: key.to_string(),
                reason: "duplicate leaf key".to_string(),
            });
        }
        entries.push((head.to_string(), Tree::Leaf(tensor)));
        return Ok(());
    }

    let index = match position {
        Some(index) => index,
        None => {
            entries.push((head.to_string(), Tree::Map(Vec::new())));
            entries.len() - 1
        }
    };
    insert_flat(&mut entries[index].1, key, rest, tensor)
}
