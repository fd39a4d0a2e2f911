//! In-memory storage tree.
//!
//! Paths are normalized lexically; there are no symbolic links, so
//! `canonicalize` only checks existence. The whole tree sits behind one
//! lock, which also makes every call trivially atomic.

use crate::backend::{DirEntry, EntryKind, Metadata, StorageBackend};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;
use warden_core::Timestamp;

#[derive(Debug, Clone)]
enum Node {
    File { data: Vec<u8>, modified: Timestamp },
    Dir { modified: Timestamp },
}

impl Node {
    fn metadata(&self) -> Metadata {
        match self {
            Self::File { data, modified } => Metadata {
                kind: EntryKind::File,
                len: data.len() as u64,
                modified: Some(*modified),
                created: None,
                permissions: Some(0o644),
            },
            Self::Dir { modified } => Metadata {
                kind: EntryKind::Directory,
                len: 0,
                modified: Some(*modified),
                created: None,
                permissions: Some(0o755),
            },
        }
    }
}

/// In-memory storage backend
#[derive(Debug)]
pub struct MemoryStorage {
    nodes: RwLock<BTreeMap<PathBuf, Node>>,
}

impl MemoryStorage {
    /// Create an empty tree containing only `/`
    #[must_use]
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            PathBuf::from("/"),
            Node::Dir {
                modified: Timestamp::now(),
            },
        );
        Self {
            nodes: RwLock::new(nodes),
        }
    }

    fn read_nodes(&self) -> StorageResult<std::sync::RwLockReadGuard<'_, BTreeMap<PathBuf, Node>>> {
        self.nodes.read().map_err(|_| StorageError::Io {
            kind: "lock poisoned".to_string(),
        })
    }

    fn write_nodes(
        &self,
    ) -> StorageResult<std::sync::RwLockWriteGuard<'_, BTreeMap<PathBuf, Node>>> {
        self.nodes.write().map_err(|_| StorageError::Io {
            kind: "lock poisoned".to_string(),
        })
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// Lexically normalize an absolute path
fn normalize(path: &Path) -> StorageResult<PathBuf> {
    let mut out = PathBuf::from("/");
    let mut absolute = false;
    for component in path.components() {
        match component {
            Component::RootDir => absolute = true,
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(name) => out.push(name),
            Component::Prefix(_) => {
                return Err(StorageError::Io {
                    kind: "unsupported path prefix".to_string(),
                });
            }
        }
    }
    if !absolute {
        return Err(StorageError::Io {
            kind: "relative path".to_string(),
        });
    }
    Ok(out)
}

/// Every strict descendant of `dir` in key order
fn descendants<'a>(
    nodes: &'a BTreeMap<PathBuf, Node>,
    dir: &'a Path,
) -> impl Iterator<Item = (&'a PathBuf, &'a Node)> + 'a {
    nodes
        .range(dir.to_path_buf()..)
        .skip_while(move |(p, _)| p.as_path() == dir)
        .take_while(move |(p, _)| p.starts_with(dir))
}

fn require_parent_dir(nodes: &BTreeMap<PathBuf, Node>, path: &Path) -> StorageResult<()> {
    let parent = path.parent().ok_or(StorageError::AlreadyExists)?;
    match nodes.get(parent) {
        Some(Node::Dir { .. }) => Ok(()),
        Some(Node::File { .. }) => Err(StorageError::NotADirectory),
        None => Err(StorageError::NotFound),
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn metadata(&self, path: &Path) -> StorageResult<Metadata> {
        let path = normalize(path)?;
        let nodes = self.read_nodes()?;
        nodes
            .get(&path)
            .map(Node::metadata)
            .ok_or(StorageError::NotFound)
    }

    async fn symlink_metadata(&self, path: &Path) -> StorageResult<Metadata> {
        self.metadata(path).await
    }

    async fn canonicalize(&self, path: &Path) -> StorageResult<PathBuf> {
        let path = normalize(path)?;
        let nodes = self.read_nodes()?;
        if nodes.contains_key(&path) {
            Ok(path)
        } else {
            Err(StorageError::NotFound)
        }
    }

    async fn read(&self, path: &Path) -> StorageResult<Vec<u8>> {
        let path = normalize(path)?;
        let nodes = self.read_nodes()?;
        match nodes.get(&path) {
            Some(Node::File { data, .. }) => Ok(data.clone()),
            Some(Node::Dir { .. }) => Err(StorageError::IsADirectory),
            None => Err(StorageError::NotFound),
        }
    }

    async fn write(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        let path = normalize(path)?;
        let mut nodes = self.write_nodes()?;
        require_parent_dir(&nodes, &path)?;
        if let Some(Node::Dir { .. }) = nodes.get(&path) {
            return Err(StorageError::IsADirectory);
        }
        nodes.insert(
            path,
            Node::File {
                data: data.to_vec(),
                modified: Timestamp::now(),
            },
        );
        Ok(())
    }

    async fn append(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        let path = normalize(path)?;
        let mut nodes = self.write_nodes()?;
        require_parent_dir(&nodes, &path)?;
        match nodes.get_mut(&path) {
            Some(Node::File {
                data: existing,
                modified,
            }) => {
                existing.extend_from_slice(data);
                *modified = Timestamp::now();
            }
            Some(Node::Dir { .. }) => return Err(StorageError::IsADirectory),
            None => {
                nodes.insert(
                    path,
                    Node::File {
                        data: data.to_vec(),
                        modified: Timestamp::now(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn create_dir(&self, path: &Path) -> StorageResult<()> {
        let path = normalize(path)?;
        let mut nodes = self.write_nodes()?;
        if nodes.contains_key(&path) {
            return Err(StorageError::AlreadyExists);
        }
        require_parent_dir(&nodes, &path)?;
        nodes.insert(
            path,
            Node::Dir {
                modified: Timestamp::now(),
            },
        );
        Ok(())
    }

    async fn create_dir_all(&self, path: &Path) -> StorageResult<()> {
        let path = normalize(path)?;
        let mut nodes = self.write_nodes()?;
        let mut current = PathBuf::from("/");
        for component in path.components().skip(1) {
            current.push(component);
            match nodes.get(&current) {
                Some(Node::Dir { .. }) => {}
                Some(Node::File { .. }) => return Err(StorageError::NotADirectory),
                None => {
                    nodes.insert(
                        current.clone(),
                        Node::Dir {
                            modified: Timestamp::now(),
                        },
                    );
                }
            }
        }
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> StorageResult<()> {
        let path = normalize(path)?;
        let mut nodes = self.write_nodes()?;
        match nodes.get(&path) {
            Some(Node::File { .. }) => {
                nodes.remove(&path);
                Ok(())
            }
            Some(Node::Dir { .. }) => Err(StorageError::IsADirectory),
            None => Err(StorageError::NotFound),
        }
    }

    async fn remove_dir(&self, path: &Path) -> StorageResult<()> {
        let path = normalize(path)?;
        let mut nodes = self.write_nodes()?;
        match nodes.get(&path) {
            Some(Node::Dir { .. }) => {
                if descendants(&nodes, &path).next().is_some() {
                    return Err(StorageError::DirectoryNotEmpty);
                }
                nodes.remove(&path);
                Ok(())
            }
            Some(Node::File { .. }) => Err(StorageError::NotADirectory),
            None => Err(StorageError::NotFound),
        }
    }

    async fn remove_dir_all(&self, path: &Path) -> StorageResult<()> {
        let path = normalize(path)?;
        let mut nodes = self.write_nodes()?;
        match nodes.get(&path) {
            Some(Node::Dir { .. }) => {
                let doomed: Vec<PathBuf> = descendants(&nodes, &path)
                    .map(|(p, _)| p.clone())
                    .collect();
                for p in doomed {
                    nodes.remove(&p);
                }
                nodes.remove(&path);
                Ok(())
            }
            Some(Node::File { .. }) => Err(StorageError::NotADirectory),
            None => Err(StorageError::NotFound),
        }
    }

    async fn rename(&self, from: &Path, to: &Path) -> StorageResult<()> {
        let from = normalize(from)?;
        let to = normalize(to)?;
        let mut nodes = self.write_nodes()?;

        let node = nodes.get(&from).cloned().ok_or(StorageError::NotFound)?;
        require_parent_dir(&nodes, &to)?;
        if from == to {
            return Ok(());
        }

        match (&node, nodes.get(&to)) {
            (Node::File { .. }, Some(Node::Dir { .. })) => return Err(StorageError::IsADirectory),
            (Node::Dir { .. }, Some(Node::File { .. })) => return Err(StorageError::NotADirectory),
            (Node::Dir { .. }, Some(Node::Dir { .. })) => {
                if descendants(&nodes, &to).next().is_some() {
                    return Err(StorageError::DirectoryNotEmpty);
                }
            }
            _ => {}
        }
        if matches!(node, Node::Dir { .. }) && to.starts_with(&from) {
            return Err(StorageError::Io {
                kind: "invalid input".to_string(),
            });
        }

        let moved: Vec<(PathBuf, Node)> = descendants(&nodes, &from)
            .map(|(p, n)| (p.clone(), n.clone()))
            .collect();
        for (p, _) in &moved {
            nodes.remove(p);
        }
        nodes.remove(&from);
        nodes.insert(to.clone(), node);
        for (p, n) in moved {
            if let Ok(rest) = p.strip_prefix(&from) {
                nodes.insert(to.join(rest), n);
            }
        }
        Ok(())
    }

    async fn read_dir(&self, path: &Path) -> StorageResult<Vec<DirEntry>> {
        let path = normalize(path)?;
        let nodes = self.read_nodes()?;
        match nodes.get(&path) {
            Some(Node::Dir { .. }) => {}
            Some(Node::File { .. }) => return Err(StorageError::NotADirectory),
            None => return Err(StorageError::NotFound),
        }

        let mut entries: Vec<DirEntry> = descendants(&nodes, &path)
            .filter(|(p, _)| p.parent() == Some(path.as_path()))
            .filter_map(|(p, n)| {
                p.file_name().map(|name| DirEntry {
                    name: name.to_string_lossy().into_owned(),
                    metadata: n.metadata(),
                })
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}
