use std::collections::HashMap;

use thiserror::Error;

/// What a mount forwards to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountKind {
    /// A local backend on `127.0.0.1:<port>`, mounted at `/<port>`.
    Numbered(u16),
    /// An external upstream mounted at `/<segment>`.
    Named(String),
}

impl MountKind {
    /// Whether this mount targets a numbered local backend.
    pub fn is_numbered(&self) -> bool {
        matches!(self, MountKind::Numbered(_))
    }
}

/// A registered mount.
#[derive(Debug, Clone)]
pub struct Mount {
    /// Registration order, also the index of the mount's dispatcher.
    pub index: usize,
    /// Normalized prefix, always `/seg[/seg...]`.
    pub prefix: String,
    pub kind: MountKind,
    /// Base URL of the upstream (scheme, authority and optional base path).
    pub target: String,
}

/// The result of a successful lookup.
#[derive(Debug, Clone, Copy)]
pub struct RouteMatch<'a> {
    pub mount: &'a Mount,
    /// The request path with the mount prefix removed. Never empty: a request
    /// for the bare prefix forwards `/`.
    pub forwarded_path: &'a str,
}

/// Errors raised while building the table.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteTableError {
    #[error("mount prefix is empty")]
    EmptyPrefix,

    #[error("mount prefix '{0}' contains a query or fragment delimiter")]
    InvalidPrefix(String),

    #[error("mount prefix '{prefix}' is already registered by mount #{existing}")]
    Conflict { prefix: String, existing: usize },
}

/// A single node in the segment trie.
#[derive(Debug, Default)]
struct Node {
    children: HashMap<String, Node>,
    /// Index into `RouteTable::mounts` when a mount terminates here.
    mount: Option<usize>,
}

/// Immutable route table. Build it with [`RouteTable::builder`].
#[derive(Debug, Default)]
pub struct RouteTable {
    root: Node,
    mounts: Vec<Mount>,
}

/// Builder for [`RouteTable`]. Mount indices follow registration order.
#[derive(Debug, Default)]
pub struct RouteTableBuilder {
    table: RouteTable,
}

impl RouteTableBuilder {
    /// Register a mount under `prefix`.
    ///
    /// Leading, trailing and repeated slashes in the prefix are ignored.
    /// Registering the same prefix twice is an error: precedence between
    /// colliding mounts is never decided by registration order.
    pub fn mount(
        mut self,
        prefix: &str,
        kind: MountKind,
        target: impl Into<String>,
    ) -> Result<Self, RouteTableError> {
        if prefix.contains(['?', '#']) {
            return Err(RouteTableError::InvalidPrefix(prefix.to_string()));
        }

        let segments: Vec<&str> = prefix.split('/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return Err(RouteTableError::EmptyPrefix);
        }

        let normalized = format!("/{}", segments.join("/"));
        let index = self.table.mounts.len();

        let mut node = &mut self.table.root;
        for segment in &segments {
            node = node.children.entry((*segment).to_string()).or_default();
        }

        if let Some(existing) = node.mount {
            return Err(RouteTableError::Conflict {
                prefix: normalized,
                existing,
            });
        }
        node.mount = Some(index);

        self.table.mounts.push(Mount {
            index,
            prefix: normalized,
            kind,
            target: target.into(),
        });
        Ok(self)
    }

    pub fn build(self) -> RouteTable {
        self.table
    }
}

impl RouteTable {
    pub fn builder() -> RouteTableBuilder {
        RouteTableBuilder::default()
    }

    /// Find the longest mount prefix of `path`, matching whole segments only.
    ///
    /// `path` is the raw request path (no query). The forwarded remainder is
    /// sliced out of `path` untouched, so upstreams see exactly what the
    /// client sent after the prefix.
    pub fn lookup<'a>(&'a self, path: &'a str) -> Option<RouteMatch<'a>> {
        if !path.starts_with('/') {
            return None;
        }

        let mut node = &self.root;
        let mut best: Option<(usize, usize)> = None;
        let mut pos = 1;

        loop {
            let end = path[pos..]
                .find('/')
                .map(|i| pos + i)
                .unwrap_or(path.len());

            match node.children.get(&path[pos..end]) {
                Some(child) => {
                    node = child;
                    if let Some(index) = node.mount {
                        best = Some((index, end));
                    }
                }
                None => break,
            }

            if end >= path.len() {
                break;
            }
            pos = end + 1;
        }

        best.map(|(index, end)| RouteMatch {
            mount: &self.mounts[index],
            forwarded_path: if end >= path.len() { "/" } else { &path[end..] },
        })
    }

    /// All mounts in registration order.
    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }
}
