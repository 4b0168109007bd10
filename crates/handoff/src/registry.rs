//! Named descriptor table.
//!
//! Registration happens through [`RegistryBuilder`], which is only mutated
//! through `&mut` during the single-threaded startup phase. Once every
//! listener is acquired the builder is frozen into a read-only [`Registry`]
//! that the respawn loop reads without locking.

use std::collections::HashMap;
use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use tracing::debug;

use crate::error::{HandoffError, Result};

/// What kind of listener a descriptor backs. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    /// A plain listening socket.
    Socket,
    /// A listening socket served by an HTTP server.
    Http,
}

impl fmt::Display for DescriptorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptorKind::Socket => write!(f, "socket"),
            DescriptorKind::Http => write!(f, "http"),
        }
    }
}

/// One named listener and the descriptor that will be handed to the next generation.
#[derive(Debug)]
pub struct DescriptorEntry {
    name: String,
    index: usize,
    handle: OwnedFd,
    kind: DescriptorKind,
}

impl DescriptorEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Position in the child's inherited descriptor list.
    pub fn handoff_index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> DescriptorKind {
        self.kind
    }

    pub fn handle(&self) -> BorrowedFd<'_> {
        self.handle.as_fd()
    }

    pub fn raw_fd(&self) -> RawFd {
        self.handle.as_raw_fd()
    }
}

/// Registration-phase table. Not `Clone`; mutation requires `&mut`.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    entries: Vec<DescriptorEntry>,
    by_name: HashMap<String, usize>,
    next_index: usize,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `handle` under `name` and return its handoff index.
    ///
    /// Indices come from a counter that is never rewound. On error the
    /// table is left untouched and `handle` is closed.
    pub fn register(&mut self, name: &str, handle: OwnedFd, kind: DescriptorKind) -> Result<usize> {
        validate_name(name)?;
        if self.by_name.contains_key(name) {
            return Err(HandoffError::DuplicateName {
                name: name.to_string(),
            });
        }

        let index = self.next_index;
        self.next_index += 1;

        debug!(index, name, fd = handle.as_raw_fd(), %kind, "Registered descriptor");
        self.by_name.insert(name.to_string(), self.entries.len());
        self.entries.push(DescriptorEntry {
            name: name.to_string(),
            index,
            handle,
            kind,
        });
        Ok(index)
    }

    pub fn lookup(&self, name: &str) -> Result<&DescriptorEntry> {
        lookup(&self.entries, &self.by_name, name)
    }

    /// Entries registered so far, in handoff index order.
    pub fn all(&self) -> &[DescriptorEntry] {
        &self.entries
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// End the registration phase.
    pub fn freeze(self) -> Registry {
        Registry {
            entries: self.entries,
            by_name: self.by_name,
        }
    }
}

/// Read-only view produced by [`RegistryBuilder::freeze`].
#[derive(Debug, Default)]
pub struct Registry {
    entries: Vec<DescriptorEntry>,
    by_name: HashMap<String, usize>,
}

impl Registry {
    pub fn lookup(&self, name: &str) -> Result<&DescriptorEntry> {
        lookup(&self.entries, &self.by_name, name)
    }

    /// Entries in ascending handoff index order; position `i` is inherited slot `i`.
    pub fn all(&self) -> &[DescriptorEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn lookup<'a>(
    entries: &'a [DescriptorEntry],
    by_name: &HashMap<String, usize>,
    name: &str,
) -> Result<&'a DescriptorEntry> {
    by_name
        .get(name)
        .map(|&pos| &entries[pos])
        .ok_or_else(|| HandoffError::NotFound {
            name: name.to_string(),
        })
}

/// Names are embedded in environment variable keys.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('=') || name.contains('\0') {
        return Err(HandoffError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}
