//! Permissions granted to (or forbidden in) an execution context
//!
//! A permission is a kind (read, write, use ...) applied to an entity
//! (a global variable, lightweight threads, a resource pattern).
//! A granted permission `g` allows a requested permission `r` when
//! `g.includes(&r)`. Forbidden permissions always win.

use crate::error::PermissionError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionKind {
    Read,
    /// Includes `Create`, `Update` and `Delete`
    Write,
    Create,
    Update,
    Delete,
    Use,
    Consume,
    Provide,
    See,
}

impl PermissionKind {
    pub fn includes(self, other: PermissionKind) -> bool {
        self == other
            || (self == PermissionKind::Write
                && matches!(
                    other,
                    PermissionKind::Create | PermissionKind::Update | PermissionKind::Delete
                ))
    }

    pub fn name(self) -> &'static str {
        match self {
            PermissionKind::Read => "read",
            PermissionKind::Write => "write",
            PermissionKind::Create => "create",
            PermissionKind::Update => "update",
            PermissionKind::Delete => "delete",
            PermissionKind::Use => "use",
            PermissionKind::Consume => "consume",
            PermissionKind::Provide => "provide",
            PermissionKind::See => "see",
        }
    }
}

/// What a permission applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionEntity {
    /// A global variable, `"*"` means any
    GlobalVar(String),
    /// Lightweight threads
    LThread,
    /// A resource name; a trailing `*` matches any name with that prefix
    Resource(String),
    Custom(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    pub kind: PermissionKind,
    pub entity: PermissionEntity,
}

impl Permission {
    pub fn new(kind: PermissionKind, entity: PermissionEntity) -> Self {
        Self { kind, entity }
    }

    pub fn global_var(kind: PermissionKind, name: impl Into<String>) -> Self {
        Self::new(kind, PermissionEntity::GlobalVar(name.into()))
    }

    pub fn lthread(kind: PermissionKind) -> Self {
        Self::new(kind, PermissionEntity::LThread)
    }

    /// Permission to spawn lightweight threads
    pub fn create_lthread() -> Self {
        Self::lthread(PermissionKind::Create)
    }

    pub fn resource(kind: PermissionKind, pattern: impl Into<String>) -> Self {
        Self::new(kind, PermissionEntity::Resource(pattern.into()))
    }

    pub fn includes(&self, other: &Permission) -> bool {
        if !self.kind.includes(other.kind) {
            return false;
        }
        match (&self.entity, &other.entity) {
            (PermissionEntity::GlobalVar(a), PermissionEntity::GlobalVar(b)) => a == "*" || a == b,
            (PermissionEntity::LThread, PermissionEntity::LThread) => true,
            (PermissionEntity::Resource(pattern), PermissionEntity::Resource(name)) => {
                match pattern.strip_suffix('*') {
                    Some(prefix) => name.starts_with(prefix),
                    None => pattern == name,
                }
            }
            (PermissionEntity::Custom(a), PermissionEntity::Custom(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity {
            PermissionEntity::GlobalVar(name) => write!(f, "[{} global(s) '{}']", self.kind.name(), name),
            PermissionEntity::LThread => write!(f, "[{} threads]", self.kind.name()),
            PermissionEntity::Resource(pattern) => write!(f, "[{} {}]", self.kind.name(), pattern),
            PermissionEntity::Custom(name) => write!(f, "[{} {}]", self.kind.name(), name),
        }
    }
}

/// Granted and forbidden permissions of one context
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PermissionSet {
    granted: Vec<Permission>,
    forbidden: Vec<Permission>,
}

impl PermissionSet {
    pub fn new(granted: Vec<Permission>, forbidden: Vec<Permission>) -> Self {
        Self { granted, forbidden }
    }

    pub fn granted(&self) -> &[Permission] {
        &self.granted
    }

    pub fn forbidden(&self) -> &[Permission] {
        &self.forbidden
    }

    pub fn has(&self, perm: &Permission) -> bool {
        self.check(perm).is_ok()
    }

    pub fn check(&self, perm: &Permission) -> Result<(), PermissionError> {
        if self.forbidden.iter().any(|f| f.includes(perm)) {
            return Err(PermissionError::Forbidden(perm.to_string()));
        }
        if self.granted.iter().any(|g| g.includes(perm)) {
            Ok(())
        } else {
            Err(PermissionError::NotGranted(perm.to_string()))
        }
    }

    /// Remove every granted permission included in `dropped` and forbid
    /// `dropped`, so the removal cannot be undone.
    pub fn drop_permissions(&mut self, dropped: &[Permission]) {
        self.granted
            .retain(|granted| !dropped.iter().any(|d| d.includes(granted)));
        for perm in dropped {
            if !self.forbidden.contains(perm) {
                self.forbidden.push(perm.clone());
            }
        }
    }
}
