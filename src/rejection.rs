// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Domain-level rejections.
//!
//! One [`EntityError`] covers every entity: it carries the entity name and an
//! [`ErrorKind`] instead of a type per entity and failure. A
//! [`RejectionRegistry`], built once at startup, turns an error raised while
//! handling a command into the message sent back to the client.
//!
//! # Example
//!
//! ```
//! use tier_sync::rejection::{CommandKind, EntityError, RejectionRegistry};
//!
//! let registry = RejectionRegistry::with_defaults();
//! let err = EntityError::not_found("citizen", "abc");
//!
//! let rejection = registry.reject(CommandKind::Update, &err);
//! assert_eq!(rejection.code, "update_citizen_rejected");
//! assert_eq!(rejection.message, "Cannot update citizen 'abc': it does not exist");
//! ```

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::storage::traits::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AlreadyExists,
    NotFound,
    Invalid,
    Conflict,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AlreadyExists => "already_exists",
            Self::NotFound => "not_found",
            Self::Invalid => "invalid",
            Self::Conflict => "conflict",
        }
    }
}

/// A rule violation on one entity.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{entity} {}{}", kind.as_str(), describe(id, detail))]
pub struct EntityError {
    pub entity: String,
    pub kind: ErrorKind,
    pub id: Option<String>,
    pub detail: Option<String>,
}

fn describe(id: &Option<String>, detail: &Option<String>) -> String {
    let mut out = String::new();
    if let Some(id) = id {
        out.push_str(&format!(" '{}'", id));
    }
    if let Some(detail) = detail {
        out.push_str(&format!(": {}", detail));
    }
    out
}

impl EntityError {
    pub fn new(entity: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            entity: entity.into(),
            kind,
            id: None,
            detail: None,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn already_exists(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(entity, ErrorKind::AlreadyExists).with_id(id)
    }

    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(entity, ErrorKind::NotFound).with_id(id)
    }

    pub fn invalid(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(entity, ErrorKind::Invalid).with_detail(reason)
    }

    /// Stable machine-readable code, e.g. `citizen_not_found`.
    #[must_use]
    pub fn code(&self) -> String {
        format!("{}_{}", self.entity, self.kind.as_str())
    }

    /// Map a storage error raised for `entity`/`id` into a rejection.
    ///
    /// Infrastructure failures (timeouts, unavailable tiers, backend errors)
    /// are not rule violations and come back as `None`.
    pub fn from_storage(entity: impl Into<String>, id: &str, err: &StorageError) -> Option<Self> {
        let entity = entity.into();
        match err {
            StorageError::NotFound => Some(Self::not_found(entity, id)),
            StorageError::AlreadyExists { id } => Some(Self::already_exists(entity, id.clone())),
            StorageError::Conflict { expected, actual, .. } => Some(
                Self::new(entity, ErrorKind::Conflict)
                    .with_id(id)
                    .with_detail(format!("expected version {}, found {}", expected, actual)),
            ),
            StorageError::Serialization(reason) => Some(Self::invalid(entity, reason.clone()).with_id(id)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Create,
    Update,
    Delete,
    Get,
}

impl CommandKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Get => "get",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message sent back to the client for a rejected command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    /// `{command}_{entity}_rejected`
    pub code: String,
    pub reason: String,
    pub message: String,
}

type MessageFn = Box<dyn Fn(CommandKind, &EntityError) -> String + Send + Sync>;

/// `(ErrorKind, CommandKind)` → message constructor.
///
/// Pairs without an entry fall back to the error's own `Display`.
pub struct RejectionRegistry {
    messages: HashMap<(ErrorKind, CommandKind), MessageFn>,
}

impl Default for RejectionRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl RejectionRegistry {
    /// Registry with no messages; everything uses the fallback.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            messages: HashMap::new(),
        }
    }

    /// Messages for every error kind on every command.
    #[must_use]
    pub fn with_defaults() -> Self {
        let commands = [CommandKind::Create, CommandKind::Update, CommandKind::Delete, CommandKind::Get];
        let mut registry = Self::empty();
        for command in commands {
            registry = registry
                .register(ErrorKind::AlreadyExists, command, |c, e| {
                    format!("Cannot {} {} '{}': it already exists", c, e.entity, id_of(e))
                })
                .register(ErrorKind::NotFound, command, |c, e| {
                    format!("Cannot {} {} '{}': it does not exist", c, e.entity, id_of(e))
                })
                .register(ErrorKind::Invalid, command, |c, e| {
                    format!("Cannot {} {}: {}", c, e.entity, e.detail.as_deref().unwrap_or("invalid input"))
                })
                .register(ErrorKind::Conflict, command, |c, e| {
                    format!("Cannot {} {} '{}': it was modified concurrently, reload and retry", c, e.entity, id_of(e))
                });
        }
        registry
    }

    /// Add or replace the message for `(kind, command)`.
    #[must_use]
    pub fn register<F>(mut self, kind: ErrorKind, command: CommandKind, message: F) -> Self
    where
        F: Fn(CommandKind, &EntityError) -> String + Send + Sync + 'static,
    {
        self.messages.insert((kind, command), Box::new(message));
        self
    }

    #[must_use]
    pub fn reject(&self, command: CommandKind, error: &EntityError) -> Rejection {
        let message = match self.messages.get(&(error.kind, command)) {
            Some(build) => build(command, error),
            None => error.to_string(),
        };
        Rejection {
            code: format!("{}_{}_rejected", command, error.entity),
            reason: error.code(),
            message,
        }
    }
}

fn id_of(error: &EntityError) -> &str {
    error.id.as_deref().unwrap_or("?")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_error_display_and_code() {
        let err = EntityError::already_exists("passport", "p-1");
        assert_eq!(err.to_string(), "passport already_exists 'p-1'");
        assert_eq!(err.code(), "passport_already_exists");

        let err = EntityError::invalid("citizen", "name is empty");
        assert_eq!(err.to_string(), "citizen invalid: name is empty");
    }

    #[test]
    fn test_from_storage_maps_domain_errors_only() {
        let conflict = StorageError::Conflict { id: "a".into(), expected: 1, actual: 2 };
        let err = EntityError::from_storage("citizen", "a", &conflict).unwrap();
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(err.detail.as_deref(), Some("expected version 1, found 2"));

        assert_eq!(
            EntityError::from_storage("citizen", "a", &StorageError::NotFound).unwrap().kind,
            ErrorKind::NotFound
        );
        assert!(EntityError::from_storage("citizen", "a", &StorageError::Timeout { operation: "get".into() }).is_none());
        assert!(EntityError::from_storage("citizen", "a", &StorageError::Backend("io".into())).is_none());
    }

    #[test]
    fn test_registry_lookup_and_override() {
        let registry = RejectionRegistry::with_defaults().register(
            ErrorKind::AlreadyExists,
            CommandKind::Create,
            |_, e| format!("{} is taken", id_of(e)),
        );

        let taken = registry.reject(CommandKind::Create, &EntityError::already_exists("user", "ada@example.org"));
        assert_eq!(taken.message, "ada@example.org is taken");
        assert_eq!(taken.code, "create_user_rejected");
        assert_eq!(taken.reason, "user_already_exists");

        // Other commands keep the default wording
        let other = registry.reject(CommandKind::Update, &EntityError::already_exists("user", "x"));
        assert_eq!(other.message, "Cannot update user 'x': it already exists");
    }

    #[test]
    fn test_empty_registry_falls_back_to_display() {
        let registry = RejectionRegistry::empty();
        let rejection = registry.reject(CommandKind::Delete, &EntityError::not_found("role", "admin"));
        assert_eq!(rejection.message, "role not_found 'admin'");
    }
}
