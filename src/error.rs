//! Crate-wide error taxonomy.
//!
//! A single [`CoreError`] threads through every fallible operation in the
//! crate. Variants group by category rather than by entity, so a single
//! `NotFound`/`AlreadyExists`/`Busy` each cover every kind of lookup failure
//! instead of growing one variant per entity type.

use std::fmt;

/// The kind of catalog entity an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    DeviceType,
    Device,
    Region,
    Watchpoint,
    Action,
    Rule,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityKind::DeviceType => "device type",
            EntityKind::Device => "device",
            EntityKind::Region => "region",
            EntityKind::Watchpoint => "watchpoint",
            EntityKind::Action => "action",
            EntityKind::Rule => "rule",
        };
        f.write_str(s)
    }
}

/// Crate-wide error type.
///
/// Propagation policy: errors from user callbacks are returned verbatim to
/// whichever caller triggered the dispatch. `MonitorEngine::notify` does not
/// abort a notification on an individual action error (every matching
/// action is attempted); `RuleEngine::evaluate` stops at the first action
/// error, wrapped in [`CoreError::RuleActionFailed`].
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("{kind} '{name}' not found")]
    NotFound { kind: EntityKind, name: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: EntityKind, name: String },

    #[error("{kind} '{name}' is busy")]
    Busy { kind: EntityKind, name: String },

    #[error("access out of range")]
    OutOfRange,

    #[error("permission denied")]
    PermissionDenied,

    #[error("misaligned access")]
    Alignment,

    #[error("operation not supported")]
    NotSupported,

    #[error("action execution failed: {source}")]
    ActionExecuteFailed {
        #[source]
        source: Box<CoreError>,
    },

    #[error("rule '{rule}' action failed: {source}")]
    RuleActionFailed {
        rule: String,
        #[source]
        source: Box<CoreError>,
    },

    #[error("rule condition failed")]
    RuleConditionFailed,

    #[error("lock acquisition or release failure")]
    LockFailure,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub fn not_found(kind: EntityKind, name: impl Into<String>) -> Self {
        CoreError::NotFound { kind, name: name.into() }
    }

    pub fn already_exists(kind: EntityKind, name: impl Into<String>) -> Self {
        CoreError::AlreadyExists { kind, name: name.into() }
    }

    pub fn busy(kind: EntityKind, name: impl Into<String>) -> Self {
        CoreError::Busy { kind, name: name.into() }
    }
}

/// Convenience alias used throughout the crate.
pub type CoreResult<T> = Result<T, CoreError>;
