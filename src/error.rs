//! Error types for corral.
//!
//! Error messages follow a consistent format:
//!
//! - **Format**: `"<operation> failed: <reason>"` or `"<entity> not found: <identifier>"`
//! - **Case**: all lowercase (Rust convention for error messages)
//! - **Context**: include the VM id, path, or device id when available

use thiserror::Error;

/// Result type alias using corral's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in corral operations.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// A VM configuration was rejected before launch.
    #[error("invalid config: {0}")]
    Config(String),

    // ========================================================================
    // Lifecycle Errors
    // ========================================================================
    /// Launch-time failure (tap creation, spawn, QMP connect, VNC bind).
    /// Leaves the VM in the error state.
    #[error("launch failed: {0}")]
    Launch(String),

    /// Operation called in a state that forbids it.
    #[error("invalid vm state: expected {expected}, vm {id} is {actual}")]
    InvalidState {
        /// VM id.
        id: u32,
        /// State the operation requires.
        expected: String,
        /// State the VM is actually in.
        actual: String,
    },

    /// Convenience guard for operations that need a running VM.
    #[error("vm not running: {0}")]
    NotRunning(u32),

    /// VM not found in the host table.
    #[error("vm not found: {0}")]
    VmNotFound(String),

    /// Two VMs cannot coexist (shared non-snapshot disk, name, or network).
    #[error("vm conflict with {name}: {reason}")]
    Conflict {
        /// Name of the conflicting VM.
        name: String,
        /// What clashed.
        reason: String,
    },

    // ========================================================================
    // Device Errors
    // ========================================================================
    /// Hotplug table or device failure.
    #[error("hotplug failed: {0}")]
    Hotplug(String),

    /// No cdrom present for an eject/change operation.
    #[error("no cdrom inserted")]
    NoCdrom,

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// QMP protocol or socket failure, returned verbatim to the caller.
    #[error("qmp: {0}")]
    Qmp(String),

    /// The QMP peer returned an error response.
    #[error("qmp error response: {0}")]
    QmpResponse(String),

    /// VNC shim failure.
    #[error("vnc shim failed: {0}")]
    Vnc(String),

    // ========================================================================
    // Collaborator Errors
    // ========================================================================
    /// Bridge/tap collaborator failure.
    #[error("bridge operation failed: {operation}: {reason}")]
    Bridge {
        /// The operation that failed (e.g. "create tap", "destroy tap").
        operation: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Screenshot conversion failure.
    #[error("screenshot failed: {0}")]
    Screenshot(String),

    /// Migration query returned something undecodable.
    #[error("migrate status undecodable: {0}")]
    Migrate(String),

    // ========================================================================
    // IO Errors
    // ========================================================================
    /// IO error wrapper.
    #[error("io operation failed: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config(reason.into())
    }

    /// Create a launch error.
    pub fn launch(reason: impl Into<String>) -> Self {
        Self::Launch(reason.into())
    }

    /// Create a state-guard error.
    pub fn invalid_state(id: u32, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::InvalidState {
            id,
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a hotplug error.
    pub fn hotplug(reason: impl Into<String>) -> Self {
        Self::Hotplug(reason.into())
    }

    /// Create a QMP transport error.
    pub fn qmp(reason: impl Into<String>) -> Self {
        Self::Qmp(reason.into())
    }

    /// Create a VNC shim error.
    pub fn vnc(reason: impl Into<String>) -> Self {
        Self::Vnc(reason.into())
    }

    /// Create a bridge collaborator error.
    pub fn bridge(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Bridge {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a conflict error.
    pub fn conflict(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conflict {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_context() {
        let err = Error::invalid_state(7, "RUNNING", "QUIT");
        let msg = err.to_string();
        assert!(msg.contains('7'));
        assert!(msg.contains("RUNNING"));
        assert!(msg.contains("QUIT"));

        let err = Error::bridge("create tap", "no such bridge");
        assert!(err.to_string().contains("create tap"));
    }

    #[test]
    fn messages_are_lowercase() {
        let errors = [
            Error::config("x"),
            Error::launch("x"),
            Error::NotRunning(0),
            Error::hotplug("x"),
            Error::qmp("x"),
            Error::NoCdrom,
        ];
        for err in errors {
            let msg = err.to_string();
            assert!(msg.chars().next().unwrap().is_lowercase(), "{}", msg);
        }
    }
}
