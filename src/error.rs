use thiserror::Error;

/// Unified error type for all netlease operations.
///
/// Provides detailed, actionable error messages with context about what
/// operation failed, which interface was involved, and the underlying cause.
///
/// Note that malformed *network* input is never surfaced through this type:
/// per the protocol engines' contract a bad datagram is logged and dropped
/// while the engine keeps waiting on its existing retransmission timer. This
/// enum covers local failures (identity derivation, lease storage, message
/// construction, transport setup) that the immediate caller must see.
#[derive(Error, Debug)]
pub enum NetleaseError {
    // Identity errors
    #[error("No viable client identifier for interface '{interface}': {reason}")]
    NoIdentity { interface: String, reason: String },

    #[error("Failed to {operation} DUID: {reason}")]
    DuidError { operation: String, reason: String },

    // Message construction errors
    #[error("Message for '{interface}' would exceed maximum size {limit} bytes (needed {needed})")]
    MessageTooBig {
        interface: String,
        limit: usize,
        needed: usize,
    },

    #[error("Option {code} payload of {len} bytes does not fit the option encoding")]
    OptionTooLong { code: u16, len: usize },

    // Parse errors (used by the codecs; engines convert these into
    // log-and-drop, never into state changes)
    #[error("Truncated {what}: need {need} bytes, have {have}")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },

    #[error("Invalid {proto} packet on '{interface}': {reason}")]
    InvalidPacket {
        proto: &'static str,
        interface: String,
        reason: String,
    },

    #[error("Authentication failed on '{interface}': {reason}")]
    AuthFailed { interface: String, reason: String },

    // Lease lifecycle errors
    #[error("No lease state for interface index {ifindex}")]
    NoSuchInterface { ifindex: u32 },

    #[error("Interface '{interface}' already has an active {proto} state")]
    AlreadyStarted {
        interface: String,
        proto: &'static str,
    },

    // Collaborator errors
    #[error("Lease store {operation} failed for '{key}': {source}")]
    Store {
        operation: String,
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Transport {operation} failed on '{interface}': {source}")]
    Transport {
        operation: String,
        interface: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to apply address {address} to '{interface}': {reason}")]
    AddressApply {
        address: String,
        interface: String,
        reason: String,
    },

    // Generic errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error during {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, NetleaseError>;

// Helper methods for common error construction patterns
impl NetleaseError {
    /// Create an IO error with context
    pub fn io_error(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a parse error for the given protocol and interface
    pub fn invalid_packet(
        proto: &'static str,
        interface: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidPacket {
            proto,
            interface: interface.into(),
            reason: reason.into(),
        }
    }

    /// Create a lease store error with context
    pub fn store_error(
        operation: impl Into<String>,
        key: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Store {
            operation: operation.into(),
            key: key.into(),
            source,
        }
    }
}
