//! Error types for the cross-site replication subsystem.

use thiserror::Error;

/// Errors that can occur in the cross-site replication subsystem.
#[derive(Debug, Error)]
pub enum XSiteError {
    /// The remote site did not answer in time.
    #[error("timeout waiting for site {site}")]
    Timeout {
        /// The backup site that timed out.
        site: String,
    },

    /// The remote site cannot be reached (no route, link down).
    #[error("site {site} is unreachable")]
    SiteUnreachable {
        /// The unreachable backup site.
        site: String,
    },

    /// The remote site is currently suspected by the site view.
    #[error("site {site} is suspected")]
    SiteSuspected {
        /// The suspected backup site.
        site: String,
    },

    /// A node of the local cluster cannot be reached.
    #[error("node {node} is unreachable")]
    NodeUnreachable {
        /// The unreachable node.
        node: u64,
    },

    /// The site name is not a configured backup.
    #[error("unknown site: {site}")]
    UnknownSite {
        /// The unknown site name.
        site: String,
    },

    /// The remote side rejected the request.
    #[error("request rejected: {msg}")]
    Rejected {
        /// Reason given by the remote side.
        msg: String,
    },

    /// A merge policy failed to resolve a conflict.
    #[error("merge policy failed for key: {msg}")]
    MergeFailed {
        /// Error message from the policy.
        msg: String,
    },

    /// Invalid or unreadable configuration.
    #[error("configuration error: {msg}")]
    Config {
        /// Error message describing the problem.
        msg: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// The component was shut down.
    #[error("cross-site replication shut down")]
    Shutdown,
}

impl XSiteError {
    /// Returns true for link failures that should engage the backoff policy.
    ///
    /// These never reach the writer; the key stays pending and is retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            XSiteError::Timeout { .. }
                | XSiteError::SiteUnreachable { .. }
                | XSiteError::SiteSuspected { .. }
                | XSiteError::NodeUnreachable { .. }
        )
    }
}

/// Result alias for the cross-site replication subsystem.
pub type Result<T> = std::result::Result<T, XSiteError>;
