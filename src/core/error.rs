//! Error handling for repogen
//!
//! This module provides the typed error taxonomy for the manifest generation
//! core. The error system is designed around two principles:
//! 1. **Strongly-typed errors** so the orchestrator can decide which failures
//!    feed the memoized-failure counters and which are request-shape errors
//! 2. **Sanitizable messages** so randomized working-tree paths never leak to
//!    callers
//!
//! # Error Categories
//!
//! - **Resolution**: [`RenderError::ResolveFailure`]: an ambiguous revision
//!   could not be turned into a concrete identifier. Never retried at this
//!   layer, never silently substituted.
//! - **Acquisition**: [`RenderError::AcquisitionFailure`],
//!   [`RenderError::OutOfBoundsSymlink`] and
//!   [`RenderError::ExtractionSizeExceeded`]: producing a local working tree
//!   failed.
//! - **Rendering**: [`RenderError::RenderFailure`],
//!   [`RenderError::PluginFailure`] and [`RenderError::CombinedSizeExceeded`]
//!   are subject to failure memoization by the orchestrator.
//! - **Request shape**: the cross-reference errors
//!   ([`RenderError::UnresolvedReference`],
//!   [`RenderError::ReferenceNotAllowed`],
//!   [`RenderError::InconsistentReferenceRevisions`],
//!   [`RenderError::InconsistentPrimaryReference`]) are deterministic
//!   failures of the request itself.
//! - **Infrastructure**: [`RenderError::CacheStoreFailure`],
//!   [`RenderError::Cancelled`].
//!
//! Internal layers either succeed or return an error; only the orchestrator
//! interacts with the negative-entry cache, using [`RenderError`] variants to
//! classify what it propagates.

use thiserror::Error;

use crate::render::RenderStrategy;

/// The main error type for manifest generation operations.
///
/// Most functions in this crate return `anyhow::Result`; typed variants are
/// attached with `.into()` and recovered with `downcast_ref` where a caller
/// needs to branch on the failure class.
#[derive(Debug, Error)]
pub enum RenderError {
    /// An ambiguous revision (branch, tag, semver range, floating tag) could
    /// not be resolved to a concrete immutable identifier.
    #[error("failed to resolve revision {revision:?} for {url}: {reason}")]
    ResolveFailure {
        /// Repository or registry URL the resolution ran against.
        url: String,
        /// The ambiguous revision as supplied by the caller.
        revision: String,
        /// Backend-provided failure detail.
        reason: String,
    },

    /// Producing a local working tree failed: network, checkout, or
    /// extraction error.
    #[error("source acquisition failed: {reason}")]
    AcquisitionFailure {
        /// What went wrong, already sanitized of credentials.
        reason: String,
    },

    /// A symlink inside an acquired tree resolves outside the tree root.
    #[error("source contains out-of-bounds symlinks. file: {file}")]
    OutOfBoundsSymlink {
        /// Path of the offending symlink, relative to the tree root.
        file: String,
    },

    /// Uncompressed archive contents exceeded the configured byte cap.
    #[error("extraction exceeded the maximum size of {limit} bytes")]
    ExtractionSizeExceeded {
        /// The configured cap in bytes.
        limit: u64,
    },

    /// The combined size of candidate manifest files in a directory exceeded
    /// the configured budget.
    #[error("exceeded max combined manifest file size")]
    CombinedSizeExceeded,

    /// A render strategy failed to produce manifests.
    #[error("{strategy} rendering failed: {detail}")]
    RenderFailure {
        /// Which strategy was running.
        strategy: RenderStrategy,
        /// Engine-provided failure detail.
        detail: String,
    },

    /// The plugin streaming protocol failed.
    #[error("plugin failure during {phase}: {message}")]
    PluginFailure {
        /// Protocol phase: `connect`, `configuration`, `stream`, `response`.
        phase: String,
        /// Failure detail.
        message: String,
    },

    /// A `$token/...` value-file path names a reference that no source in
    /// the request declares.
    #[error("source referenced {token:?}, which is not one of the available sources ({available})")]
    UnresolvedReference {
        /// The `$`-prefixed token that failed to resolve.
        token: String,
        /// Comma-separated roster of tokens the request does declare.
        available: String,
    },

    /// A reference points at a chart source; charts cannot be referenced.
    #[error("source {token:?} has a 'chart' field defined, but charts are not supported for referenced sources")]
    ReferenceNotAllowed {
        /// The offending token.
        token: String,
    },

    /// Two references name the same canonical URL under different target
    /// revisions.
    #[error(
        "cannot reference multiple revisions for the same repository \
         ({token} references {revision:?} while {other_token} references {other_revision:?})"
    )]
    InconsistentReferenceRevisions {
        /// Token of the later, conflicting reference.
        token: String,
        /// Its target revision.
        revision: String,
        /// Token that referenced the repository first.
        other_token: String,
        /// The first reference's target revision.
        other_revision: String,
    },

    /// A reference names the same repository as the primary source but
    /// resolves to a different commit.
    #[error(
        "cannot reference a different revision of the same repository \
         ({token} references {revision:?} which resolves to {resolved} while the application \
         references {primary_revision:?} which resolves to {primary_resolved})"
    )]
    InconsistentPrimaryReference {
        /// The offending token.
        token: String,
        /// The reference's target revision.
        revision: String,
        /// What the reference resolved to.
        resolved: String,
        /// The primary source's target revision.
        primary_revision: String,
        /// What the primary source resolved to.
        primary_resolved: String,
    },

    /// The backing key-value store failed (not a miss).
    #[error("cache store failure: {0}")]
    CacheStoreFailure(String),

    /// The request was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,

    /// A git subprocess failed.
    #[error("git {operation} failed: {stderr}")]
    GitCommandError {
        /// The git subcommand that failed.
        operation: String,
        /// Captured stderr of the failing invocation.
        stderr: String,
    },

    /// A path supplied by the request escapes the tree it must stay within.
    #[error("{path}: app path is outside root dir")]
    PathOutsideRepository {
        /// The offending path as supplied.
        path: String,
    },
}

impl RenderError {
    /// Whether this error should feed the memoized-failure counters.
    ///
    /// Request-shape errors and cancellations are deterministic properties of
    /// the request (or of its caller going away), so pausing generation for
    /// them only hides the real problem. Cache-store failures are excluded so
    /// a cache outage cannot push every key into the paused state.
    #[must_use]
    pub fn counts_toward_failure_backoff(&self) -> bool {
        !matches!(
            self,
            Self::Cancelled
                | Self::CacheStoreFailure(_)
                | Self::UnresolvedReference { .. }
                | Self::ReferenceNotAllowed { .. }
                | Self::InconsistentReferenceRevisions { .. }
                | Self::InconsistentPrimaryReference { .. }
        )
    }
}
