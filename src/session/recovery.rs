//! Classification of server-initiated closes and the recovery policy table.

use rand::Rng;
use std::time::Duration;
use thiserror::Error;

/// Retry attempts for a document that is still unloading on the server.
pub const MAX_DOC_UNLOADING_ATTEMPTS: u32 = 10;

/// Reason token carried by a `close:` command or a transport close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    OwnerTermination,
    Idle,
    Oom,
    ShuttingDown,
    DocDisconnected,
    Recycling,
    DocumentConflict,
    VersionRestorePrerestoreAck,
    ReloadAfterRename,
    Unclassified(String),
}

impl CloseReason {
    pub fn classify(reason: &str) -> Self {
        let reason = reason.trim();
        match reason {
            "ownertermination" => CloseReason::OwnerTermination,
            "idle" => CloseReason::Idle,
            "oom" => CloseReason::Oom,
            "shuttingdown" => CloseReason::ShuttingDown,
            "docdisconnected" => CloseReason::DocDisconnected,
            "recycling" => CloseReason::Recycling,
            _ => {
                if reason.starts_with("documentconflict") {
                    CloseReason::DocumentConflict
                } else if reason.starts_with("versionrestore:") {
                    let detail = reason["versionrestore:".len()..].trim();
                    if detail == "prerestore_ack" {
                        CloseReason::VersionRestorePrerestoreAck
                    } else {
                        CloseReason::Unclassified(reason.to_string())
                    }
                } else if reason.starts_with("reloadafterrename") {
                    CloseReason::ReloadAfterRename
                } else {
                    CloseReason::Unclassified(reason.to_string())
                }
            }
        }
    }

    pub fn policy(&self) -> RecoveryPolicy {
        match self {
            CloseReason::OwnerTermination => RecoveryPolicy::CloseSession,
            CloseReason::Idle | CloseReason::Oom => RecoveryPolicy::DocumentIdle,
            CloseReason::ShuttingDown => RecoveryPolicy::PassiveWait,
            CloseReason::DocDisconnected => RecoveryPolicy::Reconnect,
            CloseReason::Recycling => RecoveryPolicy::RecyclingPoll,
            CloseReason::DocumentConflict => RecoveryPolicy::ConflictPrompt,
            CloseReason::VersionRestorePrerestoreAck | CloseReason::ReloadAfterRename => {
                RecoveryPolicy::ForceReload
            }
            CloseReason::Unclassified(_) => RecoveryPolicy::Reconnect,
        }
    }
}

/// What the engine does about a classified close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPolicy {
    /// Terminal notice; the whole session ends, no retry.
    CloseSession,
    /// Suppress auto-reconnect until a user gesture reactivates.
    DocumentIdle,
    /// Server is auto-saving and will close the socket itself.
    PassiveWait,
    /// Standard reconnection after a minimal scheduling delay.
    Reconnect,
    /// Randomized backoff polling, to avoid a reconnection stampede.
    RecyclingPoll,
    /// User decides: discard / overwrite / save-as / cancel.
    ConflictPrompt,
    /// Reload and reactivate the document.
    ForceReload,
}

/// Uniform random delay in [5000, 10000) ms before a recycling retry, so
/// many concurrently evicted clients do not reconnect at once.
pub fn recycling_backoff<R: Rng>(rng: &mut R) -> Duration {
    Duration::from_millis(rng.gen_range(5_000..10_000))
}

/// Quadratic backoff for `docunloading`: attempt `n` waits `500 * n^2` ms.
/// `None` once the attempt cap is exhausted — give up instead.
pub fn doc_unloading_backoff(attempt: u32) -> Option<Duration> {
    if attempt == 0 || attempt > MAX_DOC_UNLOADING_ATTEMPTS {
        return None;
    }
    Some(Duration::from_millis(500 * u64::from(attempt) * u64::from(attempt)))
}

/// Protocol-level conditions with no automatic recovery: the connection is
/// permanently closed and only an explicit reload can recover.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FatalError {
    #[error("Unsupported server version.")]
    UnsupportedServerVersion,
    #[error("The server ran out of disk space.")]
    DiskFull,
    #[error("You are not authorized to open this document: {0}")]
    Unauthorized(String),
    #[error("The connection limit of this server has been reached.")]
    HardLimitReached,
    #[error("Service is unavailable. Please try again later.")]
    ServiceUnavailable,
    #[error("Failed to load the document.")]
    FailedDocLoading,
    #[error("Timed out while loading the document.")]
    DocLoadTimeout,
    #[error("The document is taking too long to unload; giving up.")]
    DocUnloadingGiveUp,
    #[error("Session terminated by the document owner.")]
    OwnerTermination,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn classifies_every_table_row() {
        assert_eq!(
            CloseReason::classify("ownertermination"),
            CloseReason::OwnerTermination
        );
        assert_eq!(CloseReason::classify("idle"), CloseReason::Idle);
        assert_eq!(CloseReason::classify("oom"), CloseReason::Oom);
        assert_eq!(CloseReason::classify("shuttingdown"), CloseReason::ShuttingDown);
        assert_eq!(
            CloseReason::classify("docdisconnected"),
            CloseReason::DocDisconnected
        );
        assert_eq!(CloseReason::classify("recycling"), CloseReason::Recycling);
        assert_eq!(
            CloseReason::classify("documentconflict"),
            CloseReason::DocumentConflict
        );
        assert_eq!(
            CloseReason::classify("versionrestore: prerestore_ack"),
            CloseReason::VersionRestorePrerestoreAck
        );
        assert_eq!(
            CloseReason::classify("reloadafterrename"),
            CloseReason::ReloadAfterRename
        );
        assert_eq!(
            CloseReason::classify("something else"),
            CloseReason::Unclassified("something else".into())
        );
    }

    #[test]
    fn policies_match_the_table() {
        assert_eq!(
            CloseReason::OwnerTermination.policy(),
            RecoveryPolicy::CloseSession
        );
        assert_eq!(CloseReason::Idle.policy(), RecoveryPolicy::DocumentIdle);
        assert_eq!(CloseReason::Oom.policy(), RecoveryPolicy::DocumentIdle);
        assert_eq!(CloseReason::ShuttingDown.policy(), RecoveryPolicy::PassiveWait);
        assert_eq!(CloseReason::Recycling.policy(), RecoveryPolicy::RecyclingPoll);
        assert_eq!(
            CloseReason::DocumentConflict.policy(),
            RecoveryPolicy::ConflictPrompt
        );
        assert_eq!(
            CloseReason::ReloadAfterRename.policy(),
            RecoveryPolicy::ForceReload
        );
        assert_eq!(
            CloseReason::Unclassified("x".into()).policy(),
            RecoveryPolicy::Reconnect
        );
    }

    #[test]
    fn doc_unloading_backoff_is_quadratic_and_capped() {
        // .5, 2, 4.5, 8, 12.5, 18, 24.5, 32, 40.5, 50 seconds
        for n in 1..=MAX_DOC_UNLOADING_ATTEMPTS {
            assert_eq!(
                doc_unloading_backoff(n),
                Some(Duration::from_millis(500 * u64::from(n) * u64::from(n)))
            );
        }
        assert_eq!(doc_unloading_backoff(0), None);
        assert_eq!(doc_unloading_backoff(MAX_DOC_UNLOADING_ATTEMPTS + 1), None);
    }

    #[test]
    fn recycling_backoff_stays_in_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            let delay = recycling_backoff(&mut rng);
            assert!(delay >= Duration::from_millis(5_000));
            assert!(delay < Duration::from_millis(10_000));
        }
    }
}
