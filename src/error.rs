use thiserror::Error;

/// Frame-chain invariant violations. All of these indicate a venue or
/// decoding bug, so the session supervisor treats them as fatal.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("mismatched user on frame chain: prev={prev}, next={next}")]
    UserMismatch { prev: String, next: String },
    #[error("server time not strictly increasing: prev={prev}, next={next}")]
    ServerTimeOrder { prev: i64, next: i64 },
    #[error("clearinghouse time decreased: prev={prev}, next={next}")]
    ClearinghouseTimeOrder { prev: i64, next: i64 },
    #[error("next pointer already linked at seq {seq}")]
    NextAlreadyLinked { seq: u64 },
    #[error("cross-link requires distinct users: {user}")]
    CrossLinkSameUser { user: String },
    #[error("cross-link clearinghouse time mismatch: {left} vs {right}")]
    CrossLinkTimeMismatch { left: i64, right: i64 },
    #[error("frame already cross-linked to a different partner")]
    CrossLinkConflict,
}
