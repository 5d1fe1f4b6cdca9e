use thiserror::Error;

use super::ProcessId;

/// Startup misconfiguration. The only condition that stops a process.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("membership must satisfy n = 3f + 1, got n = {n}, f = {f}")]
    InvalidMembership { n: usize, f: usize },

    #[error("process {id} is outside the membership of {n}")]
    UnknownProcess { id: ProcessId, n: usize },

    #[error("expected {expected} public keys, got {actual}")]
    KeyCount { expected: usize, actual: usize },

    #[error("expected {expected} inputs, got {actual}")]
    InputCount { expected: usize, actual: usize },
}

/// Why an incoming message was filtered out.
///
/// Every variant is local and non-fatal: the message is dropped (or not
/// counted) and the process carries on.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("transport reported sender {actual} for a message claiming {claimed}")]
    UnverifiedSender { claimed: ProcessId, actual: ProcessId },

    #[error("signature check failed for sender {0}")]
    BadSignature(ProcessId),

    #[error("sender {0} already has a counted response for this rank and step")]
    DuplicateSenderResponse(ProcessId),

    #[error("message already processed")]
    DuplicateMessage,

    #[error("rank {rank} is outside the window around current rank {current}")]
    StaleOrFutureRank { rank: u64, current: u64 },

    #[error("malformed value: {0}")]
    MalformedValue(String),

    #[error("sender {0} is not a member")]
    UnknownSender(ProcessId),

    #[error("sender {sender} has too many messages buffered for rank {rank}")]
    FutureQuotaExceeded { rank: u64, sender: ProcessId },
}

/// Transport failures. Logged by the caller, never fatal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("no route to process {0}")]
    UnknownPeer(ProcessId),

    #[error("channel to process {0} is closed")]
    Closed(ProcessId),
}

/// Why a preproposal set or a decided proposal value was refused.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PreconsensusError {
    #[error("{got} preproposals from distinct members, need {need}")]
    TooFewPreProposals { got: usize, need: usize },

    #[error("process {0} preproposed more than once")]
    DuplicatePreProposal(ProcessId),

    #[error("sender {0} is not a member")]
    UnknownSender(ProcessId),

    #[error("{count} frontiers exceed the limit of {max}")]
    TooManyFrontiers { count: usize, max: usize },

    #[error("proposal of {0} bytes does not fit in a consensus value")]
    ProposalTooLarge(usize),

    #[error("malformed proposal: {0}")]
    MalformedProposal(String),
}
