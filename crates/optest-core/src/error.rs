use crate::DType;

/// Fatal contract violations. Any of these aborts the current case.
///
/// Fallible APIs return `anyhow::Result`; these values travel inside the
/// `anyhow::Error` and can be recovered with `downcast_ref::<ContractError>()`.
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("unsupported cast from {src} to {dst}")]
    UnsupportedCast { src: DType, dst: DType },

    #[error("shape has {shape} dims but stride has {stride}")]
    RankMismatch { shape: usize, stride: usize },

    #[error("buffer `{what}` holds {actual} bytes, needs at least {required}")]
    BufferTooSmall {
        what: &'static str,
        required: usize,
        actual: usize,
    },

    #[error("device call `{call}` failed with code {code}")]
    Device { call: &'static str, code: i32 },

    #[error("queue fault while waiting on notifier: {0}")]
    QueueFault(String),

    #[error("expected {expected} {what}, found {actual}")]
    CountMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("missing operator name, needed for {0}")]
    MissingOpName(&'static str),

    #[error("cannot {action} in state {state}")]
    InvalidTransition { action: &'static str, state: String },

    #[error("{0} tensors cannot carry an on-chip quantized dtype")]
    QuantizationUnsupported(DType),

    #[error("case rejected by operator `{op}`: {reason}")]
    CaseRejected { op: String, reason: String },
}
