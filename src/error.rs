//! Unified error type for the public partitioner APIs.

use thiserror::Error;

/// Unified error type for partitioner operations.
///
/// Convergence shortfalls are *not* errors; they are reported through flags
/// in [`crate::metrics::PartitionMetrics`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PartError {
    /// Settings are internally inconsistent. Detected on every rank before
    /// any collective runs.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Two vectors that must share a row distribution disagree on local sizes.
    #[error("wrong distribution in {context}: local sizes {left} vs {right}")]
    WrongDistribution {
        context: &'static str,
        left: usize,
        right: usize,
    },

    /// The input graph violates a structural requirement (self-loop,
    /// duplicate edge, asymmetry, column out of range).
    #[error("inconsistent input: {0}")]
    InconsistentInput(String),

    /// A collective operation or halo update failed.
    #[error("collective `{op}` failed on rank {rank}: {detail}")]
    Collective {
        op: &'static str,
        rank: usize,
        detail: String,
    },
}

impl PartError {
    /// Exit code for process drivers: 126 for configuration errors,
    /// non-zero otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            PartError::InvalidConfiguration(_) => 126,
            _ => 1,
        }
    }

    pub(crate) fn collective<C: crate::comm::Communicator + ?Sized>(
        comm: &C,
        op: &'static str,
        detail: impl Into<String>,
    ) -> Self {
        PartError::Collective {
            op,
            rank: comm.rank(),
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(
            PartError::InvalidConfiguration("k = 0".into()).exit_code(),
            126
        );
        assert_eq!(
            PartError::WrongDistribution {
                context: "cut",
                left: 3,
                right: 4
            }
            .exit_code(),
            1
        );
    }
}
