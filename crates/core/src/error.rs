use thiserror::Error;

/// Shared error type used across all matrixsync crates.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("RPC timed out after {attempts} attempts: {call}")]
    RpcTimeout { call: String, attempts: u32 },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Referrer {referrer} of user {user_id} cannot be resolved")]
    UnresolvedReferrer { user_id: u64, referrer: String },

    #[error("No local user for wallet {0}")]
    UnknownUser(String),

    #[error("User {user_id} would reference missing user {referenced}")]
    DanglingReference { user_id: i64, referenced: String },

    #[error(transparent)]
    Other(#[from] eyre::Error),
}

impl AppError {
    /// Local state lags the chain or the chain was unreachable: the event must
    /// be retried on a later pass rather than dropped.
    pub fn is_deferrable(&self) -> bool {
        matches!(
            self,
            AppError::UnresolvedReferrer { .. }
                | AppError::UnknownUser(_)
                | AppError::RpcTimeout { .. }
                | AppError::Rpc(_)
        )
    }

    /// The store cannot be written at all; the current processing cycle aborts.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, AppError::Database(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lagging_state_is_deferrable() {
        assert!(AppError::UnknownUser("0xabc".into()).is_deferrable());
        assert!(
            AppError::UnresolvedReferrer {
                user_id: 7,
                referrer: "0xabc".into()
            }
            .is_deferrable()
        );
        assert!(
            AppError::RpcTimeout {
                call: "totalUsers".into(),
                attempts: 3
            }
            .is_deferrable()
        );
    }

    #[test]
    fn integrity_and_decode_errors_are_not_retried() {
        assert!(!AppError::Decode("bad topics".into()).is_deferrable());
        assert!(
            !AppError::DanglingReference {
                user_id: 2,
                referenced: "9".into()
            }
            .is_deferrable()
        );
        assert!(AppError::Database("pool closed".into()).is_store_unavailable());
        assert!(!AppError::Database("pool closed".into()).is_deferrable());
    }
}
