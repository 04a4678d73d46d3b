pub mod chats;
pub mod messages;
pub mod polls;

use anyhow::anyhow;

use crate::error::AppError;

/// Logs the driver error and hides it behind a generic internal error.
pub(crate) fn db_error(action: &'static str) -> impl FnOnce(sqlx::Error) -> AppError {
    move |e| {
        tracing::error!(error = %e, "{}", action);
        AppError::InternalServerError(anyhow!(action))
    }
}
