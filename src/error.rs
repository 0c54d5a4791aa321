use thiserror::Error;

pub type ClientResult<T> = Result<T, ClientError>;

/// Everything a call against the document server can fail with.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("file is {size} bytes, the limit is {max} bytes")]
    FileTooLarge { size: u64, max: u64 },

    #[error("an upload is already in progress")]
    Busy,

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("{0}")]
    Application(String),

    #[error("stopped by user")]
    Cancelled,

    #[error("could not decode server response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("asset cache error: {0}")]
    Cache(#[from] rusqlite::Error),
}

impl ClientError {
    /// Connection failures and non-2xx statuses share one generic message.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, ClientError::Transport(_) | ClientError::Status { .. })
    }

    /// Text shown inline in the chat or in the status line.
    pub fn user_message(&self) -> String {
        match self {
            ClientError::FileTooLarge { size, .. } => format!(
                "The selected file ({:.2} MB) is too large. Please choose a file smaller than 100 MB.",
                *size as f64 / (1024.0 * 1024.0)
            ),
            ClientError::Busy => "An upload is already in progress.".to_string(),
            err if err.is_connectivity() => {
                "Could not reach the server. Please check your connection.".to_string()
            }
            ClientError::Application(message) => format!("Error: {}", message),
            ClientError::Cancelled => "Stopped by user.".to_string(),
            other => format!("Error: {}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_errors_render_as_connectivity_failures() {
        let err = ClientError::Status { status: 502, body: "bad gateway".into() };
        assert!(err.is_connectivity());
        assert!(err.user_message().contains("Could not reach the server"));
    }

    #[test]
    fn application_errors_carry_the_server_message() {
        let err = ClientError::Application("no such source".into());
        assert!(!err.is_connectivity());
        assert_eq!(err.user_message(), "Error: no such source");
    }

    #[test]
    fn size_error_reports_megabytes() {
        let err = ClientError::FileTooLarge { size: 150 * 1024 * 1024, max: 99 * 1024 * 1024 };
        assert!(err.user_message().contains("150.00 MB"));
    }

    #[test]
    fn cancellation_is_not_a_connectivity_failure() {
        let err = ClientError::Cancelled;
        assert!(!err.is_connectivity());
        assert_eq!(err.user_message(), "Stopped by user.");
    }
}
