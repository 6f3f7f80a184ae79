// Streamshelf - Offline Video Downloads for Mobile
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Error types for Streamshelf
//!
//! This module defines error types using thiserror for ergonomic error handling.
//! Errors are categorized by domain (transport, storage, files, configuration)
//! so callers can decide between a user-facing toast and a silent log entry.
//!
//! ## Transport errors
//! Failures reported by a download transport are classified by [`TransportError`]
//! purely for user-facing messaging. Every classification ends in the same cleanup path
//! inside the queue manager. A cancellation reported as an error is not a failure and
//! is routed through the cancellation path instead.

use thiserror::Error;

/// Result type alias using our ShelfError type
pub type Result<T> = std::result::Result<T, ShelfError>;

/// Classified failure reported by a download transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Host unreachable, DNS failure, connection reset or timeout
    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    /// TLS or authentication challenge the transport could not satisfy (HTTP 401/407)
    #[error("Authentication challenge failed: {0}")]
    AuthChallenge(String),

    /// CDN refused the request, usually an anti-hotlinking check
    #[error("Access forbidden (HTTP 403)")]
    Forbidden,

    /// Any other non-2xx response
    #[error("Server responded with HTTP {0}")]
    HttpStatus(u16),

    /// The transport stopped because the download was cancelled
    #[error("Transport cancelled")]
    Cancelled,

    /// Anything else (I/O while writing, malformed playlists, decryption)
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Classify a reqwest failure
    ///
    /// TLS failures surface as connect errors, so the source chain is checked first.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16());
        }
        if let Some(message) = tls_failure(err) {
            return TransportError::AuthChallenge(message);
        }
        if err.is_connect() || err.is_timeout() {
            return TransportError::NetworkUnreachable(err.to_string());
        }
        TransportError::Other(err.to_string())
    }

    /// Classify a non-success HTTP status code
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 407 | 495 | 496 => TransportError::AuthChallenge(format!("HTTP {}", status)),
            403 => TransportError::Forbidden,
            _ => TransportError::HttpStatus(status),
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }

    /// Message suitable for a transient toast
    pub fn user_message(&self) -> String {
        match self {
            TransportError::NetworkUnreachable(_) => {
                "Download failed: no network connection. Check your connection and try again.".to_string()
            }
            TransportError::AuthChallenge(_) => {
                "Download failed: the server requires authentication or a trusted connection.".to_string()
            }
            TransportError::Forbidden => {
                "Download failed: access denied by the server (403). The source may block downloads.".to_string()
            }
            TransportError::HttpStatus(code) => {
                format!("Download failed: server error ({}).", code)
            }
            TransportError::Cancelled => "Download cancelled.".to_string(),
            TransportError::Other(message) => format!("Download failed: {}", message),
        }
    }
}

const TLS_MARKERS: &[&str] = &["certificate", "tls", "handshake"];

/// Message of the first source of `err` that reports a TLS or certificate problem
///
/// The top-level message is skipped since it carries the request URL.
fn tls_failure(err: &(dyn std::error::Error + 'static)) -> Option<String> {
    let mut current = err.source();
    while let Some(e) = current {
        let message = e.to_string();
        let lower = message.to_ascii_lowercase();
        if TLS_MARKERS.iter().any(|marker| lower.contains(marker)) {
            return Some(message);
        }
        current = e.source();
    }
    None
}

/// Main error type for Streamshelf
#[derive(Error, Debug)]
pub enum ShelfError {
    // ===== Download Errors =====

    /// A transport reported a classified failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Invalid download URL format or protocol
    #[error("Invalid download URL: {0}")]
    InvalidDownloadUrl(String),

    /// Playlist text could not be interpreted
    #[error("Invalid playlist: {0}")]
    InvalidPlaylist(String),

    /// Segment decryption failed
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    // ===== File/Storage Errors =====

    /// File or directory not found
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Generic file I/O error
    #[error("File I/O error: {0}")]
    FileIoError(String),

    /// Invalid file path
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    // ===== Database Errors =====

    /// Database schema migration failed
    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    /// Persisted record not found
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    // ===== Validation/State Errors =====

    /// Generic input validation error
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Application state is invalid for the requested operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration file error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Internal error that should not normally occur
    #[error("Internal error: {0}")]
    InternalError(String),

    // ===== External Library Errors =====

    /// HTTP client error from reqwest
    #[error("HTTP client error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    /// Database driver error from sqlx
    #[error("Database error: {0}")]
    SqlxError(#[from] sqlx::Error),

    /// URL parsing error
    #[error("URL parse error: {0}")]
    UrlError(#[from] url::ParseError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<std::string::FromUtf8Error> for ShelfError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        ShelfError::InternalError(format!("UTF-8 conversion error: {}", err))
    }
}

// Helper methods for creating common errors
impl ShelfError {
    /// Create a RecordNotFound error with a resource name
    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        ShelfError::RecordNotFound(resource.into())
    }

    /// Create an InvalidInput error with a message
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        ShelfError::InvalidInput(message.into())
    }

    /// Create an InternalError with a message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        ShelfError::InternalError(message.into())
    }

    /// Check if error is transient (the user may simply retry)
    pub fn is_retryable(&self) -> bool {
        match self {
            ShelfError::Transport(TransportError::NetworkUnreachable(_)) => true,
            ShelfError::Transport(TransportError::HttpStatus(code)) => (500..=599).contains(code),
            ShelfError::ReqwestError(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }

    /// Check if error is related to file/disk operations
    pub fn is_file_error(&self) -> bool {
        matches!(
            self,
            ShelfError::FileNotFound(_)
                | ShelfError::FileIoError(_)
                | ShelfError::InvalidPath(_)
                | ShelfError::IoError(_)
        )
    }

    /// Collapse into a transport classification for a failure callback
    pub fn into_transport_error(self) -> TransportError {
        match self {
            ShelfError::Transport(e) => e,
            ShelfError::ReqwestError(e) => TransportError::from_reqwest(&e),
            other => TransportError::Other(other.to_string()),
        }
    }

    /// Get user-friendly error message suitable for display
    pub fn user_message(&self) -> String {
        match self {
            ShelfError::Transport(e) => e.user_message(),
            ShelfError::InvalidDownloadUrl(url) => {
                format!("This link can't be downloaded: {}", url)
            }
            ShelfError::FileNotFound(_) => {
                "The downloaded file could not be found. Please download it again.".to_string()
            }
            _ => self.to_string(),
        }
    }
}
