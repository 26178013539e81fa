// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for transfer engines.
//!
//! Nothing here crosses the [`Downloader`](crate::Downloader) boundary as a
//! `Result`. A failed transfer is reported to the task manager as text on the
//! engine's failure event and reaches observers as a cancellation.

use std::time::Duration;

use thiserror::Error;

/// Why a single transfer stopped before producing its destination file.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The HTTP client failed to connect, send, or read the body.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Creating, writing, or renaming the staging file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The server answered with a non-success status.
    #[error("server responded with status {0}")]
    Status(u16),

    /// No bytes arrived within the configured timeout.
    #[error("transfer stalled for longer than {0:?}")]
    Timeout(Duration),
}
