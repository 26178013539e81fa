// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Task bookkeeping for stagedl
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐ commands ┌─────────────────┐  start/pause/...  ┌────────────────┐
//! │ Downloader      │─────────▶│ TaskManager     │──────────────────▶│ TransferEngine │
//! │ (facade)        │          │ worker (tokio)  │◀──────────────────│                │
//! └─────────────────┘          └────────┬────────┘   engine events   └────────────────┘
//!                                       │ DownloadEvent
//!                                       ▼
//!                              ┌─────────────────┐
//!                              │ ObserverRegistry│
//!                              └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use stagedl::{DownloadHints, Downloader, DownloaderConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let downloader = Downloader::with_http(&DownloaderConfig::default())?;
//! downloader.download_with(
//!     "https://example.com/track.mp3",
//!     DownloadHints::default().with_file_name("track.mp3"),
//! );
//!
//! // Queries observe every command submitted before them
//! assert!(downloader.has_task("https://example.com/track.mp3").await);
//! # Ok(())
//! # }
//! ```

pub mod events;
pub mod manager;
pub mod types;

// Re-export commonly used items
pub use events::DownloadEvent;
pub use manager::TaskManager;
pub use types::{DownloadHints, TaskRecord, TaskState, TransferId};
