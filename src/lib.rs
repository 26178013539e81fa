// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! stagedl - Concurrent, resumable downloads with weakly-held observers
//!
//! Requests are keyed by their source locator. A single task manager owns
//! every in-flight task, a transfer engine moves the bytes into staging
//! files, and lifecycle events are fanned out to observers that can simply
//! be dropped when they lose interest.
//!
//! # Core Modules
//!
//! - [`downloader`] - The [`Downloader`] facade
//! - [`download`] - Task records, lifecycle events, and the task manager
//! - [`engine`] - The [`TransferEngine`] trait and the HTTP engine
//! - [`observer`] - Observer trait and registry
//! - [`config`] - Settings file and environment overrides
//! - [`error`] - Transfer error types

pub mod config;
pub mod download;
pub mod downloader;
pub mod engine;
pub mod error;
pub mod locks;
pub mod observer;

pub use config::DownloaderConfig;
pub use download::{DownloadEvent, DownloadHints, TaskManager, TaskRecord, TaskState, TransferId};
pub use downloader::{CompletionCallback, Downloader};
pub use engine::{EngineEvent, EngineEventKind, EventSink, HttpEngine, TransferEngine, TransferRequest};
pub use error::TransferError;
pub use observer::{DownloadObserver, ObserverRegistry};
