// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration tests.
//!
//! - [`Cluster`]: N in-process nodes on manual clocks, wired pairwise
//! - [`RecordingSink`]: a `PeerSink` that records batches and can be cut

#![allow(dead_code)]

pub mod cluster;
pub mod recording_sink;

pub use cluster::*;
pub use recording_sink::*;
