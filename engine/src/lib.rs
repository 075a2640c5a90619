// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! The runtime core of the engine: a general-purpose allocator built on
//! virtual memory pages, a lock-free job system, and a streaming asset layer
//! driven by the job system. Everything here sits on the [`platform`] crate's
//! [`Platform`](platform::Platform) trait and nothing else.
//!
//! The subsystems hold their state in process-wide statically sized tables,
//! initialized explicitly: call [`jobs::init_job_system`] once before using
//! the allocator, jobs, or assets, and [`jobs::kill_job_system`] to tear the
//! workers down. There are no implicit static constructors, so the
//! initialization order between modules stays visible in the calling code.

#![no_std]

#[cfg(test)]
extern crate std;

pub mod assets;
mod cell;
pub mod collections;
pub mod entity;
pub mod jobs;
pub mod memory;
pub mod serialization;
mod sys;

#[cfg(test)]
mod test_support;
