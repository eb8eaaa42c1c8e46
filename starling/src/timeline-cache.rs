// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of starling.
//
// starling is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// starling is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with starling.  If not,
// see <http://www.gnu.org/licenses/>.

//! # The Timeline Cache
//!
//! ## Introduction
//!
//! Each user has a "home timeline": the ordered sequence of tweet ids they should see on their
//! feed, newest-applied at the head. The cache is *authoritative* for this materialisation--
//! nothing rebuilds a timeline from the store on read-- so the contract here carries the
//! pipeline's correctness on its back:
//!
//! 1. **Prepend.** [add_to_timeline](TimelineCache::add_to_timeline) inserts at position 0. Head
//!    order is recency of *application*, not tweet chronology; fan-outs and follow-backfills
//!    interleave, and we promise nothing across authors.
//!
//! 2. **Dedup.** Inserting a tweet id already present is a no-op. This is the lynchpin: the
//!    pipeline is at-least-once, and every redelivery, replay & races between fan-out and
//!    backfill funnels through this one rule to produce an exactly-once *observable* state.
//!
//! 3. **Cap.** After an insert the tail is trimmed beyond the configured maximum, bounding
//!    per-user growth.
//!
//! 4. **Absence is emptiness.** A missing key reads as the empty timeline.
//!
//! [remove_from_timeline](TimelineCache::remove_from_timeline) removes *all* occurrences & is a
//! no-op on absence, making unfollow revocation idempotent too.

use async_trait::async_trait;
use snafu::Backtrace;

use crate::entities::{TweetId, UserId};

/// Default cap on materialised timeline length, in tweet ids.
pub const DEFAULT_MAX_TIMELINE: usize = 1_000;

/// The cache error type: one opaque bucket
///
/// Callers at every stage apply the same policy regardless of what went wrong underneath (log,
/// skip the sub-operation, let redelivery & dedup converge), so this error carries context for
/// the log line and nothing more.
#[derive(Debug)]
pub struct Error {
    source: Box<dyn std::error::Error + Send + Sync + 'static>,
    #[allow(dead_code)] // captured for Debug output
    backtrace: Backtrace,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
}

#[async_trait]
pub trait TimelineCache {
    /// Prepend `tweet` to `user`'s timeline; no-op if already present; trim the tail beyond the
    /// configured cap.
    async fn add_to_timeline(&self, user: UserId, tweet: TweetId) -> Result<(), Error>;
    /// Remove all occurrences of `tweet` from `user`'s timeline; no-op if absent.
    async fn remove_from_timeline(&self, user: UserId, tweet: TweetId) -> Result<(), Error>;
    /// Up to `limit` tweet ids from the head. A missing timeline is the empty sequence.
    async fn get_timeline(&self, user: UserId, limit: usize) -> Result<Vec<TweetId>, Error>;
    /// Drop `user`'s timeline altogether.
    async fn clear_timeline(&self, user: UserId) -> Result<(), Error>;
}
