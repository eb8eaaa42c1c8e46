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

//! # redis
//!
//! [TimelineCache] implementation for Redis.
//!
//! [TimelineCache]: crate::timeline_cache
//!
//! Each timeline is a Redis list at `timeline:{user_id}`, head at index 0. The list operations
//! map onto the contract directly: `LPUSH` prepends, `LTRIM` caps, `LREM 0` revokes all
//! occurrences, `LRANGE` reads, `DEL` clears. Dedup is an `LPOS` probe ahead of the push; the
//! probe & push aren't atomic, but the partition keys route all of one user's fan-outs to a
//! single consumer, so nothing races us on a given key within a topic, and across topics a lost
//! race costs one duplicate that the next `LREM` would still remove.

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client, LposOptions};
use snafu::{Backtrace, ResultExt, Snafu};
use tracing::info;

use crate::{
    entities::{TweetId, UserId},
    timeline_cache::{self, TimelineCache},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to clear a timeline: {source}"))]
    Clear {
        source: redis::RedisError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to connect to Redis at {url}: {source}"))]
    Connect {
        url: String,
        source: redis::RedisError,
        backtrace: Backtrace,
    },
    #[snafu(display("The LPOS probe failed: {source}"))]
    Probe {
        source: redis::RedisError,
        backtrace: Backtrace,
    },
    #[snafu(display("The LPUSH failed: {source}"))]
    Push {
        source: redis::RedisError,
        backtrace: Backtrace,
    },
    #[snafu(display("The LRANGE read failed: {source}"))]
    Range {
        source: redis::RedisError,
        backtrace: Backtrace,
    },
    #[snafu(display("The LREM failed: {source}"))]
    Remove {
        source: redis::RedisError,
        backtrace: Backtrace,
    },
    #[snafu(display("The LTRIM failed: {source}"))]
    Trim {
        source: redis::RedisError,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

fn timeline_key(user: UserId) -> String {
    format!("timeline:{}", user)
}

/// `starling`-specific Redis cache handle
///
/// Instantiate via [Cache::new] with the cache address & the timeline cap. The
/// [ConnectionManager] within multiplexes & reconnects on its own; cloning it is how one borrows
/// a connection.
pub struct Cache {
    conn: ConnectionManager,
    max_timeline: usize,
}

impl Cache {
    /// [Cache] constructor
    ///
    /// `addr` may be a full `redis://` URL or a bare `host:port` (the form the `REDIS_ADDR`
    /// environment variable has always taken).
    pub async fn new(addr: &str, max_timeline: usize) -> Result<Cache> {
        let url = if addr.contains("://") {
            addr.to_owned()
        } else {
            format!("redis://{}", addr)
        };
        let client = Client::open(url.as_str()).context(ConnectSnafu { url: url.clone() })?;
        let conn = ConnectionManager::new(client)
            .await
            .context(ConnectSnafu { url: url.clone() })?;
        info!("Connected to Redis at {}.", url);
        Ok(Cache { conn, max_timeline })
    }
}

#[async_trait]
impl TimelineCache for Cache {
    async fn add_to_timeline(
        &self,
        user: UserId,
        tweet: TweetId,
    ) -> std::result::Result<(), timeline_cache::Error> {
        let key = timeline_key(user);
        let mut conn = self.conn.clone();
        // Dedup: if the id's already in the list, this call is a no-op.
        let extant: Option<usize> = conn
            .lpos(&key, tweet.as_i64(), LposOptions::default())
            .await
            .context(ProbeSnafu)
            .map_err(timeline_cache::Error::new)?;
        if extant.is_some() {
            return Ok(());
        }
        let _: () = conn
            .lpush(&key, tweet.as_i64())
            .await
            .context(PushSnafu)
            .map_err(timeline_cache::Error::new)?;
        let _: () = conn
            .ltrim(&key, 0, self.max_timeline as isize - 1)
            .await
            .context(TrimSnafu)
            .map_err(timeline_cache::Error::new)?;
        Ok(())
    }

    async fn remove_from_timeline(
        &self,
        user: UserId,
        tweet: TweetId,
    ) -> std::result::Result<(), timeline_cache::Error> {
        let mut conn = self.conn.clone();
        // count 0 removes every occurrence; removing an absent id is already a no-op.
        let _: i64 = conn
            .lrem(timeline_key(user), 0, tweet.as_i64())
            .await
            .context(RemoveSnafu)
            .map_err(timeline_cache::Error::new)?;
        Ok(())
    }

    async fn get_timeline(
        &self,
        user: UserId,
        limit: usize,
    ) -> std::result::Result<Vec<TweetId>, timeline_cache::Error> {
        if limit == 0 {
            // LRANGE 0 -1 means "everything"; head it off.
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let raw: Vec<i64> = conn
            .lrange(timeline_key(user), 0, limit as isize - 1)
            .await
            .context(RangeSnafu)
            .map_err(timeline_cache::Error::new)?;
        Ok(raw.into_iter().map(TweetId::from).collect())
    }

    async fn clear_timeline(&self, user: UserId) -> std::result::Result<(), timeline_cache::Error> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(timeline_key(user))
            .await
            .context(ClearSnafu)
            .map_err(timeline_cache::Error::new)?;
        Ok(())
    }
}
