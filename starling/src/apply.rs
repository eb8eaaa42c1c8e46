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

//! # apply
//!
//! The second stage of the pipeline: consume `timeline.fanout` & prepend the tweet id to the
//! recipient's cached timeline.
//!
//! There is almost nothing here, & that's the point: all of the subtlety (dedup under
//! redelivery, the growth cap, absence-as-emptiness) lives in the cache contract, so this stage
//! reduces to decode-validate-apply. Cache errors advance the offset-- the next redelivery of
//! anything touching this user converges the timeline via dedup, whereas holding would stall
//! every other recipient sharing the partition.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{
    bus::{Disposition, Handler},
    events::TimelineFanout,
    timeline_cache::TimelineCache,
};

/// The `timeline.fanout` consumer
pub struct TimelineApplier {
    cache: Arc<dyn TimelineCache + Send + Sync>,
}

impl TimelineApplier {
    pub fn new(cache: Arc<dyn TimelineCache + Send + Sync>) -> TimelineApplier {
        TimelineApplier { cache }
    }
}

#[async_trait]
impl Handler for TimelineApplier {
    fn name(&self) -> &'static str {
        "timeline-applier"
    }

    async fn handle(&self, payload: &[u8]) -> Disposition {
        let event: TimelineFanout = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(err) => {
                warn!("Skipping an undecodable timeline.fanout message: {}", err);
                return Disposition::Commit;
            }
        };
        if event.user_id.is_nil() {
            warn!(
                "Skipping a timeline.fanout message with a nil recipient (tweet {}).",
                event.tweet_id
            );
            return Disposition::Commit;
        }
        match self
            .cache
            .add_to_timeline(event.user_id, event.tweet_id)
            .await
        {
            Ok(_) => {
                debug!(
                    "Applied tweet {} to {}'s timeline.",
                    event.tweet_id, event.user_id
                );
            }
            Err(err) => {
                warn!(
                    "Failed to apply tweet {} to {}'s timeline: {}",
                    event.tweet_id, event.user_id, err
                );
            }
        }
        Disposition::Commit
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::{
        entities::{TweetId, UserId},
        testing::MemoryCache,
    };

    fn fanout(user_id: i64, tweet_id: i64) -> Vec<u8> {
        serde_json::to_vec(&TimelineFanout {
            tweet_id: TweetId::new(tweet_id),
            user_id: UserId::new(user_id),
        })
        .unwrap()
    }

    // Head order is recency of application.
    #[tokio::test]
    async fn prepends_in_application_order() {
        let cache = Arc::new(MemoryCache::new(1_000));
        let handler = TimelineApplier::new(cache.clone());

        handler.handle(&fanout(1, 100)).await;
        handler.handle(&fanout(1, 101)).await;

        assert_eq!(
            cache.timeline(UserId::new(1)),
            vec![TweetId::new(101), TweetId::new(100)]
        );
    }

    // Replaying the same event any number of times yields the same timeline.
    #[tokio::test]
    async fn replay_is_idempotent() {
        let cache = Arc::new(MemoryCache::new(1_000));
        let handler = TimelineApplier::new(cache.clone());

        for _ in 0..3 {
            assert_eq!(handler.handle(&fanout(1, 100)).await, Disposition::Commit);
        }

        assert_eq!(cache.timeline(UserId::new(1)), vec![TweetId::new(100)]);
    }

    // A nil recipient mutates nothing, & valid events keep flowing afterwards.
    #[tokio::test]
    async fn nil_recipients_are_skipped() {
        let cache = Arc::new(MemoryCache::new(1_000));
        let handler = TimelineApplier::new(cache.clone());

        assert_eq!(handler.handle(&fanout(0, 42)).await, Disposition::Commit);
        assert!(cache.is_empty());

        handler.handle(&fanout(1, 42)).await;
        assert_eq!(cache.timeline(UserId::new(1)), vec![TweetId::new(42)]);
    }

    #[tokio::test]
    async fn cache_errors_advance_the_offset() {
        let cache = Arc::new(MemoryCache::new(1_000));
        let handler = TimelineApplier::new(cache.clone());

        cache.fail_next();
        assert_eq!(handler.handle(&fanout(1, 100)).await, Disposition::Commit);
        assert!(cache.timeline(UserId::new(1)).is_empty());

        // The next delivery of the same tweet converges the timeline.
        handler.handle(&fanout(1, 100)).await;
        assert_eq!(cache.timeline(UserId::new(1)), vec![TweetId::new(100)]);
    }

    // Growth is bounded by the cap no matter how many events arrive.
    #[tokio::test]
    async fn growth_is_bounded() {
        let cache = Arc::new(MemoryCache::new(5));
        let handler = TimelineApplier::new(cache.clone());

        for tweet_id in 1..=10 {
            handler.handle(&fanout(1, tweet_id)).await;
        }

        let timeline = cache.timeline(UserId::new(1));
        assert_eq!(timeline.len(), 5);
        // The newest-applied survive; the tail was trimmed.
        assert_eq!(timeline[0], TweetId::new(10));
        assert_eq!(timeline[4], TweetId::new(6));
    }

    #[tokio::test]
    async fn undecodable_messages_are_skipped() {
        let cache = Arc::new(MemoryCache::new(1_000));
        let handler = TimelineApplier::new(cache.clone());
        assert_eq!(handler.handle(b"{not json").await, Disposition::Commit);
        assert!(cache.is_empty());
    }
}
