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

//! # reconcile
//!
//! The third stage of the pipeline: consume `user.follow` & bring the follower's timeline into
//! agreement with the follow graph.
//!
//! On follow, the followed user's history is *backfilled* from the store: the fan-out stage only
//! reaches followers who existed when a tweet was consumed, so a new follower starts with a
//! hole, & this stage fills it. The store hands history back newest-first; we apply it
//! *reversed* (oldest first) so that the cache's prepend discipline leaves the newest of the
//! batch nearest the head.
//!
//! On unfollow, the followed user's *full* history is revoked, one remove per tweet id. That's
//! sound because tweet ids are globally monotonic-- no two authors share one-- & idempotent
//! because removing an absent id is a no-op. (Retweets would break the by-author-id revocation;
//! they don't exist here.)
//!
//! Both directions tolerate individual cache failures by skipping: dedup on apply & no-op on
//! absent-remove make the next redelivery converge.

use std::sync::Arc;

use async_trait::async_trait;
use snafu::prelude::*;
use tracing::{info, warn};

use crate::{
    bus::{Disposition, Handler},
    entities::UserId,
    events::FollowEvent,
    storage,
    timeline_cache::TimelineCache,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to fetch the tweet ids of {followed}: {source}"))]
    History {
        followed: UserId,
        source: storage::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// The `user.follow` consumer: backfill on follow, revoke on unfollow
pub struct GraphReconciler {
    storage: Arc<dyn storage::Backend + Send + Sync>,
    cache: Arc<dyn TimelineCache + Send + Sync>,
}

impl GraphReconciler {
    pub fn new(
        storage: Arc<dyn storage::Backend + Send + Sync>,
        cache: Arc<dyn TimelineCache + Send + Sync>,
    ) -> GraphReconciler {
        GraphReconciler { storage, cache }
    }

    async fn backfill(&self, event: &FollowEvent) -> Result<()> {
        let tweet_ids = self
            .storage
            .get_tweet_ids_by_user(event.followed_id)
            .await
            .context(HistorySnafu {
                followed: event.followed_id,
            })?;
        info!(
            "Backfilling {} tweets of {} into {}'s timeline.",
            tweet_ids.len(),
            event.followed_id,
            event.follower_id
        );
        // Oldest first: each prepend pushes the earlier ones down, leaving the newest of the
        // batch at the highest remaining position.
        for tid in tweet_ids.into_iter().rev() {
            if let Err(err) = self.cache.add_to_timeline(event.follower_id, tid).await {
                warn!(
                    "Failed to backfill tweet {} into {}'s timeline; skipping: {}",
                    tid, event.follower_id, err
                );
            }
        }
        Ok(())
    }

    async fn revoke(&self, event: &FollowEvent) -> Result<()> {
        let tweet_ids = self
            .storage
            .get_tweet_ids_by_user(event.followed_id)
            .await
            .context(HistorySnafu {
                followed: event.followed_id,
            })?;
        info!(
            "Revoking {} tweets of {} from {}'s timeline.",
            tweet_ids.len(),
            event.followed_id,
            event.follower_id
        );
        for tid in tweet_ids {
            if let Err(err) = self.cache.remove_from_timeline(event.follower_id, tid).await {
                warn!(
                    "Failed to revoke tweet {} from {}'s timeline; skipping: {}",
                    tid, event.follower_id, err
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Handler for GraphReconciler {
    fn name(&self) -> &'static str {
        "graph-reconciler"
    }

    async fn handle(&self, payload: &[u8]) -> Disposition {
        let event: FollowEvent = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(err) => {
                warn!("Skipping an undecodable user.follow message: {}", err);
                return Disposition::Commit;
            }
        };
        if event.follower_id.is_nil() || event.followed_id.is_nil() {
            warn!("Skipping a user.follow message with a nil id: {:?}", event);
            return Disposition::Commit;
        }
        let outcome = if event.following {
            self.backfill(&event).await
        } else {
            self.revoke(&event).await
        };
        match outcome {
            Ok(_) => Disposition::Commit,
            Err(err) => {
                // Without the followed user's history there's nothing to reconcile against;
                // hold & let redelivery retry once the store is reachable.
                warn!("{}; holding for redelivery.", err);
                Disposition::Hold
            }
        }
    }
}
