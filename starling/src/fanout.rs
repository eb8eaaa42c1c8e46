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

//! # fanout
//!
//! The first stage of the pipeline: consume `tweets.created`, persist the tweet, & emit one
//! `timeline.fanout` event per recipient.
//!
//! The recipient set is the author plus whoever follows them *at the moment of consumption*. A
//! follow that lands a moment later misses the fan-out; the reconciler heals that from the store
//! when the follow event arrives. The converse (an unfollow racing the fan-out) leaves a tweet
//! the reconciler won't remove, which is accepted noise.
//!
//! Persistence strictly precedes fan-out: no timeline may ever hold an id the store can't
//! resolve. That ordering is also what drives the offset policy-- a store failure holds the
//! offset (redelivery retries the whole event), while a publish failure merely logs (the ids
//! already fanned-out are protected by dedup, so a later redelivery is harmless).

use std::sync::Arc;

use async_trait::async_trait;
use itertools::Itertools;
use snafu::{prelude::*, ResultExt};
use tracing::{debug, error, info, warn};

use crate::{
    bus::{Disposition, EventSink, Handler},
    entities::{self, TweetContent},
    events::{TimelineFanout, TweetCreated, TOPIC_TIMELINE_FANOUT},
    storage,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Refusing to materialise tweet content: {source}"))]
    Content { source: entities::Error },
    #[snafu(display("Failed to persist a tweet: {source}"))]
    Persist { source: storage::Error },
}

type Result<T> = std::result::Result<T, Error>;

/// The `tweets.created` consumer: persist, then fan-out
pub struct TweetMaterialiser {
    storage: Arc<dyn storage::Backend + Send + Sync>,
    sink: Arc<dyn EventSink + Send + Sync>,
}

impl TweetMaterialiser {
    pub fn new(
        storage: Arc<dyn storage::Backend + Send + Sync>,
        sink: Arc<dyn EventSink + Send + Sync>,
    ) -> TweetMaterialiser {
        TweetMaterialiser { storage, sink }
    }

    /// Persist `event` & emit one fan-out message per recipient; return the number of
    /// recipients actually reached.
    async fn materialise(&self, event: &TweetCreated) -> Result<usize> {
        // The submission path validated this before publishing, but the topic is open to any
        // producer; re-parse rather than trust the wire.
        let content = TweetContent::new(&event.content).context(ContentSnafu)?;
        let tweet = self
            .storage
            .create_tweet(event.user_id, &content)
            .await
            .context(PersistSnafu)?;

        // The author always sees their own tweets, even if the follower lookup is down.
        let followers = match self.storage.get_followers(tweet.author_id).await {
            Ok(followers) => followers,
            Err(err) => {
                warn!(
                    "Failed to look up followers of {}; fanning-out to the author alone: {}",
                    tweet.author_id, err
                );
                Vec::new()
            }
        };

        let mut reached = 0;
        for recipient in std::iter::once(tweet.author_id)
            .chain(followers.into_iter())
            .unique()
        {
            let fanout = TimelineFanout {
                tweet_id: tweet.id,
                user_id: recipient,
            };
            let payload = match serde_json::to_vec(&fanout) {
                Ok(payload) => payload,
                Err(err) => {
                    // Two integers that won't serialize would be quite a day.
                    error!("Failed to encode a fan-out event {:?}: {}", fanout, err);
                    continue;
                }
            };
            match self
                .sink
                .publish(TOPIC_TIMELINE_FANOUT, &fanout.partition_key(), &payload)
                .await
            {
                Ok(_) => reached += 1,
                Err(err) => {
                    // Logged, not fatal: redelivery of the originating message re-runs the
                    // whole batch, & dedup makes the recipients we did reach no-ops.
                    error!(
                        "Failed to fan-out tweet {} to {}: {}",
                        tweet.id, recipient, err
                    );
                }
            }
        }
        debug!("Fanned-out tweet {} to {} recipients.", tweet.id, reached);
        Ok(reached)
    }
}

#[async_trait]
impl Handler for TweetMaterialiser {
    fn name(&self) -> &'static str {
        "tweet-materialiser"
    }

    async fn handle(&self, payload: &[u8]) -> Disposition {
        let event: TweetCreated = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(err) => {
                warn!("Skipping an undecodable tweets.created message: {}", err);
                return Disposition::Commit;
            }
        };
        if event.user_id.is_nil() {
            // A nil author could never persist; don't let it wedge the partition.
            warn!("Skipping a tweets.created message with a nil author.");
            return Disposition::Commit;
        }
        match self.materialise(&event).await {
            Ok(reached) => {
                info!(
                    "Materialised a tweet from {} ({} recipients).",
                    event.user_id, reached
                );
                Disposition::Commit
            }
            Err(Error::Content { source }) => {
                warn!("Skipping a poison tweets.created message: {}", source);
                Disposition::Commit
            }
            // An unknown author is poison too: no amount of redelivery invents the user.
            Err(Error::Persist {
                source: storage::Error::UnknownAuthor { .. },
            }) => {
                warn!(
                    "Skipping a tweets.created message from unknown author {}.",
                    event.user_id
                );
                Disposition::Commit
            }
            Err(Error::Persist { source }) => {
                error!(
                    "Failed to persist a tweet from {}; holding for redelivery: {}",
                    event.user_id, source
                );
                Disposition::Hold
            }
        }
    }
}
