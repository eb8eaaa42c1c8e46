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

//! # events
//!
//! The wire contract of the pipeline: topic names, consumer groups, the three JSON envelopes, and
//! the partition keys under which they're published.
//!
//! The keys are chosen so that every event touching one user lands on the same partition, which
//! buys single-consumer ordering per user *within* a topic. Nothing orders fan-outs against
//! follow-graph mutations; that race is accepted & healed by the dedup rule the cache enforces
//! (see [timeline_cache](crate::timeline_cache)).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::{TweetId, UserId};

/// Tweets submitted over HTTP, consumed by the materialiser.
pub const TOPIC_TWEETS_CREATED: &str = "tweets.created";

/// One message per (tweet, recipient) pair, consumed by the applier.
pub const TOPIC_TIMELINE_FANOUT: &str = "timeline.fanout";

/// Follow-graph mutations, consumed by the reconciler.
pub const TOPIC_USER_FOLLOW: &str = "user.follow";

pub const GROUP_TWEET_CONSUMER: &str = "tweet-consumer-group";
pub const GROUP_FANOUT_CONSUMER: &str = "fanout-consumer-group";
pub const GROUP_FOLLOW_CONSUMER: &str = "follow-consumer-group";

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           envelopes                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A tweet submission on [TOPIC_TWEETS_CREATED]
///
/// The submission path publishes these with `id` nil-- the store hasn't seen the tweet yet, and
/// ids are store-assigned. The materialiser persists the content & fans-out the id the store
/// hands back, never the one in the envelope.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TweetCreated {
    pub id: TweetId,
    pub user_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl TweetCreated {
    /// Since `id` is nil at emission, this collapses to one key per author; that still puts all
    /// of an author's submissions on one partition, which is the ordering the key exists to buy.
    pub fn partition_key(&self) -> String {
        format!("tweet_{}_{}", self.user_id, self.id)
    }
}

/// A single (tweet, recipient) pair on [TOPIC_TIMELINE_FANOUT]
///
/// The materialiser emits N of these for N recipients; one-to-one fan-out keeps the applier
/// trivial & makes redelivery granular.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TimelineFanout {
    pub tweet_id: TweetId,
    pub user_id: UserId,
}

impl TimelineFanout {
    pub fn partition_key(&self) -> String {
        format!("fanout_{}_{}", self.user_id, self.tweet_id)
    }
}

/// A follow-graph mutation on [TOPIC_USER_FOLLOW]; `following` true for follow, false for
/// unfollow.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FollowEvent {
    pub follower_id: UserId,
    pub followed_id: UserId,
    pub following: bool,
}

impl FollowEvent {
    pub fn partition_key(&self) -> String {
        format!(
            "follow_{}_{}_{}",
            self.follower_id, self.followed_id, self.following
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn partition_keys() {
        let fanout = TimelineFanout {
            tweet_id: TweetId::new(100),
            user_id: UserId::new(1),
        };
        assert_eq!(fanout.partition_key(), "fanout_1_100");

        let follow = FollowEvent {
            follower_id: UserId::new(1),
            followed_id: UserId::new(3),
            following: false,
        };
        assert_eq!(follow.partition_key(), "follow_1_3_false");

        let created = TweetCreated {
            id: TweetId::new(0),
            user_id: UserId::new(2),
            content: "hello".to_owned(),
            created_at: Utc::now(),
        };
        assert_eq!(created.partition_key(), "tweet_2_0");
    }

    // The envelopes are the contract with whatever else produces onto these topics, so pin the
    // field names down against a literal document rather than round-tripping.
    #[test]
    fn wire_format() {
        let event: TimelineFanout = serde_json::from_str(r#"{"tweet_id":100,"user_id":1}"#).unwrap();
        assert_eq!(event.tweet_id, TweetId::new(100));
        assert_eq!(event.user_id, UserId::new(1));

        let event: FollowEvent =
            serde_json::from_str(r#"{"follower_id":1,"followed_id":3,"following":true}"#).unwrap();
        assert!(event.following);

        let event: TweetCreated = serde_json::from_str(
            r#"{"id":0,"user_id":2,"content":"hello","created_at":"2025-06-01T12:00:00Z"}"#,
        )
        .unwrap();
        assert!(event.id.is_nil());
        assert_eq!(event.content, "hello");
    }
}
