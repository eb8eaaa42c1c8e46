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

//! # testing
//!
//! In-memory doubles for the three seams (store, cache, sink), so the pipeline stages & handlers
//! can be pressure-tested without PostgreSQL, Redis or Kafka anywhere in sight. Each double
//! carries a failure knob or two; the error-handling policy of every stage is as much under test
//! as the happy path.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::Snafu;

use crate::{
    bus::{self, EventSink},
    entities::{Tweet, TweetContent, TweetId, User, UserId, Username},
    storage,
    timeline_cache::{self, TimelineCache},
};

#[derive(Debug, Snafu)]
#[snafu(display("synthetic failure"))]
struct SyntheticFailure;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          MemoryStore                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Default)]
struct StoreInner {
    users: Vec<User>,
    tweets: Vec<Tweet>,
    follows: HashSet<(UserId, UserId)>,
}

/// An in-memory [storage::Backend] assigning sequential ids, just as `BIGSERIAL` would
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
    fail_followers: AtomicBool,
    fail_create_tweet: AtomicBool,
    fail_tweet_ids: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }
    pub fn fail_followers(&self, fail: bool) {
        self.fail_followers.store(fail, Ordering::SeqCst);
    }
    pub fn fail_create_tweet(&self, fail: bool) {
        self.fail_create_tweet.store(fail, Ordering::SeqCst);
    }
    pub fn fail_tweet_ids(&self, fail: bool) {
        self.fail_tweet_ids.store(fail, Ordering::SeqCst);
    }
    pub fn tweet_count(&self) -> usize {
        self.inner.lock().unwrap().tweets.len()
    }
    /// The id of the sole persisted tweet; panics if there isn't exactly one.
    pub fn only_tweet_id(&self) -> TweetId {
        let inner = self.inner.lock().unwrap();
        assert_eq!(inner.tweets.len(), 1);
        inner.tweets[0].id
    }
}

#[async_trait]
impl storage::Backend for MemoryStore {
    async fn add_user(&self, username: &Username) -> Result<User, storage::Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.users.iter().any(|u| &u.username == username) {
            return Err(storage::UsernameClaimedSnafu {
                username: username.to_string(),
            }
            .build());
        }
        let now = Utc::now();
        let user = User {
            id: UserId::new(inner.users.len() as i64 + 1),
            username: username.clone(),
            created_at: now,
            updated_at: now,
        };
        inner.users.push(user.clone());
        Ok(user)
    }

    async fn user_by_id(&self, id: UserId) -> Result<Option<User>, storage::Error> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .users
            .iter()
            .find(|u| u.id == id)
            .cloned())
    }

    async fn user_exists(&self, id: UserId) -> Result<bool, storage::Error> {
        Ok(self.inner.lock().unwrap().users.iter().any(|u| u.id == id))
    }

    async fn create_tweet(
        &self,
        author: UserId,
        content: &TweetContent,
    ) -> Result<Tweet, storage::Error> {
        if self.fail_create_tweet.load(Ordering::SeqCst) {
            return Err(storage::Error::new(SyntheticFailure));
        }
        let mut inner = self.inner.lock().unwrap();
        if !inner.users.iter().any(|u| u.id == author) {
            return Err(storage::UnknownAuthorSnafu { author }.build());
        }
        let now = Utc::now();
        let tweet = Tweet {
            id: TweetId::new(inner.tweets.len() as i64 + 1),
            author_id: author,
            content: content.clone(),
            created_at: now,
            updated_at: now,
        };
        inner.tweets.push(tweet.clone());
        Ok(tweet)
    }

    async fn tweet_by_id(&self, id: TweetId) -> Result<Option<Tweet>, storage::Error> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .tweets
            .iter()
            .find(|t| t.id == id)
            .cloned())
    }

    async fn get_followers(&self, user: UserId) -> Result<Vec<UserId>, storage::Error> {
        if self.fail_followers.load(Ordering::SeqCst) {
            return Err(storage::Error::new(SyntheticFailure));
        }
        Ok(self
            .inner
            .lock()
            .unwrap()
            .follows
            .iter()
            .filter(|(_, followed)| *followed == user)
            .map(|(follower, _)| *follower)
            .collect())
    }

    async fn get_tweet_ids_by_user(&self, user: UserId) -> Result<Vec<TweetId>, storage::Error> {
        if self.fail_tweet_ids.load(Ordering::SeqCst) {
            return Err(storage::Error::new(SyntheticFailure));
        }
        // Newest first, as the SQL backend orders it.
        let mut ids = self
            .inner
            .lock()
            .unwrap()
            .tweets
            .iter()
            .filter(|t| t.author_id == user)
            .map(|t| t.id)
            .collect::<Vec<_>>();
        ids.sort_by(|a, b| b.cmp(a));
        Ok(ids)
    }

    async fn add_follow(
        &self,
        follower: UserId,
        followed: UserId,
        _at: &DateTime<Utc>,
    ) -> Result<(), storage::Error> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.follows.insert((follower, followed)) {
            return Err(storage::DuplicateFollowSnafu { follower, followed }.build());
        }
        Ok(())
    }

    async fn remove_follow(
        &self,
        follower: UserId,
        followed: UserId,
    ) -> Result<bool, storage::Error> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .follows
            .remove(&(follower, followed)))
    }

    async fn is_following(
        &self,
        follower: UserId,
        followed: UserId,
    ) -> Result<bool, storage::Error> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .follows
            .contains(&(follower, followed)))
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          MemoryCache                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An in-memory [TimelineCache] enforcing the same prepend/dedup/cap contract as the Redis one
pub struct MemoryCache {
    timelines: Mutex<HashMap<UserId, Vec<TweetId>>>,
    max_timeline: usize,
    fail_next: AtomicBool,
}

impl MemoryCache {
    pub fn new(max_timeline: usize) -> MemoryCache {
        MemoryCache {
            timelines: Mutex::new(HashMap::new()),
            max_timeline,
            fail_next: AtomicBool::new(false),
        }
    }
    /// Arrange for the next cache operation (alone) to fail.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
    /// The full materialised timeline, head first (empty if missing).
    pub fn timeline(&self, user: UserId) -> Vec<TweetId> {
        self.timelines
            .lock()
            .unwrap()
            .get(&user)
            .cloned()
            .unwrap_or_default()
    }
    pub fn is_empty(&self) -> bool {
        self.timelines.lock().unwrap().values().all(Vec::is_empty)
    }
    fn check_fail(&self) -> Result<(), timeline_cache::Error> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            Err(timeline_cache::Error::new(SyntheticFailure))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TimelineCache for MemoryCache {
    async fn add_to_timeline(
        &self,
        user: UserId,
        tweet: TweetId,
    ) -> Result<(), timeline_cache::Error> {
        self.check_fail()?;
        let mut timelines = self.timelines.lock().unwrap();
        let timeline = timelines.entry(user).or_default();
        if !timeline.contains(&tweet) {
            timeline.insert(0, tweet);
            timeline.truncate(self.max_timeline);
        }
        Ok(())
    }

    async fn remove_from_timeline(
        &self,
        user: UserId,
        tweet: TweetId,
    ) -> Result<(), timeline_cache::Error> {
        self.check_fail()?;
        if let Some(timeline) = self.timelines.lock().unwrap().get_mut(&user) {
            timeline.retain(|tid| *tid != tweet);
        }
        Ok(())
    }

    async fn get_timeline(
        &self,
        user: UserId,
        limit: usize,
    ) -> Result<Vec<TweetId>, timeline_cache::Error> {
        self.check_fail()?;
        Ok(self
            .timelines
            .lock()
            .unwrap()
            .get(&user)
            .map(|timeline| timeline.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn clear_timeline(&self, user: UserId) -> Result<(), timeline_cache::Error> {
        self.check_fail()?;
        self.timelines.lock().unwrap().remove(&user);
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         RecordingSink                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An [EventSink] that records what would have hit the wire: `(topic, key, payload)` triples
#[derive(Default)]
pub struct RecordingSink {
    published: Mutex<Vec<(String, String, Vec<u8>)>>,
    fail: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> RecordingSink {
        RecordingSink::default()
    }
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
    pub fn published(&self) -> Vec<(String, String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), bus::Error> {
        if self.fail.load(Ordering::SeqCst) {
            use snafu::IntoError;
            return Err(bus::PublishSnafu {
                topic: topic.to_owned(),
            }
            .into_error(rdkafka::error::KafkaError::Canceled));
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_owned(), key.to_owned(), payload.to_vec()));
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     the pipeline, end to end                                   //
////////////////////////////////////////////////////////////////////////////////////////////////////

// The per-stage suites live with their stages; this one drives the whole write path through the
// doubles, the way the consumers would drain the topics.
mod test {
    use super::*;

    use std::sync::Arc;

    use crate::{
        apply::TimelineApplier,
        bus::{Disposition, Handler},
        events::{TOPIC_TIMELINE_FANOUT, TOPIC_TWEETS_CREATED, TOPIC_USER_FOLLOW},
        fanout::TweetMaterialiser,
        reconcile::GraphReconciler,
        storage::Backend,
        timelines, tweets, users,
    };

    /// Process everything the sink has recorded since the last drain, in publication order,
    /// dispatching each message to its topic's consumer-- publications made *while* draining
    /// (the fan-out) get drained too. `cursor` stands in for the consumer-group offsets.
    async fn drain(
        sink: &RecordingSink,
        materialiser: &TweetMaterialiser,
        applier: &TimelineApplier,
        reconciler: &GraphReconciler,
        cursor: &mut usize,
    ) {
        loop {
            let published = sink.published();
            if *cursor == published.len() {
                break;
            }
            let (topic, _, payload) = published[*cursor].clone();
            *cursor += 1;
            let disposition = match topic.as_str() {
                TOPIC_TWEETS_CREATED => materialiser.handle(&payload).await,
                TOPIC_TIMELINE_FANOUT => applier.handle(&payload).await,
                TOPIC_USER_FOLLOW => reconciler.handle(&payload).await,
                topic => panic!("nothing consumes {}", topic),
            };
            assert_eq!(disposition, Disposition::Commit);
        }
    }

    // Sign up, follow, tweet: the tweet id lands on both the author's & the follower's
    // timelines.
    #[tokio::test]
    async fn a_tweet_reaches_author_and_follower() {
        let storage = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new(1_000));
        let sink = Arc::new(RecordingSink::new());
        let materialiser = TweetMaterialiser::new(storage.clone(), sink.clone());
        let applier = TimelineApplier::new(cache.clone());
        let reconciler = GraphReconciler::new(storage.clone(), cache.clone());

        let follower = storage.add_user(&Username::new("follower").unwrap()).await.unwrap();
        let author = storage.add_user(&Username::new("author").unwrap()).await.unwrap();

        users::follow(storage.as_ref(), sink.as_ref(), follower.id, author.id)
            .await
            .unwrap();
        tweets::submit(storage.as_ref(), sink.as_ref(), author.id, "hello")
            .await
            .unwrap();
        drain(&sink, &materialiser, &applier, &reconciler, &mut 0).await;

        let tweet = storage.only_tweet_id();
        assert_eq!(
            timelines::read(cache.as_ref(), follower.id, 10).await.unwrap(),
            vec![tweet]
        );
        assert_eq!(
            timelines::read(cache.as_ref(), author.id, 10).await.unwrap(),
            vec![tweet]
        );
    }

    // The late-follower hole: a follow that misses the fan-out is healed by backfill, & the
    // subsequent unfollow revokes it all again.
    #[tokio::test]
    async fn follow_heals_and_unfollow_revokes() {
        let storage = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new(1_000));
        let sink = Arc::new(RecordingSink::new());
        let materialiser = TweetMaterialiser::new(storage.clone(), sink.clone());
        let applier = TimelineApplier::new(cache.clone());
        let reconciler = GraphReconciler::new(storage.clone(), cache.clone());

        let follower = storage.add_user(&Username::new("follower").unwrap()).await.unwrap();
        let author = storage.add_user(&Username::new("author").unwrap()).await.unwrap();
        let mut offsets = 0;

        // The author tweets *before* anyone follows them; only their own timeline
        // materialises.
        tweets::submit(storage.as_ref(), sink.as_ref(), author.id, "early")
            .await
            .unwrap();
        drain(&sink, &materialiser, &applier, &reconciler, &mut offsets).await;
        assert!(timelines::read(cache.as_ref(), follower.id, 10)
            .await
            .unwrap()
            .is_empty());

        // Following backfills the missed history...
        users::follow(storage.as_ref(), sink.as_ref(), follower.id, author.id)
            .await
            .unwrap();
        drain(&sink, &materialiser, &applier, &reconciler, &mut offsets).await;
        let tweet = storage.only_tweet_id();
        assert_eq!(
            timelines::read(cache.as_ref(), follower.id, 10).await.unwrap(),
            vec![tweet]
        );

        // ...and unfollowing revokes it.
        users::unfollow(storage.as_ref(), sink.as_ref(), follower.id, author.id)
            .await
            .unwrap();
        drain(&sink, &materialiser, &applier, &reconciler, &mut offsets).await;
        assert!(timelines::read(cache.as_ref(), follower.id, 10)
            .await
            .unwrap()
            .is_empty());
        // The author keeps their own tweet, of course.
        assert_eq!(
            timelines::read(cache.as_ref(), author.id, 10).await.unwrap(),
            vec![tweet]
        );
    }
}
