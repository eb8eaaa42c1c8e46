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

//! # Timeline API
//!
//! The read path. It bypasses the pipeline entirely: whatever the consumers have materialised in
//! the cache *is* the timeline, & a user nobody has fanned anything out to reads as empty. Head
//! order is recency of application; a reader wanting strict chronology can sort the returned
//! ids, which are monotonic.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::error;

use crate::{
    entities::{TweetId, UserId},
    http::ErrorResponseBody,
    starling::Starling,
    timeline_cache::{self, TimelineCache},
};

/// How many tweet ids a read returns when the caller doesn't say.
pub const DEFAULT_LIMIT: usize = 10;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Cache failure: {source}"))]
    Cache { source: timeline_cache::Error },
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let Error::Cache { source } = self;
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponseBody {
                error: format!("Internal cache error: {}", source),
            }),
        )
            .into_response()
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Read up to `limit` tweet ids from the head of `user`'s timeline.
pub async fn read(
    cache: &(dyn TimelineCache + Send + Sync),
    user: UserId,
    limit: usize,
) -> Result<Vec<TweetId>> {
    cache.get_timeline(user, limit).await.context(CacheSnafu)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           handlers                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize)]
struct TimelineParams {
    limit: Option<usize>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TimelineRsp {
    pub user_id: UserId,
    pub tweet_ids: Vec<TweetId>,
}

async fn get_timeline(
    State(state): State<Arc<Starling>>,
    Path(user_id): Path<i64>,
    Query(params): Query<TimelineParams>,
) -> axum::response::Response {
    let user_id = UserId::new(user_id);
    let limit = match params.limit {
        Some(limit) if limit > 0 => limit,
        _ => DEFAULT_LIMIT,
    };
    match read(state.cache.as_ref(), user_id, limit).await {
        Ok(tweet_ids) => Json(TimelineRsp { user_id, tweet_ids }).into_response(),
        Err(err) => {
            error!("Failed to read {}'s timeline: {}", user_id, err);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Public API                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Return a router for the Timeline API
pub fn make_router(state: Arc<Starling>) -> Router {
    Router::new()
        .route("/timelines/{user_id}", get(get_timeline))
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        ))
        .with_state(state)
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::testing::MemoryCache;

    // A missing timeline is the empty sequence, & reads never exceed the limit.
    #[tokio::test]
    async fn reads_are_head_limited() {
        let cache = MemoryCache::new(1_000);
        assert!(read(&cache, UserId::new(1), 10).await.unwrap().is_empty());

        for tweet_id in 1..=5 {
            cache
                .add_to_timeline(UserId::new(1), TweetId::new(tweet_id))
                .await
                .unwrap();
        }
        let timeline = read(&cache, UserId::new(1), 3).await.unwrap();
        assert_eq!(
            timeline,
            vec![TweetId::new(5), TweetId::new(4), TweetId::new(3)]
        );
    }

    // Clearing a timeline returns it to the missing-key state, which reads as empty.
    #[tokio::test]
    async fn cleared_timelines_read_as_empty() {
        let cache = MemoryCache::new(1_000);
        cache
            .add_to_timeline(UserId::new(1), TweetId::new(100))
            .await
            .unwrap();
        cache.clear_timeline(UserId::new(1)).await.unwrap();
        assert!(read(&cache, UserId::new(1), 10).await.unwrap().is_empty());
    }
}
