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

//! # Tweet API
//!
//! Submission & retrieval.
//!
//! Submission is fire-and-forget into the pipeline: validate, publish `tweets.created`, return
//! 202. The store write happens downstream in the materialiser, which is why the response
//! carries no tweet id-- one hasn't been assigned yet. Content that fails validation is
//! rejected with a 400 & *nothing* is published.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use snafu::prelude::*;
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer};
use tracing::{error, info};

use crate::{
    bus::{self, EventSink},
    entities::{self, Tweet, TweetContent, TweetId, UserId},
    events::{TweetCreated, TOPIC_TWEETS_CREATED},
    http::ErrorResponseBody,
    starling::Starling,
    storage::{self, Backend as StorageBackend},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{source}"))]
    BadContent { source: entities::Error },
    #[snafu(display("Failed to emit a tweet submission: {source}"))]
    Publish { source: bus::Error },
    #[snafu(display("Storage failure: {source}"))]
    Storage { source: storage::Error },
    #[snafu(display("No tweet with id {tweet}"))]
    UnknownTweet { tweet: TweetId },
    #[snafu(display("No user with id {user}"))]
    UnknownUser { user: UserId },
}

impl Error {
    pub fn as_status_and_msg(&self) -> (StatusCode, String) {
        match self {
            Error::BadContent { source } => (StatusCode::BAD_REQUEST, format!("{}", source)),
            Error::UnknownTweet { tweet } => {
                (StatusCode::NOT_FOUND, format!("No tweet with id {}", tweet))
            }
            Error::UnknownUser { user } => {
                (StatusCode::NOT_FOUND, format!("No user with id {}", user))
            }
            Error::Publish { source } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to emit a tweet submission: {}", source),
            ),
            Error::Storage { source } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal storage error: {}", source),
            ),
        }
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let (code, msg) = self.as_status_and_msg();
        (code, Json(ErrorResponseBody { error: msg })).into_response()
    }
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       the command path                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Validate a submission & publish it onto `tweets.created`; return the envelope as published
///
/// The returned [TweetCreated] carries a nil id: ids are assigned by the store when the
/// materialiser persists the tweet.
pub async fn submit(
    storage: &(dyn StorageBackend + Send + Sync),
    sink: &(dyn EventSink + Send + Sync),
    user_id: UserId,
    content: &str,
) -> Result<TweetCreated> {
    let content = TweetContent::new(content).context(BadContentSnafu)?;
    ensure!(
        storage.user_exists(user_id).await.context(StorageSnafu)?,
        UnknownUserSnafu { user: user_id }
    );
    let event = TweetCreated {
        id: TweetId::new(0),
        user_id,
        content: content.to_string(),
        created_at: Utc::now(),
    };
    let payload = serde_json::to_vec(&event).unwrap(/* known good */);
    sink.publish(TOPIC_TWEETS_CREATED, &event.partition_key(), &payload)
        .await
        .context(PublishSnafu)?;
    Ok(event)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           handlers                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize)]
struct SubmitReq {
    user_id: i64,
    content: String,
}

async fn submit_tweet(
    State(state): State<Arc<Starling>>,
    Json(req): Json<SubmitReq>,
) -> axum::response::Response {
    match submit(
        state.storage.as_ref(),
        state.sink.as_ref(),
        UserId::new(req.user_id),
        &req.content,
    )
    .await
    {
        Ok(event) => {
            info!("Accepted a tweet from {}.", event.user_id);
            (StatusCode::ACCEPTED, Json(event)).into_response()
        }
        Err(err) => {
            info!("Rejected a tweet from {}: {}", req.user_id, err);
            err.into_response()
        }
    }
}

async fn get_tweet(
    State(state): State<Arc<Starling>>,
    Path(id): Path<i64>,
) -> axum::response::Response {
    async fn get_tweet1(state: &Starling, id: TweetId) -> Result<Tweet> {
        state
            .storage
            .tweet_by_id(id)
            .await
            .context(StorageSnafu)?
            .context(UnknownTweetSnafu { tweet: id })
    }

    let id = TweetId::new(id);
    match get_tweet1(&state, id).await {
        Ok(tweet) => Json(tweet).into_response(),
        Err(err @ Error::UnknownTweet { .. }) => err.into_response(),
        Err(err) => {
            error!("Failed to look up tweet {}: {}", id, err);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Public API                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Return a router for the Tweet API
pub fn make_router(state: Arc<Starling>) -> Router {
    Router::new()
        .route("/tweets", post(submit_tweet))
        .route("/tweets/{id}", get(get_tweet))
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
