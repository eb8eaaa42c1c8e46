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

//! # User API
//!
//! User creation & retrieval, plus the follow/unfollow command path.
//!
//! Follow & unfollow are where the write path begins: validate, mutate the follow graph in the
//! store, & only then emit the `user.follow` event that the reconciler will pick up. The edge
//! write strictly precedes the emission; the reconciler reads the store, so an event about an
//! edge that isn't there yet would reconcile against stale history.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use snafu::{prelude::*, IntoError};
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer};
use tracing::{error, info};

use crate::{
    bus::{self, EventSink},
    entities::{self, User, UserId, Username},
    events::{FollowEvent, TOPIC_USER_FOLLOW},
    http::ErrorResponseBody,
    starling::Starling,
    storage::{self, Backend as StorageBackend},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{follower} already follows {followed}"))]
    AlreadyFollowing { follower: UserId, followed: UserId },
    #[snafu(display("{source}"))]
    BadUsername { source: entities::Error },
    #[snafu(display("{follower} doesn't follow {followed}"))]
    NotFollowing { follower: UserId, followed: UserId },
    #[snafu(display("Failed to emit a follow event: {source}"))]
    Publish { source: bus::Error },
    #[snafu(display("A user can't follow themselves"))]
    SelfFollow { user: UserId },
    #[snafu(display("Storage failure: {source}"))]
    Storage { source: storage::Error },
    #[snafu(display("No user with id {user}"))]
    UnknownUser { user: UserId },
    #[snafu(display("The username {username} is already claimed"))]
    UsernameClaimed { username: String },
}

impl Error {
    pub fn as_status_and_msg(&self) -> (StatusCode, String) {
        match self {
            ////////////////////////////////////////////////////////////////////////////////////////
            // Broken requests-- tell the caller how to fix it
            ////////////////////////////////////////////////////////////////////////////////////////
            Error::BadUsername { source } => (StatusCode::BAD_REQUEST, format!("{}", source)),
            Error::SelfFollow { .. } => (
                StatusCode::BAD_REQUEST,
                "A user can't follow themselves".to_owned(),
            ),
            Error::NotFollowing {
                follower, followed, ..
            } => (
                StatusCode::BAD_REQUEST,
                format!("{} doesn't follow {}", follower, followed),
            ),
            Error::UnknownUser { user } => {
                (StatusCode::NOT_FOUND, format!("No user with id {}", user))
            }
            Error::AlreadyFollowing {
                follower, followed, ..
            } => (
                StatusCode::CONFLICT,
                format!("{} already follows {}", follower, followed),
            ),
            Error::UsernameClaimed { username } => (
                StatusCode::CONFLICT,
                format!("The username {} is already claimed; sorry", username),
            ),
            ////////////////////////////////////////////////////////////////////////////////////////
            // Internal failure-- own up to it
            ////////////////////////////////////////////////////////////////////////////////////////
            Error::Publish { source } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to emit a follow event: {}", source),
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

/// Record that `follower` follows `followed` & emit the corresponding event
///
/// Validation: no self-follows, both users must exist, & the edge must be new (the store's
/// uniqueness constraint is the arbiter, so concurrent duplicates can't both win).
pub async fn follow(
    storage: &(dyn StorageBackend + Send + Sync),
    sink: &(dyn EventSink + Send + Sync),
    follower: UserId,
    followed: UserId,
) -> Result<()> {
    ensure!(follower != followed, SelfFollowSnafu { user: follower });
    ensure!(
        storage.user_exists(follower).await.context(StorageSnafu)?,
        UnknownUserSnafu { user: follower }
    );
    ensure!(
        storage.user_exists(followed).await.context(StorageSnafu)?,
        UnknownUserSnafu { user: followed }
    );
    storage
        .add_follow(follower, followed, &Utc::now())
        .await
        .map_err(|err| match err {
            storage::Error::DuplicateFollow { .. } => {
                AlreadyFollowingSnafu { follower, followed }.build()
            }
            err => StorageSnafu.into_error(err),
        })?;
    emit(sink, follower, followed, true).await
}

/// Delete the `follower` → `followed` edge & emit the corresponding event
pub async fn unfollow(
    storage: &(dyn StorageBackend + Send + Sync),
    sink: &(dyn EventSink + Send + Sync),
    follower: UserId,
    followed: UserId,
) -> Result<()> {
    ensure!(follower != followed, SelfFollowSnafu { user: follower });
    ensure!(
        storage.user_exists(follower).await.context(StorageSnafu)?,
        UnknownUserSnafu { user: follower }
    );
    ensure!(
        storage.user_exists(followed).await.context(StorageSnafu)?,
        UnknownUserSnafu { user: followed }
    );
    ensure!(
        storage
            .remove_follow(follower, followed)
            .await
            .context(StorageSnafu)?,
        NotFollowingSnafu { follower, followed }
    );
    emit(sink, follower, followed, false).await
}

async fn emit(
    sink: &(dyn EventSink + Send + Sync),
    follower_id: UserId,
    followed_id: UserId,
    following: bool,
) -> Result<()> {
    let event = FollowEvent {
        follower_id,
        followed_id,
        following,
    };
    let payload = serde_json::to_vec(&event).unwrap(/* known good */);
    sink.publish(TOPIC_USER_FOLLOW, &event.partition_key(), &payload)
        .await
        .context(PublishSnafu)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           handlers                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize)]
struct CreateUserReq {
    username: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FollowRsp {
    pub message: String,
}

/// Create a new user
///
/// Parameters:
///
/// - username: non-empty, no more than fifty characters, & not yet claimed (409 if it is).
async fn create_user(
    State(state): State<Arc<Starling>>,
    Json(req): Json<CreateUserReq>,
) -> axum::response::Response {
    async fn create_user1(state: &Starling, raw: &str) -> Result<User> {
        let username = Username::new(raw).context(BadUsernameSnafu)?;
        state
            .storage
            .add_user(&username)
            .await
            .map_err(|err| match err {
                storage::Error::UsernameClaimed { username, .. } => {
                    UsernameClaimedSnafu { username }.build()
                }
                err => StorageSnafu.into_error(err),
            })
    }

    match create_user1(&state, &req.username).await {
        Ok(user) => {
            info!("Created user {} ({}).", user.username, user.id);
            (StatusCode::CREATED, Json(user)).into_response()
        }
        Err(err) => {
            error!("Failed to create user {:?}: {}", req.username, err);
            err.into_response()
        }
    }
}

async fn get_user(
    State(state): State<Arc<Starling>>,
    Path(id): Path<i64>,
) -> axum::response::Response {
    let id = UserId::new(id);
    match state.storage.user_by_id(id).await {
        Ok(Some(user)) => Json(user).into_response(),
        Ok(None) => UnknownUserSnafu { user: id }.build().into_response(),
        Err(err) => {
            error!("Failed to look up user {}: {}", id, err);
            StorageSnafu.into_error(err).into_response()
        }
    }
}

async fn follow_user(
    State(state): State<Arc<Starling>>,
    Path((id, target_id)): Path<(i64, i64)>,
) -> axum::response::Response {
    match follow(
        state.storage.as_ref(),
        state.sink.as_ref(),
        UserId::new(id),
        UserId::new(target_id),
    )
    .await
    {
        Ok(_) => {
            info!("{} now follows {}.", id, target_id);
            Json(FollowRsp {
                message: "successfully followed user".to_owned(),
            })
            .into_response()
        }
        Err(err) => {
            info!("{} failed to follow {}: {}", id, target_id, err);
            err.into_response()
        }
    }
}

async fn unfollow_user(
    State(state): State<Arc<Starling>>,
    Path((id, target_id)): Path<(i64, i64)>,
) -> axum::response::Response {
    match unfollow(
        state.storage.as_ref(),
        state.sink.as_ref(),
        UserId::new(id),
        UserId::new(target_id),
    )
    .await
    {
        Ok(_) => {
            info!("{} no longer follows {}.", id, target_id);
            Json(FollowRsp {
                message: "successfully unfollowed user".to_owned(),
            })
            .into_response()
        }
        Err(err) => {
            info!("{} failed to unfollow {}: {}", id, target_id, err);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Public API                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Return a router for the User API
///
/// The returned [Router] will presumably be merged with other routers.
pub fn make_router(state: Arc<Starling>) -> Router {
    Router::new()
        .route("/users", post(create_user))
        .route("/users/{id}", get(get_user))
        .route("/users/{id}/follow/{target_id}", post(follow_user))
        .route("/users/{id}/unfollow/{target_id}", post(unfollow_user))
        // All responses are JSON; add the appropriate Content-Type header (but leave the
        // existing Content-Type header should a handler set it specially).
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::testing::{MemoryStore, RecordingSink};

    async fn fixture() -> (Arc<MemoryStore>, Arc<RecordingSink>) {
        let storage = Arc::new(MemoryStore::new());
        storage.add_user(&Username::new("u1").unwrap()).await.unwrap();
        storage.add_user(&Username::new("u2").unwrap()).await.unwrap();
        (storage, Arc::new(RecordingSink::new()))
    }

    // No self-edges, & no event may be emitted for the attempt.
    #[tokio::test]
    async fn self_follow_is_rejected() {
        let (storage, sink) = fixture().await;
        let err = follow(storage.as_ref(), sink.as_ref(), UserId::new(1), UserId::new(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SelfFollow { .. }));
        assert_eq!(err.as_status_and_msg().0, StatusCode::BAD_REQUEST);
        assert!(sink.published().is_empty());
    }

    #[tokio::test]
    async fn both_parties_must_exist() {
        let (storage, sink) = fixture().await;
        let err = follow(storage.as_ref(), sink.as_ref(), UserId::new(1), UserId::new(9))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownUser { .. }));
        assert_eq!(err.as_status_and_msg().0, StatusCode::NOT_FOUND);
        assert!(sink.published().is_empty());
    }

    // The edge lands in the store first, then exactly one event goes out.
    #[tokio::test]
    async fn follow_writes_the_edge_then_emits() {
        let (storage, sink) = fixture().await;
        follow(storage.as_ref(), sink.as_ref(), UserId::new(1), UserId::new(2))
            .await
            .unwrap();

        assert!(storage
            .is_following(UserId::new(1), UserId::new(2))
            .await
            .unwrap());
        let published = sink.published();
        assert_eq!(published.len(), 1);
        let (topic, key, payload) = &published[0];
        assert_eq!(topic, TOPIC_USER_FOLLOW);
        assert_eq!(key, "follow_1_2_true");
        let event: FollowEvent = serde_json::from_slice(payload).unwrap();
        assert!(event.following);
        assert_eq!(event.follower_id, UserId::new(1));
        assert_eq!(event.followed_id, UserId::new(2));
    }

    #[tokio::test]
    async fn duplicate_follows_conflict() {
        let (storage, sink) = fixture().await;
        follow(storage.as_ref(), sink.as_ref(), UserId::new(1), UserId::new(2))
            .await
            .unwrap();
        let err = follow(storage.as_ref(), sink.as_ref(), UserId::new(1), UserId::new(2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyFollowing { .. }));
        assert_eq!(err.as_status_and_msg().0, StatusCode::CONFLICT);
        assert_eq!(sink.published().len(), 1);
    }

    #[tokio::test]
    async fn unfollow_mirrors_follow() {
        let (storage, sink) = fixture().await;
        follow(storage.as_ref(), sink.as_ref(), UserId::new(1), UserId::new(2))
            .await
            .unwrap();
        unfollow(storage.as_ref(), sink.as_ref(), UserId::new(1), UserId::new(2))
            .await
            .unwrap();

        assert!(!storage
            .is_following(UserId::new(1), UserId::new(2))
            .await
            .unwrap());
        let published = sink.published();
        assert_eq!(published.len(), 2);
        let event: FollowEvent = serde_json::from_slice(&published[1].2).unwrap();
        assert!(!event.following);
    }

    #[tokio::test]
    async fn unfollow_without_a_follow_is_an_error() {
        let (storage, sink) = fixture().await;
        let err = unfollow(storage.as_ref(), sink.as_ref(), UserId::new(1), UserId::new(2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFollowing { .. }));
        assert_eq!(err.as_status_and_msg().0, StatusCode::BAD_REQUEST);
        assert!(sink.published().is_empty());
    }
}
