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

//! # postgres
//!
//! [Backend] implementation for PostgreSQL.
//!
//! [Backend]: crate::storage::Backend
//!
//! Schema management is out of scope for this crate; the store is expected to carry:
//!
//! ```sql
//! CREATE TABLE users (
//!     id         BIGSERIAL PRIMARY KEY,
//!     username   VARCHAR(50) NOT NULL UNIQUE,
//!     created_at TIMESTAMPTZ NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL
//! );
//! CREATE TABLE tweets (
//!     id         BIGSERIAL PRIMARY KEY,
//!     author_id  BIGINT NOT NULL REFERENCES users (id),
//!     content    VARCHAR(280) NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL
//! );
//! CREATE TABLE follows (
//!     follower_id BIGINT NOT NULL REFERENCES users (id),
//!     followed_id BIGINT NOT NULL REFERENCES users (id),
//!     created_at  TIMESTAMPTZ NOT NULL,
//!     PRIMARY KEY (follower_id, followed_id)
//! );
//! ```
//!
//! The `BIGSERIAL` on `tweets.id` is what makes tweet ids globally monotonic, which the
//! unfollow-revocation algorithm leans on (remove-by-author's-tweet-ids is only sound if no two
//! authors share an id).

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use snafu::{Backtrace, IntoError, ResultExt, Snafu};
use tracing::info;

use crate::{
    entities::{Tweet, TweetContent, TweetId, User, UserId, Username},
    storage,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The add_follow insert failed: {source}"))]
    AddFollow {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The add_user insert failed: {source}"))]
    AddUser {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to connect to PostgreSQL: {source}"))]
    Connect {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The create_tweet insert failed: {source}"))]
    CreateTweet {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The followers query failed: {source}"))]
    Followers {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The is_following query failed: {source}"))]
    IsFollowing {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The remove_follow delete failed: {source}"))]
    RemoveFollow {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The tweet-ids-by-user query failed: {source}"))]
    TweetIds {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The tweet lookup failed: {source}"))]
    TweetQuery {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The user-exists query failed: {source}"))]
    UserExists {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The user lookup failed: {source}"))]
    UserQuery {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_foreign_key_violation())
}

/// `starling`-specific PostgreSQL handle
///
/// Wraps a bounded [PgPool](sqlx::PgPool) shared by the HTTP handlers and all three consumers.
/// The pool size & lifetime follow the sizing the service has always run with: 25 connections,
/// recycled after five minutes, with a five-second acquisition deadline so a wedged store can't
/// hold a consumer hostage.
pub struct Store {
    pool: sqlx::PgPool,
}

impl Store {
    /// [Store] constructor; `url` is a `postgres://` connection string.
    pub async fn new(url: &str) -> Result<Store> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(25)
            .max_lifetime(Duration::from_secs(300))
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .context(ConnectSnafu)?;
        info!("Connected to PostgreSQL.");
        Ok(Store { pool })
    }
}

#[async_trait]
impl storage::Backend for Store {
    async fn add_user(&self, username: &Username) -> StdResult<User, storage::Error> {
        let now = Utc::now();
        sqlx::query_as::<_, User>(
            "INSERT INTO users (username, created_at, updated_at) VALUES ($1, $2, $3) \
             RETURNING id, username, created_at, updated_at",
        )
        .bind(username)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                storage::UsernameClaimedSnafu {
                    username: username.to_string(),
                }
                .build()
            } else {
                storage::Error::new(AddUserSnafu.into_error(err))
            }
        })
    }

    async fn user_by_id(&self, id: UserId) -> StdResult<Option<User>, storage::Error> {
        sqlx::query_as::<_, User>(
            "SELECT id, username, created_at, updated_at FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| storage::Error::new(UserQuerySnafu.into_error(err)))
    }

    async fn user_exists(&self, id: UserId) -> StdResult<bool, storage::Error> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM users WHERE id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| storage::Error::new(UserExistsSnafu.into_error(err)))
    }

    async fn create_tweet(
        &self,
        author: UserId,
        content: &TweetContent,
    ) -> StdResult<Tweet, storage::Error> {
        let now = Utc::now();
        sqlx::query_as::<_, Tweet>(
            "INSERT INTO tweets (author_id, content, created_at, updated_at) \
             VALUES ($1, $2, $3, $4) \
             RETURNING id, author_id, content, created_at, updated_at",
        )
        .bind(author)
        .bind(content)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| {
            if is_foreign_key_violation(&err) {
                storage::UnknownAuthorSnafu { author }.build()
            } else {
                storage::Error::new(CreateTweetSnafu.into_error(err))
            }
        })
    }

    async fn tweet_by_id(&self, id: TweetId) -> StdResult<Option<Tweet>, storage::Error> {
        sqlx::query_as::<_, Tweet>(
            "SELECT id, author_id, content, created_at, updated_at FROM tweets WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| storage::Error::new(TweetQuerySnafu.into_error(err)))
    }

    async fn get_followers(&self, user: UserId) -> StdResult<Vec<UserId>, storage::Error> {
        sqlx::query_scalar::<_, UserId>("SELECT follower_id FROM follows WHERE followed_id = $1")
            .bind(user)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| storage::Error::new(FollowersSnafu.into_error(err)))
    }

    async fn get_tweet_ids_by_user(&self, user: UserId) -> StdResult<Vec<TweetId>, storage::Error> {
        // Newest-first; the id is a tiebreak for tweets stamped within the same microsecond
        // (ids are monotonic, so this refines rather than contradicts the timestamp order).
        sqlx::query_scalar::<_, TweetId>(
            "SELECT id FROM tweets WHERE author_id = $1 ORDER BY created_at DESC, id DESC",
        )
        .bind(user)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| storage::Error::new(TweetIdsSnafu.into_error(err)))
    }

    async fn add_follow(
        &self,
        follower: UserId,
        followed: UserId,
        at: &chrono::DateTime<Utc>,
    ) -> StdResult<(), storage::Error> {
        sqlx::query("INSERT INTO follows (follower_id, followed_id, created_at) VALUES ($1, $2, $3)")
            .bind(follower)
            .bind(followed)
            .bind(at)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|err| {
                if is_unique_violation(&err) {
                    storage::DuplicateFollowSnafu { follower, followed }.build()
                } else {
                    storage::Error::new(AddFollowSnafu.into_error(err))
                }
            })
    }

    async fn remove_follow(
        &self,
        follower: UserId,
        followed: UserId,
    ) -> StdResult<bool, storage::Error> {
        sqlx::query("DELETE FROM follows WHERE follower_id = $1 AND followed_id = $2")
            .bind(follower)
            .bind(followed)
            .execute(&self.pool)
            .await
            .map(|done| done.rows_affected() > 0)
            .map_err(|err| storage::Error::new(RemoveFollowSnafu.into_error(err)))
    }

    async fn is_following(
        &self,
        follower: UserId,
        followed: UserId,
    ) -> StdResult<bool, storage::Error> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM follows WHERE follower_id = $1 AND followed_id = $2)",
        )
        .bind(follower)
        .bind(followed)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| storage::Error::new(IsFollowingSnafu.into_error(err)))
    }
}
