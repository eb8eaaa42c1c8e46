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

//! # storage
//!
//! Abstractions for the starling storage layer. The store is authoritative for users, tweets &
//! follow edges; the pipeline and the HTTP layer both talk to it through [Backend] so that the
//! interesting logic can be exercised against an in-memory double.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::{Backtrace, Snafu};

use crate::entities::{Tweet, TweetContent, TweetId, User, UserId, Username};

/// The storage error type
///
/// Most failure modes are opaque to callers (they log & apply the error-handling policy for
/// their stage regardless of what went wrong underneath), but the two uniqueness violations are
/// load-bearing: the HTTP layer turns them into 409s.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("{source}"))]
    Backend {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
    #[snafu(display("{follower} already follows {followed}"))]
    DuplicateFollow {
        follower: UserId,
        followed: UserId,
        backtrace: Backtrace,
    },
    /// The author a tweet names doesn't exist; not transient (retrying cannot conjure the
    /// user), so the materialiser treats it as poison rather than holding the offset.
    #[snafu(display("No user {author} to attribute a tweet to"))]
    UnknownAuthor {
        author: UserId,
        backtrace: Backtrace,
    },
    #[snafu(display("The username {username} is already claimed"))]
    UsernameClaimed {
        username: String,
        backtrace: Backtrace,
    },
}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Backend {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
}

#[async_trait]
pub trait Backend {
    /// Create a user; the store assigns the id & timestamps. Fails with
    /// [Error::UsernameClaimed] if the username is taken.
    async fn add_user(&self, username: &Username) -> Result<User, Error>;
    /// Retrieve a [User] by id; None means no such user.
    async fn user_by_id(&self, id: UserId) -> Result<Option<User>, Error>;
    /// Does a user with this id exist?
    async fn user_exists(&self, id: UserId) -> Result<bool, Error>;
    /// Persist a tweet; the store assigns the (monotonic) id and the `created_at`/`updated_at`
    /// timestamps & returns the full row.
    async fn create_tweet(&self, author: UserId, content: &TweetContent) -> Result<Tweet, Error>;
    /// Retrieve a [Tweet] by id; None means no such tweet.
    async fn tweet_by_id(&self, id: TweetId) -> Result<Option<Tweet>, Error>;
    /// The ids of everyone following `user` at this moment, in no particular order.
    async fn get_followers(&self, user: UserId) -> Result<Vec<UserId>, Error>;
    /// The ids of every tweet `user` has authored, newest first.
    async fn get_tweet_ids_by_user(&self, user: UserId) -> Result<Vec<TweetId>, Error>;
    /// Record that `follower` follows `followed`; fails with [Error::DuplicateFollow] if the
    /// edge already exists. Self-edges are refused upstream, not here.
    async fn add_follow(
        &self,
        follower: UserId,
        followed: UserId,
        at: &DateTime<Utc>,
    ) -> Result<(), Error>;
    /// Delete the `follower` → `followed` edge; return true if an edge was actually removed.
    async fn remove_follow(&self, follower: UserId, followed: UserId) -> Result<bool, Error>;
    /// Does the `follower` → `followed` edge exist?
    async fn is_following(&self, follower: UserId, followed: UserId) -> Result<bool, Error>;
}
