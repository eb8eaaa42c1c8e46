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
// You should have received a copy of the GNU General Public License along with mpdpopm.  If not,
// see <http://www.gnu.org/licenses/>.

//! # starling models
//!
//! ## Introduction
//!
//! I hate these sort of "catch-all" modules named "models" or "entities", but these types are truly
//! foundational: identifiers, the refined strings that gate what may enter the system, and the
//! rows the store hands back.

use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace};

/// The longest username starling will accept, in characters.
pub const MAX_USERNAME: usize = 50;

/// The longest tweet starling will accept, in characters.
pub const MAX_TWEET: usize = 280;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{name:?} is not a valid starling username"))]
    BadUsername { name: String, backtrace: Backtrace },
    #[snafu(display("Tweet content may not be empty"))]
    EmptyContent { backtrace: Backtrace },
    #[snafu(display("Tweet content of {length} characters exceeds the maximum of {MAX_TWEET}"))]
    OversizedContent { length: usize, backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Identifiers                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// define_id!
///
/// # Introduction
///
/// Use this to declare a type intended to be used as an opaque identifier for some other sort of
/// entity.
///
/// # Background
///
/// Identifiers in starling are assigned by the relational store (`BIGSERIAL` columns), which
/// makes them monotonically-increasing positive 64-bit integers. I could of course just pass
/// `i64`s around, but I couldn't bring myself to use the same type to represent identifiers for
/// users and tweets at the same time-- too many call sites take one of each, and I'd like the
/// compiler to catch a transposition.
///
/// The newtypes serialize transparently (they're bare integers on the wire & in the store), and
/// [Display] formats the raw integer, which is what the partition-key builders in
/// [events](crate::events) want.
///
/// Zero is never assigned by the store; the pipeline uses it as the "not yet assigned" / invalid
/// sentinel, which [`is_nil`](UserId::is_nil) exposes.
macro_rules! define_id {
    ($type_name:ident) => {
        #[derive(
            Clone,
            Copy,
            Debug,
            Deserialize,
            Eq,
            Hash,
            Ord,
            PartialEq,
            PartialOrd,
            Serialize,
            sqlx::Type,
        )]
        #[serde(transparent)]
        #[sqlx(transparent)]
        pub struct $type_name(i64);
        impl $type_name {
            pub const fn new(raw: i64) -> $type_name {
                $type_name(raw)
            }
            pub const fn as_i64(&self) -> i64 {
                self.0
            }
            /// True for the store-unassigned sentinel; events carrying a nil identifier are
            /// poison & skipped by the consumers.
            pub const fn is_nil(&self) -> bool {
                self.0 == 0
            }
        }
        impl From<i64> for $type_name {
            fn from(raw: i64) -> Self {
                $type_name(raw)
            }
        }
        impl Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(UserId);
define_id!(TweetId);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Username                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A refined type representing a starling username
///
/// Usernames are non-empty & no more than [MAX_USERNAME] characters; uniqueness is enforced by
/// the store, not here.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct Username(String);

impl Username {
    pub fn new(name: &str) -> Result<Username> {
        let length = name.chars().count();
        (0 < length && length <= MAX_USERNAME)
            .then_some(Username(name.to_owned()))
            .ok_or(
                BadUsernameSnafu {
                    name: name.to_owned(),
                }
                .build(),
            )
    }
}

impl AsRef<str> for Username {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Username {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Username::new(s)
    }
}

impl Display for Username {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          TweetContent                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A refined type representing the body of a tweet
///
/// Non-empty, no more than [MAX_TWEET] characters. The HTTP layer constructs one of these before
/// anything is published, which is how the "reject with 400 before emission" rule is enforced--
/// there is no way to hand the pipeline unvalidated content.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct TweetContent(String);

impl TweetContent {
    pub fn new(content: &str) -> Result<TweetContent> {
        let length = content.chars().count();
        ensure!(length > 0, EmptyContentSnafu);
        ensure!(length <= MAX_TWEET, OversizedContentSnafu { length });
        Ok(TweetContent(content.to_owned()))
    }
}

impl AsRef<str> for TweetContent {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for TweetContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              rows                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Represents a starling user
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: UserId,
    pub username: Username,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Represents a persisted tweet
///
/// Instances only come out of the store; the `id` and timestamps are assigned there (see
/// [create_tweet](crate::storage::Backend::create_tweet)).
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize, sqlx::FromRow)]
pub struct Tweet {
    pub id: TweetId,
    pub author_id: UserId,
    pub content: TweetContent,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// There's no `FollowEdge` row type: the follow graph lives in the store (`(follower_id,
// followed_id)` unique, no self-edges), & everything this crate does with it goes through
// id-level queries.

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn usernames() {
        assert!(Username::new("sp1ff").is_ok());
        assert!(Username::new("").is_err());
        assert!(Username::new(&"x".repeat(MAX_USERNAME)).is_ok());
        assert!(Username::new(&"x".repeat(MAX_USERNAME + 1)).is_err());
    }

    #[test]
    fn tweet_content() {
        assert!(TweetContent::new("hello").is_ok());
        assert!(matches!(
            TweetContent::new(""),
            Err(Error::EmptyContent { .. })
        ));
        assert!(TweetContent::new(&"x".repeat(MAX_TWEET)).is_ok());
        assert!(matches!(
            TweetContent::new(&"x".repeat(MAX_TWEET + 1)),
            Err(Error::OversizedContent { length: 281, .. })
        ));
        // 280 *characters*, not bytes
        assert!(TweetContent::new(&"é".repeat(MAX_TWEET)).is_ok());
    }

    #[test]
    fn identifiers() {
        let id = TweetId::new(100);
        assert_eq!(format!("{}", id), "100");
        assert!(!id.is_nil());
        assert!(TweetId::new(0).is_nil());
        assert_eq!(serde_json::to_string(&id).unwrap(), "100");
    }
}
