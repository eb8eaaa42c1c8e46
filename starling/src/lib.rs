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

//! # starling
//!
//! A social-media backend serving per-user home timelines. The interesting part is the write
//! path: tweets, follows & unfollows each land on a durable log topic, and three consumers
//! materialise their consequences into a per-user cached timeline. The read path just reads the
//! cache.
//!
//! Right now, the library crate has the same name as the binary, meaning that `rustdoc` will
//! ignore the binary crate.
pub mod apply;
pub mod bus;
pub mod entities;
pub mod events;
pub mod fanout;
pub mod http;
pub mod postgres;
pub mod reconcile;
pub mod redis;
pub mod starling;
pub mod storage;
#[cfg(test)]
pub(crate) mod testing;
#[path = "timeline-cache.rs"]
pub mod timeline_cache;
pub mod timelines;
pub mod tweets;
pub mod users;
