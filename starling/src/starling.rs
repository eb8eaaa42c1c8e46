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

use std::sync::Arc;

use uuid::Uuid;

use crate::{bus::EventSink, storage::Backend as StorageBackend, timeline_cache::TimelineCache};

/// Application state available to all handlers
///
/// The same three clients back the consumers; everything here is shared & safe for concurrent
/// use.
pub struct Starling {
    pub instance_id: Uuid,
    pub storage: Arc<dyn StorageBackend + Send + Sync>,
    pub cache: Arc<dyn TimelineCache + Send + Sync>,
    pub sink: Arc<dyn EventSink + Send + Sync>,
}
