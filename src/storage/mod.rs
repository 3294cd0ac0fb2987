// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage backends.
//!
//! - [`traits::CacheStore`]: fast shared cache ([`redis::RedisStore`], [`memory::InMemoryCache`])
//! - [`traits::ArchiveStore`]: durable counter store ([`sql::SqlStore`], [`memory::InMemoryArchive`])

pub mod memory;
pub mod redis;
pub mod sql;
pub mod traits;
