//! Property-based tests (fuzzing) for counter and ranking invariants.
//!
//! Uses proptest to generate random histories and malformed inputs and
//! verify that decoding never panics, aggregation is order independent, and
//! ranks follow competition ranking.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::cmp::Ordering;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use proptest::prelude::*;

use tally_engine::activity::{CounterKey, CounterRecord, LeaderboardFilter};
use tally_engine::platform::{cmp_ids, PlatformMessage};
use tally_engine::ranking::assign_ranks;
use tally_engine::storage::traits::UserTotal;
use tally_engine::sync::aggregate::Aggregate;
use tally_engine::PageSnapshot;

// =============================================================================
// Strategies for generating test data
// =============================================================================

fn base_time() -> DateTime<Utc> {
    "2024-01-01T00:00:00Z".parse().unwrap()
}

/// A message from a small pool of users/channels over a few days.
/// Ids are assigned by [`history_strategy`].
fn message_strategy() -> impl Strategy<Value = PlatformMessage> {
    (0usize..5, 0usize..3, 0i64..(4 * 24 * 60), prop::bool::weighted(0.1)).prop_map(
        |(user, channel, minutes, bot)| PlatformMessage {
            id: String::new(),
            channel_id: format!("c{channel}"),
            author_id: format!("u{user}"),
            author_is_bot: bot,
            created_at: base_time() + Duration::minutes(minutes),
        },
    )
}

/// Messages with unique ids, in arbitrary order.
fn history_strategy() -> impl Strategy<Value = Vec<PlatformMessage>> {
    prop::collection::vec(message_strategy(), 0..200)
        .prop_map(|mut messages| {
            for (i, message) in messages.iter_mut().enumerate() {
                message.id = (1_000 + i * 7).to_string();
            }
            messages
        })
        .prop_shuffle()
}

fn tally(messages: &[PlatformMessage]) -> Aggregate {
    let mut aggregate = Aggregate::new();
    for message in messages {
        aggregate.observe(message);
    }
    aggregate
}

// =============================================================================
// Decoding Fuzz Tests
// =============================================================================

proptest! {
    /// Counter key decoding never panics on arbitrary fields
    #[test]
    fn fuzz_counter_key_from_arbitrary_field(field in ".*") {
        let _ = field.parse::<CounterKey>();
    }

    /// Decoding accepts exactly what encoding produces
    #[test]
    fn prop_counter_key_field_roundtrip(
        user in "[0-9]{1,20}",
        channel in "[0-9]{1,20}",
        days in 0i64..20_000,
    ) {
        let date = NaiveDate::from_ymd_opt(1990, 1, 1).unwrap() + Duration::days(days);
        let key = CounterKey::new(user, channel, date);
        prop_assert_eq!(key.encode().parse::<CounterKey>().unwrap(), key);
    }

    /// Snapshot payloads from the cache never panic the decoder
    #[test]
    fn fuzz_page_snapshot_from_random_bytes(bytes in prop::collection::vec(any::<u8>(), 0..2000)) {
        let _ = serde_json::from_slice::<PageSnapshot>(&bytes);
    }

    /// Filters that differ never share a snapshot key suffix
    #[test]
    fn prop_filter_signatures_distinct(
        a in prop::option::of("[0-9]{1,6}"),
        b in prop::option::of("[0-9]{1,6}"),
        da in prop::option::of(0i64..100),
        db in prop::option::of(0i64..100),
    ) {
        let day = |d: i64| base_time().date_naive() + Duration::days(d);
        let fa = LeaderboardFilter { channel_id: a, date: da.map(day) };
        let fb = LeaderboardFilter { channel_id: b, date: db.map(day) };
        prop_assert_eq!(fa == fb, fa.signature() == fb.signature());
    }
}

// =============================================================================
// Aggregation Properties
// =============================================================================

proptest! {
    /// Merging worker tallies gives the same counts in any order
    #[test]
    fn prop_merge_is_commutative(history in history_strategy(), split in 0usize..200) {
        let split = split.min(history.len());
        let (left, right) = history.split_at(split);

        let mut lr = tally(left);
        lr.merge(tally(right));
        let mut rl = tally(right);
        rl.merge(tally(left));

        prop_assert_eq!(lr.messages(), rl.messages());
        prop_assert_eq!(lr.newest().cloned(), rl.newest().cloned());
        prop_assert_eq!(lr.into_records("g"), rl.into_records("g"));
    }

    /// Chunking a history across any number of workers never double counts
    #[test]
    fn prop_chunking_preserves_counts(history in history_strategy(), workers in 1usize..9) {
        let whole = tally(&history);
        let humans = history.iter().filter(|m| !m.author_is_bot).count() as u64;
        prop_assert_eq!(whole.messages(), humans);

        let size = history.len().div_ceil(workers).max(1);
        let mut merged = Aggregate::new();
        for chunk in history.chunks(size) {
            merged.merge(tally(chunk));
        }
        prop_assert_eq!(merged.into_records("g"), whole.into_records("g"));
    }

    /// Record counts sum to the number of counted messages
    #[test]
    fn prop_records_sum_to_messages(history in history_strategy()) {
        let aggregate = tally(&history);
        let messages = aggregate.messages();
        let records: Vec<CounterRecord> = aggregate.into_records("g");
        prop_assert_eq!(records.iter().map(|r| r.count).sum::<u64>(), messages);
        prop_assert!(records.iter().all(|r| r.count > 0));
    }

    /// Nothing at or after the cutoff is counted
    #[test]
    fn prop_cutoff_excludes_later_messages(history in history_strategy(), cutoff_minutes in 0i64..(4 * 24 * 60)) {
        let cutoff = base_time() + Duration::minutes(cutoff_minutes);
        let mut aggregate = Aggregate::with_cutoff(cutoff);
        for message in &history {
            aggregate.observe(message);
        }
        let expected = history
            .iter()
            .filter(|m| !m.author_is_bot && m.created_at < cutoff)
            .count() as u64;
        prop_assert_eq!(aggregate.messages(), expected);
    }
}

// =============================================================================
// Ranking Properties
// =============================================================================

proptest! {
    /// rank = 1 + number of users with a strictly greater total
    #[test]
    fn prop_competition_ranks(mut totals in prop::collection::vec(1u64..50, 0..60)) {
        totals.sort_unstable_by(|a, b| b.cmp(a));
        let rows: Vec<UserTotal> = totals
            .iter()
            .enumerate()
            .map(|(i, t)| UserTotal::new(format!("u{i}"), *t))
            .collect();

        let ranked = assign_ranks(rows, 0, 1);
        for row in &ranked {
            let above = totals.iter().filter(|t| **t > row.total).count() as u64;
            prop_assert_eq!(row.rank, above + 1);
        }
    }

    /// A page ranked on its own agrees with the same rows ranked in full
    #[test]
    fn prop_page_ranks_match_full_ranking(
        mut totals in prop::collection::vec(1u64..20, 1..60),
        page_size in 1usize..10,
    ) {
        totals.sort_unstable_by(|a, b| b.cmp(a));
        let rows: Vec<UserTotal> = totals
            .iter()
            .enumerate()
            .map(|(i, t)| UserTotal::new(format!("u{i}"), *t))
            .collect();
        let full = assign_ranks(rows.clone(), 0, 1);

        for (page, chunk) in rows.chunks(page_size).enumerate() {
            let offset = (page * page_size) as u64;
            let first_rank = full[page * page_size].rank;
            let ranked = assign_ranks(chunk.to_vec(), offset, first_rank);
            for (i, row) in ranked.iter().enumerate() {
                prop_assert_eq!(row.rank, full[page * page_size + i].rank);
            }
        }
    }

    /// Snowflake ordering matches numeric ordering
    #[test]
    fn prop_cmp_ids_numeric(a in any::<u64>(), b in any::<u64>()) {
        prop_assert_eq!(cmp_ids(&a.to_string(), &b.to_string()), a.cmp(&b));
        prop_assert_eq!(cmp_ids(&a.to_string(), &a.to_string()), Ordering::Equal);
    }
}
