use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

use super::store::{DocumentStore, ReadKey};

/// Handle passed to a transaction body. Every read records the version it
/// saw; writes are buffered as events and only reach the store at commit.
/// Reads do not observe the transaction's own buffered writes.
pub struct Transaction<'a> {
    store: &'a DocumentStore,
    reads: HashMap<ReadKey, u64>,
    writes: Vec<Event>,
    now: Ms,
    /// Set when the same key was read at two different versions.
    torn: bool,
}

impl<'a> Transaction<'a> {
    pub(super) fn new(store: &'a DocumentStore, now: Ms) -> Self {
        Self {
            store,
            reads: HashMap::new(),
            writes: Vec::new(),
            now,
            torn: false,
        }
    }

    fn record(&mut self, key: ReadKey, version: u64) {
        let seen = *self.reads.entry(key).or_insert(version);
        if seen != version {
            self.torn = true;
        }
    }

    /// Clock reading fixed for the whole attempt.
    pub fn now(&self) -> Ms {
        self.now
    }

    pub fn business(&mut self, id: &str) -> Option<Business> {
        let (version, doc) = self.store.business_versioned(id);
        self.record(ReadKey::Business(id.to_string()), version);
        doc
    }

    pub fn user(&mut self, id: &str) -> Option<User> {
        let (version, doc) = self.store.user_versioned(id);
        self.record(ReadKey::User(id.to_string()), version);
        doc
    }

    pub fn booking(&mut self, id: &Ulid) -> Option<Booking> {
        let (version, doc) = self.store.booking_versioned(id);
        self.record(ReadKey::Booking(*id), version);
        doc
    }

    /// Bookings of `business_id` overlapping `window`. The whole partition is
    /// recorded as read, so any booking created or changed for the business
    /// before commit invalidates this transaction.
    pub fn bookings_of_business(&mut self, business_id: &str, window: &Span) -> Vec<Booking> {
        let (version, bookings) = self.store.business_bookings_versioned(business_id);
        self.record(ReadKey::BusinessBookings(business_id.to_string()), version);
        bookings
            .into_iter()
            .filter(|b| b.span().overlaps(window))
            .collect()
    }

    pub fn next_booking_seq(&mut self) -> u64 {
        let (version, max) = self.store.booking_seq();
        self.record(ReadKey::BookingSeq, version);
        max + 1
    }

    pub fn next_user_seq(&mut self) -> u64 {
        let (version, max) = self.store.user_seq();
        self.record(ReadKey::UserSeq, version);
        max + 1
    }

    pub fn write(&mut self, event: Event) {
        self.writes.push(event);
    }

    pub(super) fn is_torn(&self) -> bool {
        self.torn
    }

    pub(super) fn into_parts(self) -> (HashMap<ReadKey, u64>, Vec<Event>) {
        (self.reads, self.writes)
    }
}
