use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ulid::Ulid;

use crate::model::*;

/// A document together with the number of committed writes it has seen.
/// Absent documents are at version 0.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub version: u64,
    pub doc: T,
}

/// Everything a transaction can read, for optimistic validation at commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReadKey {
    Business(String),
    User(String),
    Booking(Ulid),
    /// The set of bookings of one business and their states.
    BusinessBookings(String),
    BookingSeq,
    UserSeq,
}

/// Max-so-far sequence number. Readers load `version` before `max`; writers
/// store `max` before `version`.
#[derive(Default)]
struct SeqCounter {
    version: AtomicU64,
    max: AtomicU64,
}

impl SeqCounter {
    fn read(&self) -> (u64, u64) {
        let version = self.version.load(Ordering::Acquire);
        (version, self.max.load(Ordering::Acquire))
    }

    fn observe(&self, seq: u64) {
        self.max.fetch_max(seq, Ordering::AcqRel);
        self.version.fetch_add(1, Ordering::AcqRel);
    }
}

/// Committed state. All mutation goes through [`DocumentStore::apply`], which
/// the engine only calls from inside its commit section (or during replay).
#[derive(Default)]
pub struct DocumentStore {
    businesses: DashMap<String, Versioned<Business>>,
    users: DashMap<String, Versioned<User>>,
    bookings: DashMap<Ulid, Versioned<Booking>>,
    by_business: DashMap<String, Versioned<Vec<Ulid>>>,
    by_client: DashMap<String, Vec<Ulid>>,
    booking_seq: SeqCounter,
    user_seq: SeqCounter,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Versioned reads ──────────────────────────────────────

    pub fn business_versioned(&self, id: &str) -> (u64, Option<Business>) {
        match self.businesses.get(id) {
            Some(e) => (e.version, Some(e.doc.clone())),
            None => (0, None),
        }
    }

    pub fn user_versioned(&self, id: &str) -> (u64, Option<User>) {
        match self.users.get(id) {
            Some(e) => (e.version, Some(e.doc.clone())),
            None => (0, None),
        }
    }

    pub fn booking_versioned(&self, id: &Ulid) -> (u64, Option<Booking>) {
        match self.bookings.get(id) {
            Some(e) => (e.version, Some(e.doc.clone())),
            None => (0, None),
        }
    }

    /// Partition version plus every booking of the business.
    pub fn business_bookings_versioned(&self, business_id: &str) -> (u64, Vec<Booking>) {
        let (version, ids) = match self.by_business.get(business_id) {
            Some(e) => (e.version, e.doc.clone()),
            None => return (0, Vec::new()),
        };
        let bookings = ids
            .iter()
            .filter_map(|id| self.bookings.get(id).map(|e| e.doc.clone()))
            .collect();
        (version, bookings)
    }

    pub fn booking_seq(&self) -> (u64, u64) {
        self.booking_seq.read()
    }

    pub fn user_seq(&self) -> (u64, u64) {
        self.user_seq.read()
    }

    /// Current version of `key`, compared against what a transaction read.
    pub fn version(&self, key: &ReadKey) -> u64 {
        match key {
            ReadKey::Business(id) => self.businesses.get(id).map_or(0, |e| e.version),
            ReadKey::User(id) => self.users.get(id).map_or(0, |e| e.version),
            ReadKey::Booking(id) => self.bookings.get(id).map_or(0, |e| e.version),
            ReadKey::BusinessBookings(id) => self.by_business.get(id).map_or(0, |e| e.version),
            ReadKey::BookingSeq => self.booking_seq.read().0,
            ReadKey::UserSeq => self.user_seq.read().0,
        }
    }

    // ── Snapshot reads ───────────────────────────────────────

    pub fn business(&self, id: &str) -> Option<Business> {
        self.businesses.get(id).map(|e| e.doc.clone())
    }

    pub fn user(&self, id: &str) -> Option<User> {
        self.users.get(id).map(|e| e.doc.clone())
    }

    pub fn booking(&self, id: &Ulid) -> Option<Booking> {
        self.bookings.get(id).map(|e| e.doc.clone())
    }

    pub fn bookings_of_business(&self, business_id: &str) -> Vec<Booking> {
        self.business_bookings_versioned(business_id).1
    }

    pub fn bookings_of_client(&self, client_id: &str) -> Vec<Booking> {
        let ids = self
            .by_client
            .get(client_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.booking(id)).collect()
    }

    /// Linear scan; used by the once-a-day reminder run.
    pub fn bookings_matching(&self, pred: impl Fn(&Booking) -> bool) -> Vec<Booking> {
        self.bookings
            .iter()
            .filter(|e| pred(&e.doc))
            .map(|e| e.doc.clone())
            .collect()
    }

    pub fn booking_count(&self) -> usize {
        self.bookings.len()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    // ── Event application ────────────────────────────────────

    /// Data is written before its version is bumped.
    pub fn apply(&self, event: &Event) {
        match event {
            Event::UserRegistered { user, business } => {
                put(&self.users, user.id.clone(), user.clone());
                if let Some(business) = business {
                    put(&self.businesses, business.id.clone(), business.clone());
                }
                self.user_seq.observe(user.seq);
            }
            Event::PushTokenAdded { user_id, token, at } => {
                if let Some(mut e) = self.users.get_mut(user_id) {
                    if !e.doc.push_tokens.contains(token) {
                        e.doc.push_tokens.push(token.clone());
                    }
                    e.doc.updated_at = *at;
                    e.version += 1;
                }
            }
            Event::AccountDeleted { user_id, at } => {
                if let Some(mut e) = self.users.get_mut(user_id) {
                    e.doc.deleted = true;
                    e.doc.updated_at = *at;
                    e.version += 1;
                }
                if let Some(mut e) = self.businesses.get_mut(user_id) {
                    e.doc.deleted = true;
                    e.doc.updated_at = *at;
                    e.version += 1;
                }
            }
            Event::BusinessUpdated { business } => {
                put(&self.businesses, business.id.clone(), business.clone());
            }
            Event::BookingCreated { booking } => {
                let id = booking.id;
                let is_new = !self.bookings.contains_key(&id);
                put(&self.bookings, id, booking.clone());
                if is_new {
                    self.by_client
                        .entry(booking.client_id.clone())
                        .or_default()
                        .push(id);
                }
                let mut partition = self
                    .by_business
                    .entry(booking.business_id.clone())
                    .or_insert_with(|| Versioned { version: 0, doc: Vec::new() });
                if is_new {
                    partition.doc.push(id);
                }
                partition.version += 1;
                drop(partition);
                self.booking_seq.observe(booking.seq);
            }
            Event::BookingStateChanged {
                id,
                business_id,
                state,
                at,
            } => {
                if let Some(mut e) = self.bookings.get_mut(id) {
                    e.doc.state = *state;
                    e.doc.updated_at = *at;
                    e.version += 1;
                }
                if let Some(mut partition) = self.by_business.get_mut(business_id) {
                    partition.version += 1;
                }
            }
        }
    }

    /// Minimal event list that rebuilds the current state.
    pub fn snapshot_events(&self) -> Vec<Event> {
        let mut users: Vec<User> = self.users.iter().map(|e| e.doc.clone()).collect();
        users.sort_by_key(|u| u.seq);

        let mut events = Vec::with_capacity(users.len() + self.bookings.len());
        for user in users {
            let business = self.business(&user.id);
            events.push(Event::UserRegistered { user, business });
        }
        for e in self.businesses.iter() {
            if !self.users.contains_key(e.key()) {
                events.push(Event::BusinessUpdated {
                    business: e.doc.clone(),
                });
            }
        }

        let mut bookings: Vec<Booking> = self.bookings.iter().map(|e| e.doc.clone()).collect();
        bookings.sort_by_key(|b| b.seq);
        events.extend(bookings.into_iter().map(|booking| Event::BookingCreated { booking }));
        events
    }
}

fn put<K, T>(map: &DashMap<K, Versioned<T>>, key: K, doc: T)
where
    K: std::hash::Hash + Eq,
{
    match map.entry(key) {
        Entry::Occupied(mut e) => {
            let slot = e.get_mut();
            slot.doc = doc;
            slot.version += 1;
        }
        Entry::Vacant(e) => {
            e.insert(Versioned { version: 1, doc });
        }
    }
}
