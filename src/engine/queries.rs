use chrono::NaiveDate;
use tracing::debug;
use ulid::Ulid;

use crate::auth::Caller;
use crate::calendar;
use crate::limits::*;
use crate::model::*;

use super::availability::compute_availability;
use super::{Engine, EngineError};

impl Engine {
    /// Free start times per date for a `duration`-minute appointment between
    /// `from` and `to` inclusive. Plain snapshot reads, no transaction.
    pub fn availability(
        &self,
        business_id: &str,
        duration: u32,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Availability, EngineError> {
        if duration == 0 || duration > MAX_BOOKING_MINUTES {
            return Err(EngineError::InvalidInput(format!(
                "duration must be between 1 and {MAX_BOOKING_MINUTES} minutes"
            )));
        }
        if (to - from).num_days().max(0) + 1 > MAX_QUERY_DAYS {
            return Err(EngineError::LimitExceeded("availability range too wide"));
        }
        let business = self
            .store
            .business(business_id)
            .filter(|b| !b.deleted)
            .ok_or_else(|| EngineError::not_found("business", business_id))?;
        if to < from {
            return Ok(Availability::new());
        }

        let tz = self.tz();
        let window = match (calendar::day_bounds(tz, from), calendar::day_bounds(tz, to)) {
            (Some((start, _)), Some((_, end))) => Span::new(start, end),
            _ => return Err(EngineError::InvalidInput("date range out of bounds".into())),
        };
        let bookings: Vec<Booking> = self
            .store
            .bookings_of_business(business_id)
            .into_iter()
            .filter(|b| b.is_active() && b.span().overlaps(&window))
            .collect();

        let avail = compute_availability(&business, &bookings, duration, from, to, tz);
        debug!(business = business_id, %from, %to, duration, days = avail.len(), "availability computed");
        Ok(avail)
    }

    pub fn get_business(&self, id: &str) -> Result<Business, EngineError> {
        self.store
            .business(id)
            .filter(|b| !b.deleted)
            .ok_or_else(|| EngineError::not_found("business", id))
    }

    /// The caller's own profile.
    pub fn get_user(&self, caller: &Caller) -> Result<User, EngineError> {
        let uid = caller.require()?;
        self.store
            .user(uid)
            .filter(|u| !u.deleted)
            .ok_or_else(|| EngineError::not_found("user", uid))
    }

    /// A booking visible to its client or its business.
    pub fn get_booking(&self, caller: &Caller, id: Ulid) -> Result<Booking, EngineError> {
        let uid = caller.require()?;
        let booking = self
            .store
            .booking(&id)
            .filter(|b| !b.deleted)
            .ok_or_else(|| EngineError::not_found("booking", id))?;
        if booking.client_id != uid && booking.business_id != uid {
            return Err(EngineError::Unauthorized("not a party to this booking"));
        }
        Ok(booking)
    }

    /// Non-deleted bookings of a business or a client, ordered by start. Callers
    /// only see lists they are the business or the client of.
    pub fn list_bookings(&self, caller: &Caller, filter: &BookingFilter) -> Result<Vec<Booking>, EngineError> {
        let uid = caller.require()?;
        let mut bookings = match filter {
            BookingFilter::Id(id) => return self.get_booking(caller, *id).map(|b| vec![b]),
            BookingFilter::Business(id) => {
                if id != uid {
                    return Err(EngineError::Unauthorized("only the business can list its bookings"));
                }
                self.store.bookings_of_business(id)
            }
            BookingFilter::Client(id) => {
                if id != uid {
                    return Err(EngineError::Unauthorized("clients can only list their own bookings"));
                }
                self.store.bookings_of_client(id)
            }
        };
        bookings.retain(|b| !b.deleted);
        bookings.sort_by_key(|b| (b.start, b.seq));
        Ok(bookings)
    }

    /// Non-deleted confirmed bookings whose start lies in `window`.
    pub fn confirmed_bookings_starting_in(&self, window: &Span) -> Vec<Booking> {
        let mut bookings = self.store.bookings_matching(|b| {
            !b.deleted && b.state == BookingState::Confirmed && window.contains_instant(b.start)
        });
        bookings.sort_by_key(|b| b.start);
        bookings
    }
}
