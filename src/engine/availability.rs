//! Free start times from a business's weekly hours, blocked dates and
//! existing bookings. Pure: the caller supplies the snapshot.

use chrono::NaiveDate;
use chrono_tz::Tz;

use crate::calendar::{self, Weekday};
use crate::model::*;

/// Free starts per date for a `duration`-minute appointment. Dates that are
/// blocked, closed or fully booked are left out.
pub fn compute_availability(
    business: &Business,
    bookings: &[Booking],
    duration: u32,
    from: NaiveDate,
    to: NaiveDate,
    tz: Tz,
) -> Availability {
    let mut out = Availability::new();
    for date in calendar::date_range(from, to) {
        if business.is_blocked(date) {
            continue;
        }
        let slot = business.schedule.slot(Weekday::of(date));
        if slot.is_closed() {
            continue;
        }
        let starts = free_starts(slot, business.granularity(), bookings, duration, date, tz);
        if !starts.is_empty() {
            out.insert(date, starts.into_iter().map(calendar::format_time_of_day).collect());
        }
    }
    out
}

/// Candidate starts from `open` while the appointment still ends by `close`,
/// stepping by `step` minutes; keeps the ones no active booking overlaps.
pub fn free_starts(
    slot: DaySlot,
    step: u16,
    bookings: &[Booking],
    duration: u32,
    date: NaiveDate,
    tz: Tz,
) -> Vec<u16> {
    if duration == 0 || step == 0 {
        return Vec::new();
    }
    let busy = busy_spans(slot, bookings, date, tz);

    let close = u32::from(slot.close);
    let mut cursor = u32::from(slot.open);
    let mut starts = Vec::new();
    while cursor + duration <= close {
        // cursor < close <= 1440 here
        let minute = cursor as u16;
        if let Some(start) = calendar::local_instant(tz, date, minute) {
            let candidate = Span::from_minutes(start, duration);
            if !busy.iter().any(|b| b.overlaps(&candidate)) {
                starts.push(minute);
            }
        }
        cursor += u32::from(step);
    }
    starts
}

/// Windows of active bookings that touch the day's opening hours, sorted by start.
fn busy_spans(slot: DaySlot, bookings: &[Booking], date: NaiveDate, tz: Tz) -> Vec<Span> {
    let Some((day_start, day_end)) = calendar::day_bounds(tz, date) else {
        return Vec::new();
    };
    let open = calendar::local_instant(tz, date, slot.open).unwrap_or(day_start);
    let close = calendar::local_instant(tz, date, slot.close).unwrap_or(day_end);
    if open >= close {
        return Vec::new();
    }
    let hours = Span::new(open, close);
    let mut spans: Vec<Span> = bookings
        .iter()
        .filter(|b| b.is_active())
        .map(Booking::span)
        .filter(|s| s.overlaps(&hours))
        .collect();
    spans.sort_by_key(|s| s.start);
    spans
}
