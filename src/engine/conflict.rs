use chrono::NaiveDate;
use chrono_tz::Tz;
use rust_decimal::Decimal;

use crate::calendar::{self, Weekday};
use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Fails with the first active booking whose window overlaps `span`.
pub(crate) fn check_no_overlap(existing: &[Booking], span: &Span) -> Result<(), EngineError> {
    match existing
        .iter()
        .find(|b| b.is_active() && b.span().overlaps(span))
    {
        Some(b) => Err(EngineError::Overlap(b.id)),
        None => Ok(()),
    }
}

/// Shape checks on a requested service list. Returns `(total minutes, total cost)`.
pub(crate) fn validate_services(services: &[Service]) -> Result<(u32, Decimal), EngineError> {
    if services.is_empty() {
        return Err(EngineError::InvalidInput("at least one service is required".into()));
    }
    if services.len() > MAX_SERVICES_PER_BOOKING {
        return Err(EngineError::LimitExceeded("too many services in one booking"));
    }
    let mut minutes: u32 = 0;
    let mut cost = Decimal::ZERO;
    for s in services {
        if s.name.trim().is_empty() {
            return Err(EngineError::InvalidInput("service name must not be empty".into()));
        }
        if s.duration == 0 {
            return Err(EngineError::InvalidInput(format!("service {:?} has no duration", s.name)));
        }
        if s.price.is_sign_negative() {
            return Err(EngineError::InvalidInput(format!("service {:?} has a negative price", s.name)));
        }
        minutes = minutes.saturating_add(s.duration);
        cost += s.price;
    }
    if minutes > MAX_BOOKING_MINUTES {
        return Err(EngineError::LimitExceeded("booking longer than a day"));
    }
    Ok((minutes, cost))
}

/// The booking must start and end inside the opening hours of its local day,
/// and that day must not be blocked.
pub(crate) fn check_within_hours(
    business: &Business,
    tz: Tz,
    date: NaiveDate,
    start_minute: u16,
    minutes: u32,
) -> Result<(), EngineError> {
    if business.is_blocked(date) {
        return Err(EngineError::PreconditionFailed(format!("{date} is blocked")));
    }
    let day = Weekday::of(date);
    let slot = business.schedule.slot(day);
    if slot.is_closed() {
        return Err(EngineError::PreconditionFailed(format!("closed on {}", day.as_str())));
    }
    if !slot.fits(u32::from(start_minute), minutes) {
        return Err(EngineError::PreconditionFailed(format!(
            "outside business hours {}-{} on {}",
            calendar::format_time_of_day(slot.open),
            calendar::format_time_of_day(slot.close),
            day.as_str()
        )));
    }
    // A DST gap inside the window would make the wall-clock check meaningless.
    if calendar::local_instant(tz, date, start_minute).is_none() {
        return Err(EngineError::PreconditionFailed(format!(
            "{date} {} does not exist locally",
            calendar::format_time_of_day(start_minute)
        )));
    }
    Ok(())
}

/// Every requested service must be offered verbatim.
pub(crate) fn check_services_offered(business: &Business, services: &[Service]) -> Result<(), EngineError> {
    match services.iter().find(|s| !business.offers(s)) {
        Some(s) => Err(EngineError::InvalidInput(format!(
            "service {:?} ({} min, {}) is not offered by this business",
            s.name, s.duration, s.price
        ))),
        None => Ok(()),
    }
}

pub(crate) fn validate_notes(notes: &str) -> Result<(), EngineError> {
    if notes.len() > MAX_NOTES_LEN {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    Ok(())
}

/// Schedule, services, blocked dates and settings a business may save.
pub(crate) fn validate_business_config(config: &BusinessConfig) -> Result<(), EngineError> {
    if config.name.trim().is_empty() {
        return Err(EngineError::InvalidInput("business name must not be empty".into()));
    }
    if config.name.len() > MAX_NAME_LEN || config.location.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name or location too long"));
    }
    for day in Weekday::ALL {
        let slot = config.schedule.slot(day);
        if !slot.is_valid() {
            return Err(EngineError::InvalidInput(format!(
                "{}: opening {} must precede closing {}",
                day.as_str(),
                calendar::format_time_of_day(slot.open),
                calendar::format_time_of_day(slot.close)
            )));
        }
    }
    if !ALLOWED_SLOT_INTERVALS.contains(&config.slot_interval) {
        return Err(EngineError::InvalidInput(format!(
            "slot interval must be one of {ALLOWED_SLOT_INTERVALS:?}, got {}",
            config.slot_interval
        )));
    }
    if config.cancel_notice_hours > MAX_CANCEL_NOTICE_HOURS {
        return Err(EngineError::LimitExceeded("cancellation notice too long"));
    }
    if config.services.len() > MAX_SERVICES_PER_BUSINESS {
        return Err(EngineError::LimitExceeded("too many services"));
    }
    for s in &config.services {
        if s.name.trim().is_empty() || s.duration == 0 || s.duration > MAX_BOOKING_MINUTES {
            return Err(EngineError::InvalidInput(format!("invalid service {:?}", s.name)));
        }
        if s.price.is_sign_negative() {
            return Err(EngineError::InvalidInput(format!("service {:?} has a negative price", s.name)));
        }
    }
    if config.blocked_dates.len() > MAX_BLOCKED_DATES {
        return Err(EngineError::LimitExceeded("too many blocked dates"));
    }
    Ok(())
}
