//! Day-before reminders for confirmed bookings.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use chrono_tz::Tz;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::calendar;
use crate::engine::{Engine, EngineError};
use crate::model::{Booking, Ms, Span};
use crate::push::{PushMessage, PushSender};

pub const REMINDER_TITLE: &str = "Recordatorio de tu cita";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReminderReport {
    /// Confirmed bookings starting tomorrow.
    pub bookings: usize,
    pub attempted: usize,
    pub failed: usize,
    /// Bookings whose client, business or device tokens were missing.
    pub skipped: usize,
}

/// Tomorrow's date and its `[local midnight, next local midnight)` window.
pub fn tomorrow_window(tz: Tz, now: Ms) -> Option<(NaiveDate, Span)> {
    let tomorrow = calendar::local_date(tz, now)?.succ_opt()?;
    let (start, end) = calendar::day_bounds(tz, tomorrow)?;
    Some((tomorrow, Span::new(start, end)))
}

pub fn reminder_body(business_name: &str, local_time: &str) -> String {
    format!("Mañana tienes una cita en {business_name} a las {local_time}")
}

/// Send one reminder per device of every client with a confirmed booking
/// tomorrow. Individual send failures are counted and logged, never returned.
pub async fn dispatch_reminders(
    engine: &Engine,
    sender: &dyn PushSender,
    now: Ms,
) -> Result<ReminderReport, EngineError> {
    let tz = engine.tz();
    let (date, window) = tomorrow_window(tz, now)
        .ok_or_else(|| EngineError::InvalidInput("cannot compute tomorrow's window".into()))?;
    let bookings = engine.confirmed_bookings_starting_in(&window);
    debug!(%date, bookings = bookings.len(), "reminder scan");

    let mut report = ReminderReport {
        bookings: bookings.len(),
        ..ReminderReport::default()
    };

    for booking in &bookings {
        let Some(messages) = messages_for(engine, tz, booking) else {
            report.skipped += 1;
            continue;
        };
        let results = join_all(messages.iter().map(|m| sender.send(m))).await;
        for (message, result) in messages.iter().zip(results) {
            report.attempted += 1;
            match result {
                Ok(()) => {
                    metrics::counter!(crate::observability::REMINDER_SENDS_TOTAL, "status" => "ok").increment(1);
                }
                Err(e) => {
                    report.failed += 1;
                    metrics::counter!(crate::observability::REMINDER_SENDS_TOTAL, "status" => "error").increment(1);
                    warn!(booking = %booking.id, token = %message.token, error = %e, "reminder send failed");
                }
            }
        }
    }

    metrics::counter!(crate::observability::REMINDER_SKIPPED_TOTAL).increment(report.skipped as u64);
    info!(
        %date,
        bookings = report.bookings,
        attempted = report.attempted,
        failed = report.failed,
        skipped = report.skipped,
        "reminders dispatched"
    );
    Ok(report)
}

/// `None` when there is nobody to notify.
fn messages_for(engine: &Engine, tz: Tz, booking: &Booking) -> Option<Vec<PushMessage>> {
    let client = engine.store.user(&booking.client_id).filter(|u| !u.deleted)?;
    if client.push_tokens.is_empty() {
        return None;
    }
    let business = engine.store.business(&booking.business_id)?;
    let time = calendar::format_local_time(tz, booking.start)?;
    let body = reminder_body(&business.name, &time);
    let data = BTreeMap::from([
        ("tipo".to_string(), "recordatorio".to_string()),
        ("reservaId".to_string(), booking.id.to_string()),
    ]);
    Some(
        client
            .push_tokens
            .iter()
            .map(|token| PushMessage {
                token: token.clone(),
                title: REMINDER_TITLE.to_string(),
                body: body.clone(),
                data: data.clone(),
            })
            .collect(),
    )
}
