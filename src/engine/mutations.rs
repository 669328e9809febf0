use chrono::Timelike;
use tracing::{debug, info};
use ulid::Ulid;

use crate::auth::Caller;
use crate::calendar::{self, CalendarError};
use crate::limits::*;
use crate::model::*;

use super::conflict::{
    check_no_overlap, check_services_offered, check_within_hours, validate_business_config,
    validate_notes, validate_services,
};
use super::{Engine, EngineError};

impl Engine {
    /// Book `req.services` at `req.start` for `req.client_id`.
    ///
    /// The client books for themself; the business may book on behalf of any
    /// registered client and then skips the opening-hours and offered-service
    /// checks. The overlap check and sequence number are read inside the
    /// transaction, so of two concurrent overlapping requests at most one
    /// commits.
    pub async fn create_booking(&self, caller: &Caller, req: NewBooking) -> Result<CreatedBooking, EngineError> {
        let uid = caller.require()?;
        let business_mode = uid == req.business_id;
        if uid != req.client_id && !business_mode {
            return Err(EngineError::Unauthorized("only the client or the business can book"));
        }
        if req.business_id.trim().is_empty() || req.client_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("business and client are required".into()));
        }
        let (total_duration, total_cost) = validate_services(&req.services)?;
        let notes = req.notes.clone().unwrap_or_default();
        validate_notes(&notes)?;

        if req.start.second() != 0 || req.start.nanosecond() != 0 {
            return Err(EngineError::InvalidInput("start must fall on a whole minute".into()));
        }

        let tz = self.tz();
        let start = calendar::instant_of(tz, req.start)
            .ok_or_else(|| CalendarError::NonexistentLocalTime(req.start.to_string()))?;
        let date = req.start.date();
        let start_minute = (req.start.hour() * 60 + req.start.minute()) as u16;
        let span = Span::from_minutes(start, total_duration);
        // Generated once so every retry writes the same document.
        let id = Ulid::new();

        let result = self
            .run_transaction("create_booking", |tx| {
                let business = tx
                    .business(&req.business_id)
                    .filter(|b| !b.deleted)
                    .ok_or_else(|| EngineError::not_found("business", &req.business_id))?;
                tx.user(&req.client_id)
                    .filter(|u| !u.deleted)
                    .ok_or_else(|| EngineError::not_found("user", &req.client_id))?;

                if !business_mode {
                    check_within_hours(&business, tz, date, start_minute, total_duration)?;
                    check_services_offered(&business, &req.services)?;
                }

                let existing = tx.bookings_of_business(&req.business_id, &span);
                check_no_overlap(&existing, &span)?;

                let seq = tx.next_booking_seq();
                let now = tx.now();
                tx.write(Event::BookingCreated {
                    booking: Booking {
                        id,
                        seq,
                        client_id: req.client_id.clone(),
                        business_id: req.business_id.clone(),
                        services: req.services.clone(),
                        start,
                        total_duration,
                        total_cost,
                        state: BookingState::Confirmed,
                        notes: notes.clone(),
                        deleted: false,
                        created_at: now,
                        updated_at: now,
                    },
                });
                Ok(CreatedBooking { id, seq })
            })
            .await;

        match &result {
            Ok(created) => info!(
                booking = %created.id,
                seq = created.seq,
                business = %req.business_id,
                client = %req.client_id,
                start = %req.start,
                "booking created"
            ),
            Err(EngineError::Overlap(other)) => {
                metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                debug!(business = %req.business_id, start = %req.start, overlaps = %other, "booking rejected");
            }
            Err(_) => {}
        }
        result
    }

    /// Client (outside the notice window) or business cancels.
    pub async fn cancel_booking(&self, caller: &Caller, id: Ulid) -> Result<(), EngineError> {
        let uid = caller.require()?;
        self.run_transaction("cancel_booking", |tx| {
            let booking = tx.booking(&id).ok_or_else(|| EngineError::not_found("booking", id))?;
            if booking.business_id != uid && booking.client_id != uid {
                return Err(EngineError::Unauthorized("not a party to this booking"));
            }
            if booking.deleted {
                return Err(EngineError::not_found("booking", id));
            }
            match booking.state {
                BookingState::Cancelled => return Err(EngineError::Conflict("booking already cancelled".into())),
                BookingState::Completed => return Err(EngineError::Conflict("booking already completed".into())),
                BookingState::Pending | BookingState::Confirmed => {}
            }

            if uid != booking.business_id {
                let business = tx
                    .business(&booking.business_id)
                    .ok_or_else(|| EngineError::not_found("business", &booking.business_id))?;
                if booking.start - tx.now() < business.cancel_notice_ms() {
                    return Err(EngineError::PreconditionFailed(format!(
                        "bookings can only be cancelled {} hours in advance",
                        business.cancel_notice_hours
                    )));
                }
            }

            let at = tx.now();
            tx.write(Event::BookingStateChanged {
                id,
                business_id: booking.business_id.clone(),
                state: BookingState::Cancelled,
                at,
            });
            Ok(())
        })
        .await?;
        info!(booking = %id, by = uid, "booking cancelled");
        Ok(())
    }

    /// Only the business marks a booking as done.
    pub async fn complete_booking(&self, caller: &Caller, id: Ulid) -> Result<(), EngineError> {
        let uid = caller.require()?;
        self.run_transaction("complete_booking", |tx| {
            let booking = tx.booking(&id).ok_or_else(|| EngineError::not_found("booking", id))?;
            if booking.business_id != uid {
                return Err(EngineError::Unauthorized("only the business can complete a booking"));
            }
            if booking.deleted {
                return Err(EngineError::not_found("booking", id));
            }
            match booking.state {
                BookingState::Completed => return Err(EngineError::Conflict("booking already completed".into())),
                BookingState::Cancelled => return Err(EngineError::Conflict("booking was cancelled".into())),
                BookingState::Pending | BookingState::Confirmed => {}
            }
            let at = tx.now();
            tx.write(Event::BookingStateChanged {
                id,
                business_id: booking.business_id.clone(),
                state: BookingState::Completed,
                at,
            });
            Ok(())
        })
        .await?;
        info!(booking = %id, "booking completed");
        Ok(())
    }

    /// Move a booking to `state`. Only the terminal states are reachable.
    pub async fn transition_booking(&self, caller: &Caller, id: Ulid, state: BookingState) -> Result<(), EngineError> {
        match state {
            BookingState::Cancelled => self.cancel_booking(caller, id).await,
            BookingState::Completed => self.complete_booking(caller, id).await,
            other => Err(EngineError::InvalidInput(format!(
                "cannot move a booking to {}",
                other.as_str()
            ))),
        }
    }

    // ── Accounts ─────────────────────────────────────────────

    /// Register the caller. A professional also gets a business under the same
    /// id, closed every day until configured.
    pub async fn register_user(&self, caller: &Caller, new: NewUser) -> Result<User, EngineError> {
        let uid = caller.require()?.to_string();
        validate_new_user(&new)?;

        let user = self
            .run_transaction("register_user", |tx| {
                if tx.user(&uid).is_some() {
                    return Err(EngineError::Conflict(format!("user {uid} already registered")));
                }
                let seq = tx.next_user_seq();
                let now = tx.now();
                let user = User {
                    id: uid.clone(),
                    seq,
                    profile: new.profile.clone(),
                    role: new.role,
                    push_tokens: Vec::new(),
                    deleted: false,
                    created_at: now,
                    updated_at: now,
                };
                let business = match (new.role, &new.business) {
                    (Role::Professional, Some(b)) => {
                        if tx.business(&uid).is_some() {
                            return Err(EngineError::Conflict(format!("business {uid} already exists")));
                        }
                        Some(Business::new_default(uid.clone(), seq, b.name.clone(), b.location.clone(), now))
                    }
                    _ => None,
                };
                tx.write(Event::UserRegistered {
                    user: user.clone(),
                    business,
                });
                Ok(user)
            })
            .await?;
        info!(user = %user.id, seq = user.seq, role = user.role.as_str(), "user registered");
        Ok(user)
    }

    pub async fn add_push_token(&self, caller: &Caller, token: &str) -> Result<(), EngineError> {
        let uid = caller.require()?;
        let token = token.trim();
        if token.is_empty() {
            return Err(EngineError::InvalidInput("push token must not be empty".into()));
        }
        if token.len() > MAX_TOKEN_LEN {
            return Err(EngineError::LimitExceeded("push token too long"));
        }
        self.run_transaction("add_push_token", |tx| {
            let user = tx
                .user(uid)
                .filter(|u| !u.deleted)
                .ok_or_else(|| EngineError::not_found("user", uid))?;
            if user.push_tokens.iter().any(|t| t == token) {
                return Ok(());
            }
            if user.push_tokens.len() >= MAX_PUSH_TOKENS {
                return Err(EngineError::LimitExceeded("too many push tokens"));
            }
            let at = tx.now();
            tx.write(Event::PushTokenAdded {
                user_id: uid.to_string(),
                token: token.to_string(),
                at,
            });
            Ok(())
        })
        .await
    }

    /// Tombstone the caller's own account, and its business if it has one.
    pub async fn delete_account(&self, caller: &Caller, user_id: &str) -> Result<(), EngineError> {
        let uid = caller.require()?;
        if uid != user_id {
            return Err(EngineError::Unauthorized("accounts can only be deleted by their owner"));
        }
        self.run_transaction("delete_account", |tx| {
            tx.user(uid)
                .filter(|u| !u.deleted)
                .ok_or_else(|| EngineError::not_found("user", uid))?;
            let at = tx.now();
            tx.write(Event::AccountDeleted {
                user_id: uid.to_string(),
                at,
            });
            Ok(())
        })
        .await?;
        info!(user = uid, "account deleted");
        Ok(())
    }

    /// Replace the owner's business configuration.
    pub async fn update_business(&self, caller: &Caller, config: BusinessConfig) -> Result<Business, EngineError> {
        let uid = caller.require()?;
        if uid != config.id {
            return Err(EngineError::Unauthorized("only the owner can configure a business"));
        }
        validate_business_config(&config)?;

        let mut blocked_dates = config.blocked_dates.clone();
        blocked_dates.sort_unstable();
        blocked_dates.dedup();

        let business = self
            .run_transaction("update_business", |tx| {
                let current = tx
                    .business(&config.id)
                    .filter(|b| !b.deleted)
                    .ok_or_else(|| EngineError::not_found("business", &config.id))?;
                let business = Business {
                    id: current.id.clone(),
                    seq: current.seq,
                    name: config.name.trim().to_string(),
                    location: config.location.trim().to_string(),
                    description: config.description.clone().unwrap_or(current.description),
                    terms: config.terms.clone().unwrap_or(current.terms),
                    schedule: config.schedule,
                    services: config.services.clone(),
                    blocked_dates: blocked_dates.clone(),
                    slot_interval: Some(config.slot_interval),
                    cancel_notice_hours: config.cancel_notice_hours,
                    deleted: false,
                    created_at: current.created_at,
                    updated_at: tx.now(),
                };
                tx.write(Event::BusinessUpdated {
                    business: business.clone(),
                });
                Ok(business)
            })
            .await?;
        info!(business = %business.id, services = business.services.len(), "business updated");
        Ok(business)
    }
}

fn validate_new_user(new: &NewUser) -> Result<(), EngineError> {
    let p = &new.profile;
    if p.name.trim().is_empty() || p.surname.trim().is_empty() || p.email.trim().is_empty() {
        return Err(EngineError::InvalidInput("name, surname and email are required".into()));
    }
    if [&p.name, &p.surname, &p.email, &p.phone]
        .iter()
        .any(|f| f.len() > MAX_NAME_LEN)
    {
        return Err(EngineError::LimitExceeded("profile field too long"));
    }
    if new.role == Role::Professional {
        match &new.business {
            Some(b) if !b.name.trim().is_empty() && !b.location.trim().is_empty() => {
                if b.name.len() > MAX_NAME_LEN || b.location.len() > MAX_NAME_LEN {
                    return Err(EngineError::LimitExceeded("business name or location too long"));
                }
            }
            _ => {
                return Err(EngineError::InvalidInput(
                    "professionals must provide a business name and location".into(),
                ));
            }
        }
    }
    Ok(())
}
