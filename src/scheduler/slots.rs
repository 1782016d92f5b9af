//! Slot engine: rewrites loose instants onto the configured per-destination
//! availability grid.

use std::collections::HashSet;

use chrono::{DateTime, Datelike, Days, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use tracing::warn;

use super::SchedulerError;
use crate::config::SlotsConfig;
use crate::kv::Storer;

const MAX_SEARCH_DAYS: u64 = 365;

fn weekday_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

pub(super) fn slot_owner(kind: &str, recipient: &str) -> String {
    format!("{kind}:{recipient}")
}

/// Claims candidate slot times for the duration of one expansion pass.
pub(super) trait SlotReserver {
    /// True if this call claimed the slot, false if it was already taken.
    fn reserve(&mut self, slot: DateTime<Utc>, owner: &str) -> Result<bool, SchedulerError>;
}

/// Reservations persisted through the store; used by `refresh`, where the
/// grid has just been cleared and the claims must survive the cycle.
pub(super) struct StoreReserver<'a> {
    pub store: &'a dyn Storer,
}

impl SlotReserver for StoreReserver<'_> {
    fn reserve(&mut self, slot: DateTime<Utc>, owner: &str) -> Result<bool, SchedulerError> {
        Ok(self.store.reserve_slot(slot, owner)?)
    }
}

/// In-memory reservations over an empty grid; used by `expand`, which must
/// not write to the store.
#[derive(Default)]
pub(super) struct MemoryReserver {
    taken: HashSet<DateTime<Utc>>,
}

impl MemoryReserver {
    pub(super) fn new() -> Self {
        Self::default()
    }
}

impl SlotReserver for MemoryReserver {
    fn reserve(&mut self, slot: DateTime<Utc>, _owner: &str) -> Result<bool, SchedulerError> {
        Ok(self.taken.insert(slot))
    }
}

/// Find and claim the next free slot for a destination, starting on the
/// day of `scheduled_at`. Returns `scheduled_at` unchanged when no slot
/// table applies to the destination.
///
/// Candidates are walked in config order per weekday, skipping times before
/// `now` and times already claimed by another destination this pass.
pub(super) fn find_next_available_slot(
    reserver: &mut dyn SlotReserver,
    slots: &SlotsConfig,
    kind: &str,
    recipient: &str,
    scheduled_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, SchedulerError> {
    let days = match slots.resolve(kind, recipient) {
        Some(days) => days,
        None => return Ok(scheduled_at),
    };
    let timezone: Tz = slots
        .timezone
        .parse()
        .map_err(|_| SchedulerError::Timezone(slots.timezone.clone()))?;

    let start = scheduled_at.with_timezone(&timezone).date_naive();
    let owner = slot_owner(kind, recipient);
    for offset in 0..MAX_SEARCH_DAYS {
        let date = match start.checked_add_days(Days::new(offset)) {
            Some(date) => date,
            None => break,
        };
        let times = match days.get(weekday_name(date.weekday())) {
            Some(times) => times,
            None => continue,
        };
        for raw in times {
            let time = match NaiveTime::parse_from_str(raw, "%H:%M") {
                Ok(time) => time,
                Err(_) => {
                    warn!("invalid slot format '{}'", raw);
                    continue;
                }
            };
            let local = match timezone.from_local_datetime(&date.and_time(time)).earliest() {
                Some(local) => local,
                // Nonexistent local time (DST gap); the slot cannot fire.
                None => continue,
            };
            let slot = local.with_timezone(&Utc);
            if slot < now {
                continue;
            }
            if reserver.reserve(slot, &owner)? {
                return Ok(slot);
            }
        }
    }

    Err(SchedulerError::NoSlotAvailable {
        kind: kind.to_string(),
        recipient: recipient.to_string(),
    })
}
