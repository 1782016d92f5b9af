//! Expansion of trigger declarations into the concrete persisted schedule.
//!
//! [`Scheduler::expand`] walks every `(source, call, trigger, destination,
//! recipient)` tuple and emits zero or more [`ScheduledCall`] instances
//! whose `scheduled_at` falls inside the half-open calculation window
//! `[now - before, now + after)`. It is a pure computation over the store's
//! contents; [`Scheduler::refresh`] additionally resets the slot grid,
//! reserves the claimed slots, and rewrites the persisted schedule. Bad
//! trigger input is logged and skipped so one call cannot poison the rest
//! of the grid.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, TimeZone, Timelike, Utc};
use cron::Schedule as CronSchedule;
use rrule::{RRule, Unvalidated};
use tracing::{error, warn};

use crate::config::SlotsConfig;
use crate::kv::{ScheduledCall, StoreError, Storer};
use crate::model::{Call, Destination, Event, Source};

pub mod hijri;
mod slots;

#[cfg(test)]
mod tests;

const DEFAULT_CAMPAIGN_NAME: &str = "announcements";

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("unresolvable timezone '{0}'")]
    Timezone(String),
    #[error("no available slots for {kind}:{recipient}")]
    NoSlotAvailable { kind: String, recipient: String },
}

/// Expands call definitions into a flat list of concrete scheduled calls.
pub struct Scheduler {
    store: Arc<dyn Storer>,
    slots: SlotsConfig,
}

fn fmt_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn truncate_to_minute(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant
        .with_second(0)
        .and_then(|instant| instant.with_nanosecond(0))
        .unwrap_or(instant)
}

fn is_midnight_aligned(instant: DateTime<Utc>) -> bool {
    instant.hour() == 0 && instant.minute() == 0 && instant.second() == 0
}

fn to_rrule_utc(instant: DateTime<Utc>) -> DateTime<rrule::Tz> {
    rrule::Tz::UTC.from_utc_datetime(&instant.naive_utc())
}

/// Parse a `dstart` of the shape `TZID=<iana>:YYYYMMDD[THHMMSS]` or a bare
/// `YYYYMMDD[THHMMSS]` (UTC).
fn parse_dstart(spec: &str) -> Result<DateTime<rrule::Tz>, String> {
    let (timezone, body) = match spec.strip_prefix("TZID=") {
        Some(rest) => {
            let (tzid, body) = rest
                .split_once(':')
                .ok_or_else(|| format!("invalid dstart '{spec}'"))?;
            let timezone: chrono_tz::Tz = tzid
                .parse()
                .map_err(|_| format!("unresolvable timezone '{tzid}'"))?;
            (timezone, body)
        }
        None => (chrono_tz::Tz::UTC, spec),
    };

    let naive = NaiveDateTime::parse_from_str(body, "%Y%m%dT%H%M%S")
        .or_else(|_| {
            NaiveDate::parse_from_str(body, "%Y%m%d").map(|date| date.and_time(NaiveTime::MIN))
        })
        .map_err(|_| format!("invalid dstart time '{body}'"))?;

    rrule::Tz::Tz(timezone)
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| format!("dstart '{spec}' does not exist in its timezone"))
}

impl Scheduler {
    pub fn new(store: Arc<dyn Storer>, slots: SlotsConfig) -> Self {
        Self { store, slots }
    }

    /// Expand every source into concrete scheduled calls for the window
    /// `[now - before, now + after)`. Slot assignment runs over an empty
    /// in-memory grid; nothing is written to the store.
    pub fn expand(
        &self,
        sources: &[Source],
        now: DateTime<Utc>,
        before: Duration,
        after: Duration,
    ) -> Result<Vec<ScheduledCall>, SchedulerError> {
        let mut reserver = slots::MemoryReserver::new();
        self.expand_with(&mut reserver, sources, now, before, after)
    }

    fn expand_with(
        &self,
        reserver: &mut dyn slots::SlotReserver,
        sources: &[Source],
        now: DateTime<Utc>,
        before: Duration,
        after: Duration,
    ) -> Result<Vec<ScheduledCall>, SchedulerError> {
        let now = now.with_timezone(&Utc);
        let window_start = now - chrono::Duration::seconds(before.as_secs() as i64);
        let window_end = now + chrono::Duration::seconds(after.as_secs() as i64);

        let mut expanded = Vec::new();
        for source in sources {
            let mut events_by_sequence: HashMap<&str, Vec<&Event>> = HashMap::new();
            for event in &source.events {
                events_by_sequence
                    .entry(event.sequence.as_str())
                    .or_default()
                    .push(event);
            }

            for call in &source.calls {
                for trigger in &call.triggers {
                    if let Some(at) = trigger.scheduled_at {
                        self.expand_absolute(
                            reserver,
                            &mut expanded,
                            call,
                            at,
                            now,
                            window_start,
                            window_end,
                        );
                    }

                    if let Some(expr) = trigger.cron.as_deref() {
                        self.expand_cron(
                            reserver,
                            &mut expanded,
                            call,
                            expr,
                            now,
                            window_start,
                            window_end,
                        );
                    }

                    if let Some(rule) = trigger.rrule.as_deref() {
                        self.expand_rrule(
                            reserver,
                            &mut expanded,
                            call,
                            rule,
                            trigger.dstart.as_deref(),
                            now,
                            window_start,
                            window_end,
                        );
                    } else if let Some(dstart) = trigger.dstart.as_deref() {
                        error!("dstart specified without rrule: '{}'", dstart);
                    }

                    if let Some(spec) = trigger.hijri.as_deref() {
                        self.expand_hijri(
                            &mut expanded,
                            call,
                            spec,
                            trigger.time.as_deref(),
                            now,
                            window_start,
                            window_end,
                        );
                    }

                    if let (Some(sequence), Some(delta)) =
                        (trigger.sequence.as_deref(), trigger.delta.as_deref())
                    {
                        self.expand_sequence(
                            &mut expanded,
                            call,
                            sequence,
                            delta,
                            events_by_sequence.get(sequence).map(Vec::as_slice),
                            window_start,
                            window_end,
                        );
                    } else if trigger.sequence.is_some() || trigger.delta.is_some() {
                        warn!(
                            "sequence trigger on call '{}' needs both sequence and delta",
                            call.id
                        );
                    }
                }
            }
        }

        Ok(expanded)
    }

    /// Expand and persist. The slot grid is reset first so the cycle
    /// starts from a clean reservation state, and the claimed slots are
    /// written through; the scheduled-calls container is then cleared and
    /// rewritten so readers see either the old schedule or the new one.
    pub fn refresh(
        &self,
        sources: &[Source],
        now: DateTime<Utc>,
        before: Duration,
        after: Duration,
    ) -> Result<(), SchedulerError> {
        self.store.clear_all_slots()?;
        let mut reserver = slots::StoreReserver {
            store: self.store.as_ref(),
        };
        let expanded = self.expand_with(&mut reserver, sources, now, before, after)?;
        self.store.clear_scheduled_calls()?;
        for call in &expanded {
            self.store.add_scheduled_call(call)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn expand_absolute(
        &self,
        reserver: &mut dyn slots::SlotReserver,
        out: &mut Vec<ScheduledCall>,
        call: &Call,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) {
        let at = at.with_timezone(&Utc);
        for destination in &call.destinations {
            for to in &destination.to {
                let id = format!(
                    "{}:scheduled_at:{}:{}:{}",
                    call.id,
                    fmt_instant(at),
                    destination.kind,
                    to
                );
                let scheduled_at = if is_midnight_aligned(at) {
                    match self.assign_slot(reserver, &destination.kind, to, at, now) {
                        Some(slot) => slot,
                        None => continue,
                    }
                } else {
                    if at < window_start || at >= window_end {
                        continue;
                    }
                    at
                };
                emit(out, call, id, scheduled_at, destination.kind.clone(), to);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn expand_cron(
        &self,
        reserver: &mut dyn slots::SlotReserver,
        out: &mut Vec<ScheduledCall>,
        call: &Call,
        expr: &str,
        now: DateTime<Utc>,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) {
        // Standard 5-field cron; the parser wants a seconds field.
        if expr.split_whitespace().count() != 5 {
            error!("failed to parse cron '{}': expected 5 fields", expr);
            return;
        }
        let schedule = match CronSchedule::from_str(&format!("0 {expr}")) {
            Ok(schedule) => schedule,
            Err(err) => {
                error!("failed to parse cron '{}': {}", expr, err);
                return;
            }
        };

        let lookback = window_start - chrono::Duration::seconds(1);
        for occurrence in schedule.after(&lookback) {
            if occurrence >= window_end {
                break;
            }
            let occurrence = truncate_to_minute(occurrence);
            if occurrence < window_start {
                continue;
            }
            for destination in &call.destinations {
                for to in &destination.to {
                    let id = format!(
                        "{}:cron:{}:{}:{}:{}",
                        call.id,
                        expr,
                        fmt_instant(occurrence),
                        destination.kind,
                        to
                    );
                    let scheduled_at = if is_midnight_aligned(occurrence) {
                        match self.assign_slot(reserver, &destination.kind, to, occurrence, now) {
                            Some(slot) => slot,
                            None => continue,
                        }
                    } else {
                        occurrence
                    };
                    emit(out, call, id, scheduled_at, destination.kind.clone(), to);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn expand_rrule(
        &self,
        reserver: &mut dyn slots::SlotReserver,
        out: &mut Vec<ScheduledCall>,
        call: &Call,
        rule: &str,
        dstart: Option<&str>,
        now: DateTime<Utc>,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) {
        let unvalidated: RRule<Unvalidated> = match rule.parse() {
            Ok(parsed) => parsed,
            Err(err) => {
                error!("failed to parse rrule '{}': {}", rule, err);
                return;
            }
        };

        let dtstart = match dstart {
            Some(spec) => match parse_dstart(spec) {
                Ok(dtstart) => dtstart,
                Err(reason) => {
                    error!("failed to parse dstart '{}': {}", spec, reason);
                    return;
                }
            },
            None => {
                if ["BYHOUR", "BYMINUTE", "BYSECOND"]
                    .iter()
                    .any(|field| rule.contains(field))
                {
                    to_rrule_utc(now)
                } else {
                    // No time component anywhere: anchor at midnight UTC of
                    // the current day so daily-style rules emit midnight.
                    to_rrule_utc(
                        Utc.from_utc_datetime(&now.date_naive().and_time(NaiveTime::MIN)),
                    )
                }
            }
        };

        let set = match unvalidated.build(dtstart) {
            Ok(set) => set,
            Err(err) => {
                error!("failed to build rrule '{}': {}", rule, err);
                return;
            }
        };

        let result = set
            .after(to_rrule_utc(window_start))
            .before(to_rrule_utc(window_end))
            .all(1000);
        if result.limited {
            warn!("rrule '{}' expansion truncated at 1000 occurrences", rule);
        }

        for occurrence in result.dates {
            let occurrence = truncate_to_minute(occurrence.with_timezone(&Utc));
            if occurrence < window_start || occurrence >= window_end {
                continue;
            }
            for destination in &call.destinations {
                for to in &destination.to {
                    let id = format!(
                        "{}:rrule:{}:{}:{}:{}",
                        call.id,
                        rule,
                        fmt_instant(occurrence),
                        destination.kind,
                        to
                    );
                    let scheduled_at = if is_midnight_aligned(occurrence) {
                        match self.assign_slot(reserver, &destination.kind, to, occurrence, now) {
                            Some(slot) => slot,
                            None => continue,
                        }
                    } else {
                        occurrence
                    };
                    emit(out, call, id, scheduled_at, destination.kind.clone(), to);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn expand_hijri(
        &self,
        out: &mut Vec<ScheduledCall>,
        call: &Call,
        spec: &str,
        time: Option<&str>,
        now: DateTime<Utc>,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) {
        let (day, month) = match hijri::parse_date(spec) {
            Ok(parsed) => parsed,
            Err(err) => {
                error!("failed to parse hijri date '{}': {}", spec, err);
                return;
            }
        };
        let (clock, offset) = match hijri::parse_time(time) {
            Ok(parsed) => parsed,
            Err(err) => {
                error!("failed to parse hijri time: {}", err);
                return;
            }
        };
        let occurrence = match hijri::next_occurrence(day, month, clock, offset, now) {
            Some(occurrence) => occurrence,
            None => {
                error!("no forward occurrence for hijri date '{}'", spec);
                return;
            }
        };
        if occurrence < window_start || occurrence >= window_end {
            return;
        }

        for destination in &call.destinations {
            for to in &destination.to {
                let id = format!(
                    "{}:hijri:{}:{}:{}:{}",
                    call.id,
                    spec,
                    fmt_instant(occurrence),
                    destination.kind,
                    to
                );
                emit(out, call, id, occurrence, destination.kind.clone(), to);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn expand_sequence(
        &self,
        out: &mut Vec<ScheduledCall>,
        call: &Call,
        sequence: &str,
        delta: &str,
        events: Option<&[&Event]>,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) {
        // No matching event silently yields zero instances.
        let events = match events {
            Some(events) => events,
            None => return,
        };
        let delta = match humantime::parse_duration(delta) {
            Ok(delta) => delta,
            Err(err) => {
                error!("failed to parse delta '{}': {}", delta, err);
                return;
            }
        };

        for event in events {
            let occurrence = event.start_time + chrono::Duration::seconds(delta.as_secs() as i64);
            if occurrence < window_start || occurrence >= window_end {
                continue;
            }

            // The event's destinations join the call's; duplicate
            // (type, recipient) pairs collapse to one instance.
            let mut seen = Vec::new();
            for destination in call.destinations.iter().chain(&event.destinations) {
                for to in &destination.to {
                    let pair = (destination.kind.clone(), to.clone());
                    if seen.contains(&pair) {
                        continue;
                    }
                    seen.push(pair);

                    let id = format!(
                        "{}:sequence:{}:{}:{}:{}",
                        call.id,
                        sequence,
                        fmt_instant(event.start_time),
                        destination.kind,
                        to
                    );
                    emit(out, call, id, occurrence, destination.kind.clone(), to);
                }
            }
        }
    }

    /// Route one loose instant through the slot engine; errors are logged
    /// and drop the instance, per the expansion failure policy.
    fn assign_slot(
        &self,
        reserver: &mut dyn slots::SlotReserver,
        kind: &str,
        recipient: &str,
        scheduled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match slots::find_next_available_slot(
            reserver,
            &self.slots,
            kind,
            recipient,
            scheduled_at,
            now,
        ) {
            Ok(slot) => Some(slot),
            Err(err) => {
                error!(
                    "failed to find next available slot for {}:{}: {}",
                    kind, recipient, err
                );
                None
            }
        }
    }
}

fn emit(
    out: &mut Vec<ScheduledCall>,
    call: &Call,
    id: String,
    scheduled_at: DateTime<Utc>,
    kind: String,
    to: &str,
) {
    let mut body = call.clone();
    body.triggers = Vec::new();
    body.destinations = vec![Destination {
        kind,
        to: vec![to.to_string()],
    }];
    if body.campaign.name.is_empty() {
        body.campaign.name = DEFAULT_CAMPAIGN_NAME.to_string();
    }
    out.push(ScheduledCall {
        id,
        short_id: String::new(),
        call: body,
        scheduled_at,
    });
}
