//! Pure derivation of absolute reminder times.
//!
//! Nothing here reads the clock; callers pass `now` explicitly.

use crate::errors::{AppError, AppResult};
use crate::models::{
    AlarmConfig, Channel, RepeatInterval, ReminderRule, ReminderSettings, RuleKey, RuleState, Task, Trigger,
};
use chrono::{DateTime, Datelike, Duration, Months, Utc};
use std::collections::BTreeMap;

const MAX_GRACE_SECS: u64 = 24 * 60 * 60;

pub fn fire_at(deadline: Option<DateTime<Utc>>, offset_minutes: i64) -> AppResult<DateTime<Utc>> {
    if offset_minutes < 0 {
        return Err(AppError::InvalidSchedule(format!(
            "reminder offset must be non-negative, got {} minutes",
            offset_minutes
        )));
    }
    let Some(deadline) = deadline else {
        return Err(AppError::InvalidSchedule(
            "reminder offsets require a deadline".to_string(),
        ));
    };
    let offset = Duration::try_minutes(offset_minutes).ok_or_else(|| {
        AppError::InvalidSchedule(format!("reminder offset of {} minutes is out of range", offset_minutes))
    })?;
    deadline.checked_sub_signed(offset).ok_or_else(|| {
        AppError::InvalidSchedule(format!("reminder offset of {} minutes is out of range", offset_minutes))
    })
}

pub fn alarm_fire_at(time: DateTime<Utc>) -> DateTime<Utc> {
    time
}

/// Time of the `n`-th occurrence of an alarm. Non-repeating alarms only have occurrence 0.
pub fn occurrence_at(time: DateTime<Utc>, repeat: RepeatInterval, n: u32) -> Option<DateTime<Utc>> {
    match repeat {
        RepeatInterval::None => (n == 0).then_some(time),
        RepeatInterval::Daily => time.checked_add_signed(Duration::try_days(i64::from(n))?),
        RepeatInterval::Weekly => time.checked_add_signed(Duration::try_weeks(i64::from(n))?),
        RepeatInterval::Monthly => time.checked_add_months(Months::new(n)),
    }
}

/// First occurrence strictly after `not_before`. A non-repeating alarm always yields occurrence 0,
/// even when it is already in the past.
pub fn next_occurrence(
    time: DateTime<Utc>,
    repeat: RepeatInterval,
    not_before: DateTime<Utc>,
) -> AppResult<(u32, DateTime<Utc>)> {
    if repeat == RepeatInterval::None || time > not_before {
        return Ok((0, time));
    }

    let mut n: u32 = match repeat {
        RepeatInterval::None => 0,
        RepeatInterval::Daily | RepeatInterval::Weekly => {
            let step = if repeat == RepeatInterval::Daily { 86_400 } else { 7 * 86_400 };
            let behind = (not_before - time).num_seconds().max(0);
            u32::try_from(behind / step).unwrap_or(u32::MAX)
        }
        RepeatInterval::Monthly => {
            let months_between = (not_before.year() - time.year()) * 12 + not_before.month() as i32
                - time.month() as i32;
            u32::try_from(months_between - 1).unwrap_or(0)
        }
    };

    loop {
        let at = occurrence_at(time, repeat, n).ok_or_else(|| {
            AppError::InvalidSchedule(format!("{} alarm has no occurrence after {}", repeat.as_str(), not_before))
        })?;
        if at > not_before {
            return Ok((n, at));
        }
        n = n.checked_add(1).ok_or_else(|| {
            AppError::InvalidSchedule(format!("{} alarm occurrence overflow", repeat.as_str()))
        })?;
    }
}

pub fn grace_window(settings: &ReminderSettings) -> Duration {
    Duration::seconds(settings.missed_grace_secs.min(MAX_GRACE_SECS) as i64)
}

/// Checks an alarm configuration without deriving anything. Used before a task write is accepted.
pub fn validate_alarm(deadline: Option<DateTime<Utc>>, alarm: Option<&AlarmConfig>) -> AppResult<()> {
    let Some(alarm) = alarm.filter(|alarm| alarm.enabled) else {
        return Ok(());
    };
    for offset in &alarm.reminder_offsets {
        fire_at(deadline, offset.minutes_before)?;
    }
    Ok(())
}

/// Full rule set of one task at its current version, sorted by fire time.
pub fn derive_rules(task: &Task, now: DateTime<Utc>, settings: &ReminderSettings) -> AppResult<Vec<ReminderRule>> {
    if task.completed {
        return Ok(Vec::new());
    }
    let Some(alarm) = task.alarm.as_ref().filter(|alarm| alarm.enabled) else {
        return Ok(Vec::new());
    };

    let key = |trigger: Trigger, channel: Channel| RuleKey {
        task_id: task.id.clone(),
        trigger,
        channel,
        version: task.version,
    };
    let mut rules: BTreeMap<RuleKey, DateTime<Utc>> = BTreeMap::new();

    let explicit = !alarm.reminder_offsets.is_empty();
    let offsets = if explicit {
        alarm.reminder_offsets.as_slice()
    } else {
        settings.default_offsets.as_slice()
    };
    if explicit || task.deadline.is_some() {
        for offset in offsets {
            let at = fire_at(task.deadline, offset.minutes_before)?;
            rules.insert(
                key(
                    Trigger::Offset {
                        minutes: offset.minutes_before,
                    },
                    offset.channel,
                ),
                at,
            );
        }
    }

    if let Some(time) = alarm.time {
        let not_before = now - grace_window(settings);
        let (occurrence, at) = next_occurrence(alarm_fire_at(time), alarm.repeat_interval, not_before)?;
        rules.insert(key(Trigger::Alarm { occurrence }, Channel::Browser), at);
        if alarm.voice_enabled {
            rules.insert(key(Trigger::Alarm { occurrence }, Channel::Voice), at);
        }
    }

    let mut derived = rules
        .into_iter()
        .map(|(key, fire_at)| ReminderRule {
            key,
            fire_at,
            state: RuleState::Pending,
        })
        .collect::<Vec<_>>();
    derived.sort_by(|left, right| left.fire_at.cmp(&right.fire_at).then_with(|| left.key.cmp(&right.key)));
    Ok(derived)
}
