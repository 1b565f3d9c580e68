// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The event engine: enrollment contexts, time delays, and notification
//! fan-out through notification classes (Clause 13).

pub mod algorithms;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::debug;

use crate::addr::Address;
use crate::object::Change;
use crate::service::codecs::{EventNotification, TimeStamp};
use crate::types::{property, ObjectId, PropertyId};
use crate::wire::primitives::Time;
use crate::wire::value::Value;

pub use self::algorithms::{EventAlgorithm, EventState, RangeParams, Verdict};

const LOG: &str = "bacnet::event";

/// One destination in a notification class.
#[derive(Debug, Clone, PartialEq)]
pub struct Recipient {
    pub address: Address,
    pub process_id: u32,
    pub issue_confirmed: bool,
    /// Monday-first validity mask.
    pub valid_days: [bool; 7],
    pub from_time: Time,
    pub to_time: Time,
    /// Which transitions this recipient wants: to-offnormal, to-fault,
    /// to-normal.
    pub transitions: [bool; 3],
}

impl Recipient {
    pub fn always(address: Address, process_id: u32, issue_confirmed: bool) -> Recipient {
        Recipient {
            address,
            process_id,
            issue_confirmed,
            valid_days: [true; 7],
            from_time: Time::new(0, 0, 0, 0).unwrap(),
            to_time: Time::new(23, 59, 59, 99).unwrap(),
            transitions: [true; 3],
        }
    }

    fn accepts(&self, clock: &WallClock, transition_index: usize) -> bool {
        if !self.transitions[transition_index] {
            return false;
        }
        if !self.valid_days[(clock.weekday as usize).saturating_sub(1) % 7] {
            return false;
        }
        let t = (clock.time.hour, clock.time.minute, clock.time.second);
        let from = (self.from_time.hour, self.from_time.minute, self.from_time.second);
        let to = (self.to_time.hour, self.to_time.minute, self.to_time.second);
        from <= t && t <= to
    }
}

/// A NotificationClass object's content, as the engine needs it.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationClass {
    /// Per-transition priorities: to-offnormal, to-fault, to-normal.
    pub priorities: [u8; 3],
    pub ack_required: [bool; 3],
    pub recipients: Vec<Recipient>,
}

/// Local wall-clock facts for recipient filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WallClock {
    /// 1 = Monday … 7 = Sunday.
    pub weekday: u8,
    pub time: Time,
}

impl WallClock {
    /// Derived from the system clock (UTC).
    pub fn now() -> WallClock {
        let secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let days = secs / 86_400;
        // The epoch fell on a Thursday (weekday 4).
        let weekday = ((days + 3) % 7) as u8 + 1;
        let in_day = secs % 86_400;
        WallClock {
            weekday,
            time: Time {
                hour: (in_day / 3600) as u8,
                minute: (in_day % 3600 / 60) as u8,
                second: (in_day % 60) as u8,
                hundredths: 0,
            },
        }
    }
}

/// One enrollment: an algorithm bound to a monitored property.
#[derive(Debug, Clone)]
pub struct Enrollment {
    /// Object the notification names as the event source.
    pub event_object: ObjectId,
    pub monitored: ObjectId,
    pub property: PropertyId,
    pub algorithm: EventAlgorithm,
    pub notification_class: u32,
    /// 0 alarm, 1 event.
    pub notify_type: u32,
    /// to-offnormal, to-fault, to-normal.
    pub event_enable: [bool; 3],
    pub time_delay: Duration,
}

#[derive(Debug)]
struct EnrollmentState {
    enrollment: Enrollment,
    state: EventState,
    time_entered: Instant,
    pending: Option<(EventState, Instant)>,
    last_values: Option<Vec<Value>>,
}

/// A notification ready for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDispatch {
    pub recipient: Address,
    pub confirmed: bool,
    pub notification: EventNotification,
}

/// The engine.
pub struct EventEngine {
    device: ObjectId,
    enrollments: HashMap<ObjectId, EnrollmentState>,
    classes: HashMap<u32, NotificationClass>,
    sequence: u32,
}

impl EventEngine {
    pub fn new(device: ObjectId) -> EventEngine {
        EventEngine {
            device,
            enrollments: HashMap::new(),
            classes: HashMap::new(),
            sequence: 0,
        }
    }

    pub fn define_class(&mut self, number: u32, class: NotificationClass) {
        self.classes.insert(number, class);
    }

    pub fn add_enrollment(&mut self, enrollment: Enrollment, now: Instant) {
        self.enrollments.insert(
            enrollment.event_object,
            EnrollmentState {
                enrollment,
                state: EventState::Normal,
                time_entered: now,
                pending: None,
                last_values: None,
            },
        );
    }

    pub fn remove_enrollment(&mut self, event_object: &ObjectId) -> bool {
        self.enrollments.remove(event_object).is_some()
    }

    pub fn enrollment_count(&self) -> usize {
        self.enrollments.len()
    }

    pub fn event_state(&self, event_object: &ObjectId) -> Option<EventState> {
        self.enrollments.get(event_object).map(|e| e.state)
    }

    /// Creates an implicit enrollment from an object's own properties when
    /// they ask for intrinsic reporting.
    pub fn intrinsic_enrollment(
        object: ObjectId,
        properties: &HashMap<PropertyId, Vec<Value>>,
    ) -> Option<Enrollment> {
        let class = match properties.get(&property::NOTIFICATION_CLASS)?.first()? {
            Value::Unsigned(v) => *v as u32,
            _ => return None,
        };
        let enable = match properties.get(&property::EVENT_ENABLE).and_then(|v| v.first()) {
            Some(Value::BitString(bits)) => [
                bits.bit(0).unwrap_or(true),
                bits.bit(1).unwrap_or(true),
                bits.bit(2).unwrap_or(true),
            ],
            _ => [true; 3],
        };
        let notify_type = match properties.get(&property::NOTIFY_TYPE).and_then(|v| v.first()) {
            Some(Value::Enumerated(v)) => *v,
            _ => 0,
        };
        let limit = |id: PropertyId| -> Option<f64> {
            properties.get(&id)?.first()?.as_f64()
        };
        let algorithm = match (limit(property::HIGH_LIMIT), limit(property::LOW_LIMIT)) {
            (Some(high_limit), Some(low_limit)) => {
                EventAlgorithm::OutOfRange(RangeParams {
                    high_limit,
                    low_limit,
                    deadband: limit(property::DEADBAND).unwrap_or(0.0),
                })
            }
            _ => return None,
        };
        let time_delay = limit(property::TIME_DELAY)
            .map(|s| Duration::from_secs(s as u64))
            .unwrap_or(Duration::ZERO);
        Some(Enrollment {
            event_object: object,
            monitored: object,
            property: property::PRESENT_VALUE,
            algorithm,
            notification_class: class,
            notify_type,
            event_enable: enable,
            time_delay,
        })
    }

    /// Applies a property change; COV dispatch happens before this is
    /// called for the same write.
    pub fn on_change(
        &mut self,
        change: &Change,
        now: Instant,
        clock: &WallClock,
    ) -> Vec<EventDispatch> {
        let keys: Vec<ObjectId> = self
            .enrollments
            .iter()
            .filter(|(_, e)| {
                e.enrollment.monitored == change.object
                    && e.enrollment.property == change.property
            })
            .map(|(k, _)| *k)
            .collect();
        let mut out = Vec::new();
        for key in keys {
            let verdict = {
                let entry = self.enrollments.get_mut(&key).unwrap();
                let verdict = entry.enrollment.algorithm.evaluate(
                    &change.values,
                    entry.last_values.as_deref(),
                    entry.state,
                );
                entry.last_values = Some(change.values.clone());
                verdict
            };
            match verdict {
                Verdict::Hold => {
                    // An observation disagreeing with a pending transition
                    // cancels the countdown.
                    let entry = self.enrollments.get_mut(&key).unwrap();
                    if entry.pending.take().is_some() {
                        debug!(target: LOG, "{} pending transition cancelled", key);
                    }
                }
                Verdict::Notify => {
                    out.extend(self.notify(key, None, now, clock));
                }
                Verdict::Transition(target) => {
                    let delay = {
                        let entry = self.enrollments.get_mut(&key).unwrap();
                        // Returning to normal is immediate; alarms honor
                        // the time delay.
                        if target == EventState::Normal {
                            Duration::ZERO
                        } else {
                            entry.enrollment.time_delay
                        }
                    };
                    if delay.is_zero() {
                        out.extend(self.notify(key, Some(target), now, clock));
                    } else {
                        let entry = self.enrollments.get_mut(&key).unwrap();
                        entry.pending = Some((target, now + delay));
                    }
                }
            }
        }
        out
    }

    /// Commits pending (time-delayed) transitions that have come due.
    pub fn on_tick(&mut self, now: Instant, clock: &WallClock) -> Vec<EventDispatch> {
        let due: Vec<(ObjectId, EventState)> = self
            .enrollments
            .iter()
            .filter_map(|(k, e)| {
                e.pending
                    .filter(|(_, at)| *at <= now)
                    .map(|(target, _)| (*k, target))
            })
            .collect();
        let mut out = Vec::new();
        for (key, target) in due {
            self.enrollments.get_mut(&key).unwrap().pending = None;
            out.extend(self.notify(key, Some(target), now, clock));
        }
        out
    }

    /// Objects currently away from normal, for GetAlarmSummary.
    pub fn alarm_summaries(&self) -> Vec<(ObjectId, EventState)> {
        let mut out: Vec<(ObjectId, EventState)> = self
            .enrollments
            .values()
            .filter(|e| e.state != EventState::Normal)
            .map(|e| (e.enrollment.event_object, e.state))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Every enrollment's identity and state, for GetEnrollmentSummary and
    /// GetEventInformation.
    pub fn enrollment_summaries(&self) -> Vec<(ObjectId, &Enrollment, EventState)> {
        let mut out: Vec<(ObjectId, &Enrollment, EventState)> = self
            .enrollments
            .values()
            .map(|e| (e.enrollment.event_object, &e.enrollment, e.state))
            .collect();
        out.sort_by_key(|(id, _, _)| *id);
        out
    }

    /// Per-transition priorities of a class, for summaries.
    pub fn class_priorities(&self, class: u32) -> [u8; 3] {
        self.classes.get(&class).map(|c| c.priorities).unwrap_or([0; 3])
    }

    fn notify(
        &mut self,
        key: ObjectId,
        transition: Option<EventState>,
        now: Instant,
        clock: &WallClock,
    ) -> Vec<EventDispatch> {
        let entry = self.enrollments.get_mut(&key).unwrap();
        let from_state = entry.state;
        let to_state = transition.unwrap_or(entry.state);
        if let Some(target) = transition {
            entry.state = target;
            entry.time_entered = now;
        }
        let index = to_state.transition_index();
        if !entry.enrollment.event_enable[index] {
            return Vec::new();
        }
        let Some(class) = self.classes.get(&entry.enrollment.notification_class) else {
            debug!(target: LOG, "notification class {} undefined",
                entry.enrollment.notification_class);
            return Vec::new();
        };
        self.sequence = self.sequence.wrapping_add(1);
        let sequence = self.sequence;

        let enrollment = &entry.enrollment;
        class
            .recipients
            .iter()
            .filter(|r| r.accepts(clock, index))
            .map(|r| EventDispatch {
                recipient: r.address,
                confirmed: r.issue_confirmed,
                notification: EventNotification {
                    process_id: r.process_id,
                    initiating_device: self.device,
                    event_object: enrollment.event_object,
                    timestamp: TimeStamp::Sequence(sequence),
                    notification_class: enrollment.notification_class,
                    priority: class.priorities[index],
                    event_type: enrollment.algorithm.event_type(),
                    message_text: None,
                    notify_type: enrollment.notify_type,
                    ack_required: Some(class.ack_required[index]),
                    from_state: Some(from_state.code()),
                    to_state: to_state.code(),
                    event_values: None,
                },
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::MacAddr;
    use crate::types::object_type;

    fn ai(instance: u32) -> ObjectId {
        ObjectId::new(object_type::ANALOG_INPUT, instance).unwrap()
    }

    fn recipient(n: u8) -> Address {
        Address::local(MacAddr::new(&[n]).unwrap())
    }

    fn daytime() -> WallClock {
        WallClock { weekday: 3, time: Time::new(14, 0, 0, 0).unwrap() }
    }

    fn engine_with_class() -> EventEngine {
        let mut engine = EventEngine::new(ObjectId::device(50).unwrap());
        engine.define_class(4, NotificationClass {
            priorities: [100, 50, 200],
            ack_required: [true, false, false],
            recipients: vec![Recipient::always(recipient(1), 7, false)],
        });
        engine
    }

    fn out_of_range_enrollment(time_delay: Duration) -> Enrollment {
        Enrollment {
            event_object: ai(9),
            monitored: ai(9),
            property: property::PRESENT_VALUE,
            algorithm: EventAlgorithm::OutOfRange(RangeParams {
                high_limit: 80.0,
                low_limit: 10.0,
                deadband: 2.0,
            }),
            notification_class: 4,
            notify_type: 0,
            event_enable: [true; 3],
            time_delay,
        }
    }

    fn change(value: f32) -> Change {
        Change {
            object: ai(9),
            property: property::PRESENT_VALUE,
            values: vec![Value::Real(value)],
        }
    }

    #[test]
    fn immediate_alarm_and_return_to_normal() {
        let mut engine = engine_with_class();
        let now = Instant::now();
        engine.add_enrollment(out_of_range_enrollment(Duration::ZERO), now);

        assert!(engine.on_change(&change(50.0), now, &daytime()).is_empty());
        let out = engine.on_change(&change(85.0), now, &daytime());
        assert_eq!(out.len(), 1);
        let n = &out[0].notification;
        assert_eq!(n.to_state, EventState::HighLimit.code());
        assert_eq!(n.from_state, Some(EventState::Normal.code()));
        assert_eq!(n.priority, 100);
        assert_eq!(n.ack_required, Some(true));
        assert_eq!(n.event_type, 5);
        assert_eq!(engine.event_state(&ai(9)), Some(EventState::HighLimit));

        let out = engine.on_change(&change(70.0), now, &daytime());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].notification.to_state, EventState::Normal.code());
        assert_eq!(out[0].notification.priority, 200);
    }

    #[test]
    fn time_delay_holds_then_fires() {
        let mut engine = engine_with_class();
        let now = Instant::now();
        engine.add_enrollment(out_of_range_enrollment(Duration::from_secs(5)), now);

        assert!(engine.on_change(&change(85.0), now, &daytime()).is_empty());
        // Before the delay elapses, nothing.
        assert!(engine.on_tick(now + Duration::from_secs(3), &daytime()).is_empty());
        // After it, the alarm commits.
        let out = engine.on_tick(now + Duration::from_secs(6), &daytime());
        assert_eq!(out.len(), 1);
        assert_eq!(engine.event_state(&ai(9)), Some(EventState::HighLimit));
    }

    #[test]
    fn recovery_during_delay_cancels_alarm() {
        let mut engine = engine_with_class();
        let now = Instant::now();
        engine.add_enrollment(out_of_range_enrollment(Duration::from_secs(5)), now);

        assert!(engine.on_change(&change(85.0), now, &daytime()).is_empty());
        // Back in range before the delay: countdown cancelled.
        assert!(engine.on_change(&change(50.0), now + Duration::from_secs(2), &daytime())
            .is_empty());
        assert!(engine.on_tick(now + Duration::from_secs(10), &daytime()).is_empty());
        assert_eq!(engine.event_state(&ai(9)), Some(EventState::Normal));
    }

    #[test]
    fn event_enable_suppresses_transitions() {
        let mut engine = engine_with_class();
        let now = Instant::now();
        let mut enrollment = out_of_range_enrollment(Duration::ZERO);
        enrollment.event_enable = [false, true, true];
        engine.add_enrollment(enrollment, now);
        // The alarm transition happens but is not reported.
        assert!(engine.on_change(&change(85.0), now, &daytime()).is_empty());
        assert_eq!(engine.event_state(&ai(9)), Some(EventState::HighLimit));
        // The return to normal is reported.
        let out = engine.on_change(&change(50.0), now, &daytime());
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn recipient_day_and_time_windows() {
        let mut engine = EventEngine::new(ObjectId::device(50).unwrap());
        let mut nights_only = Recipient::always(recipient(1), 1, true);
        nights_only.from_time = Time::new(22, 0, 0, 0).unwrap();
        nights_only.to_time = Time::new(23, 59, 59, 0).unwrap();
        let mut weekdays = Recipient::always(recipient(2), 2, false);
        weekdays.valid_days = [true, true, true, true, true, false, false];
        engine.define_class(4, NotificationClass {
            priorities: [100, 50, 200],
            ack_required: [false; 3],
            recipients: vec![nights_only, weekdays],
        });
        let now = Instant::now();
        engine.add_enrollment(out_of_range_enrollment(Duration::ZERO), now);

        // Wednesday afternoon: only the weekday recipient matches.
        let out = engine.on_change(&change(85.0), now, &daytime());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].recipient, recipient(2));
        assert!(!out[0].confirmed);

        // Sunday night: only the nights-only recipient matches.
        let sunday_night = WallClock { weekday: 7, time: Time::new(23, 0, 0, 0).unwrap() };
        let out = engine.on_change(&change(50.0), now, &sunday_night);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].recipient, recipient(1));
        assert!(out[0].confirmed);
    }

    #[test]
    fn intrinsic_enrollment_from_properties() {
        let mut properties = HashMap::new();
        properties.insert(property::NOTIFICATION_CLASS, vec![Value::Unsigned(4)]);
        properties.insert(property::HIGH_LIMIT, vec![Value::Real(90.0)]);
        properties.insert(property::LOW_LIMIT, vec![Value::Real(5.0)]);
        properties.insert(property::DEADBAND, vec![Value::Real(1.0)]);
        properties.insert(property::TIME_DELAY, vec![Value::Unsigned(10)]);
        let enrollment = EventEngine::intrinsic_enrollment(ai(3), &properties).unwrap();
        assert_eq!(enrollment.notification_class, 4);
        assert_eq!(enrollment.time_delay, Duration::from_secs(10));
        assert_eq!(
            enrollment.algorithm,
            EventAlgorithm::OutOfRange(RangeParams {
                high_limit: 90.0,
                low_limit: 5.0,
                deadband: 1.0,
            })
        );

        // No limits, no enrollment.
        let mut bare = HashMap::new();
        bare.insert(property::NOTIFICATION_CLASS, vec![Value::Unsigned(4)]);
        assert!(EventEngine::intrinsic_enrollment(ai(3), &bare).is_none());
    }

    #[test]
    fn undefined_class_drops_notifications() {
        let mut engine = EventEngine::new(ObjectId::device(50).unwrap());
        let now = Instant::now();
        engine.add_enrollment(out_of_range_enrollment(Duration::ZERO), now);
        assert!(engine.on_change(&change(85.0), now, &daytime()).is_empty());
        // The state still advanced.
        assert_eq!(engine.event_state(&ai(9)), Some(EventState::HighLimit));
    }

    #[test]
    fn wall_clock_weekday_sane() {
        let clock = WallClock::now();
        assert!((1..=7).contains(&clock.weekday));
        assert!(clock.time.hour < 24);
    }
}
