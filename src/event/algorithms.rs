// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The standard event algorithms (Clause 13.3).
//!
//! Each algorithm reduces to one question: given the monitored values,
//! which event state does the object belong in now? The engine in the
//! parent module owns time delays, state memory, and notification fan-out;
//! the algorithms here are pure.

use crate::wire::primitives::BitString;
use crate::wire::value::Value;

/// Event states (Clause 13.1.2). The limit states are refinements of
/// off-normal used by the range algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    Normal,
    Fault,
    Offnormal,
    HighLimit,
    LowLimit,
}

impl EventState {
    /// The Clause 18 enumeration value carried in notifications.
    pub fn code(self) -> u32 {
        match self {
            EventState::Normal => 0,
            EventState::Fault => 1,
            EventState::Offnormal => 2,
            EventState::HighLimit => 3,
            EventState::LowLimit => 4,
        }
    }

    /// Index into per-transition parameters: to-offnormal, to-fault,
    /// to-normal.
    pub fn transition_index(self) -> usize {
        match self {
            EventState::Offnormal | EventState::HighLimit | EventState::LowLimit => 0,
            EventState::Fault => 1,
            EventState::Normal => 2,
        }
    }
}

/// What an evaluation concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Stay put.
    Hold,
    /// Move (after the time delay) to this state.
    Transition(EventState),
    /// Notify without a state change (the change-reporting algorithms:
    /// change-of-value, buffer-ready, access-event, timer).
    Notify,
}

/// Parameters for the high/low range family.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeParams {
    pub high_limit: f64,
    pub low_limit: f64,
    pub deadband: f64,
}

impl RangeParams {
    fn classify(&self, value: f64, current: EventState) -> EventState {
        match current {
            EventState::HighLimit => {
                // Leave only once the deadband is cleared.
                if value >= self.low_limit && value <= self.high_limit - self.deadband {
                    EventState::Normal
                } else if value < self.low_limit {
                    EventState::LowLimit
                } else {
                    EventState::HighLimit
                }
            }
            EventState::LowLimit => {
                if value <= self.high_limit && value >= self.low_limit + self.deadband {
                    EventState::Normal
                } else if value > self.high_limit {
                    EventState::HighLimit
                } else {
                    EventState::LowLimit
                }
            }
            _ => {
                if value > self.high_limit {
                    EventState::HighLimit
                } else if value < self.low_limit {
                    EventState::LowLimit
                } else {
                    EventState::Normal
                }
            }
        }
    }
}

/// The eighteen standard algorithms.
#[derive(Debug, Clone, PartialEq)]
pub enum EventAlgorithm {
    /// No intrinsic reporting.
    None,
    ChangeOfBitstring { bitmask: BitString, alarm_values: Vec<BitString> },
    ChangeOfState { alarm_values: Vec<Value> },
    /// Reports movement; never leaves normal.
    ChangeOfValue { increment: f64 },
    ChangeOfCommand { expected: Value },
    ChangeOfReliability,
    ChangeOfStatusFlags { selected: BitString },
    ChangeOfDiscreteValue,
    ChangeOfLifeSafety { alarm_values: Vec<u32> },
    ChangeOfTimer { alarm_states: Vec<u32> },
    OutOfRange(RangeParams),
    FloatingLimit { setpoint: f64, high_diff: f64, low_diff: f64, deadband: f64 },
    DoubleOutOfRange(RangeParams),
    SignedOutOfRange(RangeParams),
    UnsignedOutOfRange(RangeParams),
    ChangeOfCharacterstring { alarm_values: Vec<String> },
    BufferReady { threshold: u64 },
    AccessEvent,
}

impl EventAlgorithm {
    /// The Clause 18 event-type enumeration for notifications.
    pub fn event_type(&self) -> u32 {
        match self {
            EventAlgorithm::None => 0,
            EventAlgorithm::ChangeOfBitstring { .. } => 0,
            EventAlgorithm::ChangeOfState { .. } => 1,
            EventAlgorithm::ChangeOfValue { .. } => 2,
            EventAlgorithm::ChangeOfCommand { .. } => 3,
            EventAlgorithm::FloatingLimit { .. } => 4,
            EventAlgorithm::OutOfRange(_) => 5,
            EventAlgorithm::ChangeOfLifeSafety { .. } => 8,
            EventAlgorithm::BufferReady { .. } => 10,
            EventAlgorithm::AccessEvent => 13,
            EventAlgorithm::DoubleOutOfRange(_) => 14,
            EventAlgorithm::SignedOutOfRange(_) => 15,
            EventAlgorithm::UnsignedOutOfRange(_) => 16,
            EventAlgorithm::ChangeOfCharacterstring { .. } => 17,
            EventAlgorithm::ChangeOfStatusFlags { .. } => 18,
            EventAlgorithm::ChangeOfReliability => 19,
            EventAlgorithm::ChangeOfDiscreteValue => 20,
            EventAlgorithm::ChangeOfTimer { .. } => 21,
        }
    }

    /// Evaluates one observation. `last` is the previous observation (for
    /// the pure change-reporting algorithms), `current` the present event
    /// state (for hysteresis).
    pub fn evaluate(
        &self,
        new: &[Value],
        last: Option<&[Value]>,
        current: EventState,
    ) -> Verdict {
        match self {
            EventAlgorithm::None => Verdict::Hold,

            EventAlgorithm::ChangeOfBitstring { bitmask, alarm_values } => {
                let Some(Value::BitString(bits)) = new.first() else { return Verdict::Hold };
                let masked = mask(bits, bitmask);
                let offnormal = alarm_values.iter().any(|av| mask(av, bitmask) == masked);
                transition_to(offnormal, current)
            }

            EventAlgorithm::ChangeOfState { alarm_values } => {
                let Some(value) = new.first() else { return Verdict::Hold };
                transition_to(alarm_values.contains(value), current)
            }

            EventAlgorithm::ChangeOfValue { increment } => {
                let (Some(new_n), Some(old_n)) =
                    (first_numeric(new), last.and_then(first_numeric))
                else {
                    return if last.is_none() { Verdict::Notify } else { Verdict::Hold };
                };
                if (new_n - old_n).abs() >= *increment {
                    Verdict::Notify
                } else {
                    Verdict::Hold
                }
            }

            EventAlgorithm::ChangeOfCommand { expected } => {
                let Some(value) = new.first() else { return Verdict::Hold };
                transition_to(value != expected, current)
            }

            EventAlgorithm::ChangeOfReliability => {
                // Reliability 0 is "no fault detected"; anything else is a
                // fault condition.
                let Some(Value::Enumerated(reliability)) = new.first() else {
                    return Verdict::Hold;
                };
                let target =
                    if *reliability == 0 { EventState::Normal } else { EventState::Fault };
                if target == current {
                    Verdict::Hold
                } else {
                    Verdict::Transition(target)
                }
            }

            EventAlgorithm::ChangeOfStatusFlags { selected } => {
                let Some(Value::BitString(flags)) = new.first() else { return Verdict::Hold };
                let hit = (0..flags.len().min(selected.len()))
                    .any(|i| selected.bit(i) == Some(true) && flags.bit(i) == Some(true));
                transition_to(hit, current)
            }

            EventAlgorithm::ChangeOfDiscreteValue => match last {
                Some(old) if old != new => Verdict::Notify,
                None => Verdict::Notify,
                _ => Verdict::Hold,
            },

            EventAlgorithm::ChangeOfLifeSafety { alarm_values } => {
                let Some(Value::Enumerated(state)) = new.first() else { return Verdict::Hold };
                transition_to(alarm_values.contains(state), current)
            }

            EventAlgorithm::ChangeOfTimer { alarm_states } => {
                let Some(Value::Enumerated(state)) = new.first() else { return Verdict::Hold };
                if alarm_states.contains(state) {
                    Verdict::Notify
                } else {
                    Verdict::Hold
                }
            }

            EventAlgorithm::OutOfRange(params)
            | EventAlgorithm::DoubleOutOfRange(params)
            | EventAlgorithm::SignedOutOfRange(params)
            | EventAlgorithm::UnsignedOutOfRange(params) => {
                let Some(value) = first_numeric(new) else { return Verdict::Hold };
                let target = params.classify(value, current);
                if target == current {
                    Verdict::Hold
                } else {
                    Verdict::Transition(target)
                }
            }

            EventAlgorithm::FloatingLimit { setpoint, high_diff, low_diff, deadband } => {
                let Some(value) = first_numeric(new) else { return Verdict::Hold };
                let params = RangeParams {
                    high_limit: setpoint + high_diff,
                    low_limit: setpoint - low_diff,
                    deadband: *deadband,
                };
                let target = params.classify(value, current);
                if target == current {
                    Verdict::Hold
                } else {
                    Verdict::Transition(target)
                }
            }

            EventAlgorithm::ChangeOfCharacterstring { alarm_values } => {
                let Some(Value::CharacterString(s)) = new.first() else {
                    return Verdict::Hold;
                };
                transition_to(alarm_values.iter().any(|av| av == &s.text), current)
            }

            EventAlgorithm::BufferReady { threshold } => {
                let (Some(Value::Unsigned(count)), previous) = (new.first(), last) else {
                    return Verdict::Hold;
                };
                let since = match previous.and_then(|l| l.first()) {
                    Some(Value::Unsigned(old)) => count.saturating_sub(*old),
                    _ => *count,
                };
                if since >= *threshold && *threshold > 0 {
                    Verdict::Notify
                } else {
                    Verdict::Hold
                }
            }

            EventAlgorithm::AccessEvent => match new.first() {
                Some(_) => Verdict::Notify,
                None => Verdict::Hold,
            },
        }
    }
}

fn transition_to(offnormal: bool, current: EventState) -> Verdict {
    let target = if offnormal { EventState::Offnormal } else { EventState::Normal };
    if target == current {
        Verdict::Hold
    } else {
        Verdict::Transition(target)
    }
}

fn first_numeric(values: &[Value]) -> Option<f64> {
    values.first().and_then(Value::as_f64)
}

fn mask(bits: &BitString, bitmask: &BitString) -> Vec<bool> {
    (0..bits.len().max(bitmask.len()))
        .map(|i| {
            bits.bit(i).unwrap_or(false) && bitmask.bit(i).unwrap_or(false)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn real(v: f32) -> Vec<Value> {
        vec![Value::Real(v)]
    }

    #[test]
    fn out_of_range_with_deadband_hysteresis() {
        let alg = EventAlgorithm::OutOfRange(RangeParams {
            high_limit: 80.0,
            low_limit: 10.0,
            deadband: 5.0,
        });
        assert_eq!(alg.evaluate(&real(50.0), None, EventState::Normal), Verdict::Hold);
        assert_eq!(
            alg.evaluate(&real(81.0), None, EventState::Normal),
            Verdict::Transition(EventState::HighLimit)
        );
        // Inside the deadband: still high.
        assert_eq!(alg.evaluate(&real(78.0), None, EventState::HighLimit), Verdict::Hold);
        // Clear of the deadband: back to normal.
        assert_eq!(
            alg.evaluate(&real(74.0), None, EventState::HighLimit),
            Verdict::Transition(EventState::Normal)
        );
        assert_eq!(
            alg.evaluate(&real(5.0), None, EventState::Normal),
            Verdict::Transition(EventState::LowLimit)
        );
    }

    #[test]
    fn floating_limit_tracks_setpoint() {
        let alg = EventAlgorithm::FloatingLimit {
            setpoint: 20.0,
            high_diff: 5.0,
            low_diff: 5.0,
            deadband: 1.0,
        };
        assert_eq!(alg.evaluate(&real(24.0), None, EventState::Normal), Verdict::Hold);
        assert_matches!(
            alg.evaluate(&real(26.0), None, EventState::Normal),
            Verdict::Transition(EventState::HighLimit)
        );
    }

    #[test]
    fn change_of_state_matches_alarm_values() {
        let alg = EventAlgorithm::ChangeOfState {
            alarm_values: vec![Value::Enumerated(1), Value::Enumerated(2)],
        };
        assert_eq!(
            alg.evaluate(&[Value::Enumerated(1)], None, EventState::Normal),
            Verdict::Transition(EventState::Offnormal)
        );
        assert_eq!(
            alg.evaluate(&[Value::Enumerated(1)], None, EventState::Offnormal),
            Verdict::Hold
        );
        assert_eq!(
            alg.evaluate(&[Value::Enumerated(0)], None, EventState::Offnormal),
            Verdict::Transition(EventState::Normal)
        );
    }

    #[test]
    fn change_of_bitstring_applies_mask() {
        let alg = EventAlgorithm::ChangeOfBitstring {
            bitmask: BitString::from_bits(&[true, false, true]),
            alarm_values: vec![BitString::from_bits(&[true, false, false])],
        };
        // Bit 1 differs but is masked out; bit pattern matches the alarm.
        assert_eq!(
            alg.evaluate(
                &[Value::BitString(BitString::from_bits(&[true, true, false]))],
                None,
                EventState::Normal,
            ),
            Verdict::Transition(EventState::Offnormal)
        );
        assert_eq!(
            alg.evaluate(
                &[Value::BitString(BitString::from_bits(&[false, true, false]))],
                None,
                EventState::Offnormal,
            ),
            Verdict::Transition(EventState::Normal)
        );
    }

    #[test]
    fn change_of_value_notifies_on_movement() {
        let alg = EventAlgorithm::ChangeOfValue { increment: 2.0 };
        assert_eq!(alg.evaluate(&real(10.0), None, EventState::Normal), Verdict::Notify);
        assert_eq!(
            alg.evaluate(&real(11.0), Some(&real(10.0)), EventState::Normal),
            Verdict::Hold
        );
        assert_eq!(
            alg.evaluate(&real(12.0), Some(&real(10.0)), EventState::Normal),
            Verdict::Notify
        );
    }

    #[test]
    fn reliability_faults_and_recovers() {
        let alg = EventAlgorithm::ChangeOfReliability;
        assert_eq!(
            alg.evaluate(&[Value::Enumerated(7)], None, EventState::Normal),
            Verdict::Transition(EventState::Fault)
        );
        assert_eq!(
            alg.evaluate(&[Value::Enumerated(0)], None, EventState::Fault),
            Verdict::Transition(EventState::Normal)
        );
    }

    #[test]
    fn status_flags_selection() {
        let alg = EventAlgorithm::ChangeOfStatusFlags {
            // Select in-alarm and fault.
            selected: BitString::from_bits(&[true, true, false, false]),
        };
        assert_eq!(
            alg.evaluate(
                &[Value::BitString(BitString::from_bits(&[false, true, false, false]))],
                None,
                EventState::Normal,
            ),
            Verdict::Transition(EventState::Offnormal)
        );
        assert_eq!(
            alg.evaluate(
                &[Value::BitString(BitString::from_bits(&[false, false, true, false]))],
                None,
                EventState::Normal,
            ),
            Verdict::Hold
        );
    }

    #[test]
    fn characterstring_alarm_values() {
        let alg = EventAlgorithm::ChangeOfCharacterstring {
            alarm_values: vec!["FAULT".to_owned()],
        };
        assert_eq!(
            alg.evaluate(&[Value::string("FAULT")], None, EventState::Normal),
            Verdict::Transition(EventState::Offnormal)
        );
        assert_eq!(
            alg.evaluate(&[Value::string("ok")], None, EventState::Normal),
            Verdict::Hold
        );
    }

    #[test]
    fn buffer_ready_threshold() {
        let alg = EventAlgorithm::BufferReady { threshold: 10 };
        assert_eq!(
            alg.evaluate(&[Value::Unsigned(5)], None, EventState::Normal),
            Verdict::Hold
        );
        assert_eq!(
            alg.evaluate(&[Value::Unsigned(10)], None, EventState::Normal),
            Verdict::Notify
        );
        assert_eq!(
            alg.evaluate(
                &[Value::Unsigned(15)],
                Some(&[Value::Unsigned(10)]),
                EventState::Normal
            ),
            Verdict::Hold
        );
        assert_eq!(
            alg.evaluate(
                &[Value::Unsigned(20)],
                Some(&[Value::Unsigned(10)]),
                EventState::Normal
            ),
            Verdict::Notify
        );
    }

    #[test]
    fn life_safety_and_timer() {
        let alg = EventAlgorithm::ChangeOfLifeSafety { alarm_values: vec![3] };
        assert_eq!(
            alg.evaluate(&[Value::Enumerated(3)], None, EventState::Normal),
            Verdict::Transition(EventState::Offnormal)
        );
        let alg = EventAlgorithm::ChangeOfTimer { alarm_states: vec![2] };
        assert_eq!(
            alg.evaluate(&[Value::Enumerated(2)], None, EventState::Normal),
            Verdict::Notify
        );
        assert_eq!(
            alg.evaluate(&[Value::Enumerated(1)], None, EventState::Normal),
            Verdict::Hold
        );
    }

    #[test]
    fn discrete_value_and_access_event() {
        let alg = EventAlgorithm::ChangeOfDiscreteValue;
        assert_eq!(
            alg.evaluate(&[Value::Unsigned(1)], Some(&[Value::Unsigned(1)]), EventState::Normal),
            Verdict::Hold
        );
        assert_eq!(
            alg.evaluate(&[Value::Unsigned(2)], Some(&[Value::Unsigned(1)]), EventState::Normal),
            Verdict::Notify
        );
        let alg = EventAlgorithm::AccessEvent;
        assert_eq!(
            alg.evaluate(&[Value::Unsigned(99)], None, EventState::Normal),
            Verdict::Notify
        );
    }

    #[test]
    fn none_never_fires() {
        let alg = EventAlgorithm::None;
        assert_eq!(alg.evaluate(&real(1e9), None, EventState::Normal), Verdict::Hold);
    }

    #[test]
    fn event_type_codes_are_distinct_for_range_family() {
        let p = RangeParams { high_limit: 1.0, low_limit: 0.0, deadband: 0.0 };
        assert_eq!(EventAlgorithm::OutOfRange(p).event_type(), 5);
        assert_eq!(EventAlgorithm::DoubleOutOfRange(p).event_type(), 14);
        assert_eq!(EventAlgorithm::SignedOutOfRange(p).event_type(), 15);
        assert_eq!(EventAlgorithm::UnsignedOutOfRange(p).event_type(), 16);
    }
}
