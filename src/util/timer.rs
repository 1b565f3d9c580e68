// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A testable timeout scheduler.
//!
//! State machines schedule typed events against a [`Timer`]; the scheduled
//! entries come out of a [`TimeStream`] that the application drives with real
//! sleeps in production and by hand in tests. A timeout that has been
//! superseded is detected by comparing [`EventId`]s, so stale deadlines fall
//! through harmlessly.

use std::time::{Duration, Instant};

use futures::channel::mpsc;

pub type EventId = u64;

/// An entry the driver should deliver once `deadline` has passed.
#[derive(Debug)]
pub struct ScheduledEvent<E> {
    pub deadline: Instant,
    pub id: EventId,
    pub event: E,
}

/// A scheduled event that has come due.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedEvent<E> {
    pub id: EventId,
    pub event: E,
}

pub type TimeStream<E> = mpsc::UnboundedReceiver<ScheduledEvent<E>>;

/// Schedules deadline events. Cheap to clone is not needed; each state
/// machine owns one.
#[derive(Debug)]
pub struct Timer<E> {
    sender: mpsc::UnboundedSender<ScheduledEvent<E>>,
    next_id: EventId,
}

impl<E> Timer<E> {
    pub fn schedule_at(&mut self, deadline: Instant, event: E) -> EventId {
        let id = self.next_id;
        self.next_id += 1;
        // A dropped stream means shutdown is in progress; the deadline is moot.
        let _ = self.sender.unbounded_send(ScheduledEvent { deadline, id, event });
        id
    }

    pub fn schedule_after(&mut self, duration: Duration, event: E) -> EventId {
        self.schedule_at(Instant::now() + duration, event)
    }
}

/// Creates a timer and the stream of entries scheduled against it.
pub fn create_timer<E>() -> (Timer<E>, TimeStream<E>) {
    let (sender, receiver) = mpsc::unbounded();
    (Timer { sender, next_id: 1 }, receiver)
}

/// Drives a time stream with real sleeps, invoking `deliver` as entries come
/// due. Runs until the stream closes (all timers dropped).
pub async fn drive<E, F: FnMut(TimedEvent<E>)>(mut stream: TimeStream<E>, mut deliver: F) {
    use futures::StreamExt;
    while let Some(entry) = stream.next().await {
        let now = Instant::now();
        if entry.deadline > now {
            tokio::time::sleep(entry.deadline - now).await;
        }
        deliver(TimedEvent { id: entry.id, event: entry.event });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[derive(Debug, Clone, PartialEq)]
    enum Ev {
        Retry,
        Heartbeat,
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let (mut timer, mut stream) = create_timer();
        let a = timer.schedule_after(Duration::from_secs(1), Ev::Retry);
        let b = timer.schedule_after(Duration::from_secs(2), Ev::Heartbeat);
        assert!(b > a);
        let first = stream.try_next().unwrap().unwrap();
        assert_eq!(first.id, a);
        assert_eq!(first.event, Ev::Retry);
        let second = stream.try_next().unwrap().unwrap();
        assert_eq!(second.id, b);
        assert_eq!(second.event, Ev::Heartbeat);
    }

    #[test]
    fn schedule_outlives_dropped_stream() {
        let (mut timer, stream) = create_timer();
        drop(stream);
        // Must not panic.
        timer.schedule_after(Duration::from_millis(1), Ev::Retry);
    }

    #[tokio::test(start_paused = true)]
    async fn drive_delivers_after_deadline() {
        let (mut timer, stream) = create_timer();
        timer.schedule_after(Duration::from_secs(3), Ev::Retry);
        drop(timer);
        let mut delivered = Vec::new();
        let driver = drive(stream, |ev| delivered.push(ev));
        driver.await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].event, Ev::Retry);
    }

    #[tokio::test]
    async fn stream_closes_when_all_timers_drop() {
        let (timer, mut stream) = create_timer::<Ev>();
        drop(timer);
        assert_eq!(stream.next().await.map(|e| e.event), None);
    }
}
