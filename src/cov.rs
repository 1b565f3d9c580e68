// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Change-of-value subscriptions.
//!
//! Subscriptions map `(monitored object, optional property)` to a
//! subscriber; two secondary indices make dispatch proportional to the
//! subscriptions on the changed object, not the subscription population.
//! Counts are capped; the periodic sweep purges expired entries.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use log::debug;

use crate::addr::Address;
use crate::error::{error_class, error_code, ServiceError};
use crate::object::Change;
use crate::service::codecs::{CovNotification, PropertyValue};
use crate::types::{property, ObjectId, PropertyId};
use crate::wire::value::Value;

const LOG: &str = "bacnet::cov";

/// Caps on concurrent subscriptions.
pub const OBJECT_SUBSCRIPTION_CAP: usize = 1000;
pub const PROPERTY_SUBSCRIPTION_CAP: usize = 1000;

/// Identity of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub process_id: u32,
    pub subscriber: Address,
    pub object: ObjectId,
    /// `None` for object-level Subscribe-COV.
    pub property: Option<PropertyId>,
}

#[derive(Debug, Clone)]
struct Subscription {
    confirmed: bool,
    expires: Option<Instant>,
    lifetime: Option<Duration>,
    cov_increment: Option<f64>,
    last_reported: Option<Vec<Value>>,
    created: Instant,
}

/// A notification ready to leave through the TSM or as an unconfirmed
/// request.
#[derive(Debug, Clone, PartialEq)]
pub struct CovDispatch {
    pub subscriber: Address,
    pub confirmed: bool,
    pub notification: CovNotification,
}

/// The subscription engine.
pub struct CovEngine {
    device: ObjectId,
    subs: HashMap<SubscriptionKey, Subscription>,
    by_object: HashMap<ObjectId, HashSet<SubscriptionKey>>,
    by_property: HashMap<(ObjectId, PropertyId), HashSet<SubscriptionKey>>,
    object_cap: usize,
    property_cap: usize,
}

impl CovEngine {
    pub fn new(device: ObjectId) -> CovEngine {
        CovEngine {
            device,
            subs: HashMap::new(),
            by_object: HashMap::new(),
            by_property: HashMap::new(),
            object_cap: OBJECT_SUBSCRIPTION_CAP,
            property_cap: PROPERTY_SUBSCRIPTION_CAP,
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subs.len()
    }

    fn count_level(&self, property: Option<PropertyId>) -> usize {
        self.subs.keys().filter(|k| k.property.is_some() == property.is_some()).count()
    }

    /// Creates or refreshes a subscription. `None` for both `confirmed` and
    /// `lifetime` cancels (the Subscribe-COV cancellation form). `baseline`
    /// is the monitored value at subscription time, so an unchanged write
    /// right after subscribing stays quiet.
    pub fn subscribe(
        &mut self,
        key: SubscriptionKey,
        confirmed: Option<bool>,
        lifetime_seconds: Option<u32>,
        cov_increment: Option<f64>,
        baseline: Option<Vec<Value>>,
        object_exists: bool,
        now: Instant,
    ) -> Result<(), ServiceError> {
        if confirmed.is_none() && lifetime_seconds.is_none() {
            self.cancel(&key);
            return Ok(());
        }
        if !object_exists {
            return Err(ServiceError::new(error_class::OBJECT, error_code::UNKNOWN_OBJECT));
        }
        let cap = if key.property.is_some() { self.property_cap } else { self.object_cap };
        if !self.subs.contains_key(&key) && self.count_level(key.property) >= cap {
            return Err(ServiceError::new(
                error_class::RESOURCES,
                error_code::RESOURCES_OTHER,
            ));
        }
        let lifetime = lifetime_seconds
            .filter(|s| *s > 0)
            .map(|s| Duration::from_secs(s as u64));
        let last_reported = self
            .subs
            .get(&key)
            .and_then(|s| s.last_reported.clone())
            .or(baseline);
        self.subs.insert(
            key,
            Subscription {
                confirmed: confirmed.unwrap_or(false),
                expires: lifetime.map(|l| now + l),
                lifetime,
                cov_increment,
                last_reported,
                created: now,
            },
        );
        self.by_object.entry(key.object).or_default().insert(key);
        if let Some(prop) = key.property {
            self.by_property.entry((key.object, prop)).or_default().insert(key);
        }
        Ok(())
    }

    pub fn cancel(&mut self, key: &SubscriptionKey) {
        if self.subs.remove(key).is_none() {
            return;
        }
        if let Some(set) = self.by_object.get_mut(&key.object) {
            set.remove(key);
            if set.is_empty() {
                self.by_object.remove(&key.object);
            }
        }
        if let Some(prop) = key.property {
            if let Some(set) = self.by_property.get_mut(&(key.object, prop)) {
                set.remove(key);
                if set.is_empty() {
                    self.by_property.remove(&(key.object, prop));
                }
            }
        }
    }

    /// Purges expired subscriptions.
    pub fn sweep(&mut self, now: Instant) {
        let expired: Vec<SubscriptionKey> = self
            .subs
            .iter()
            .filter(|(_, s)| s.expires.map_or(false, |e| e <= now))
            .map(|(k, _)| *k)
            .collect();
        for key in &expired {
            self.cancel(key);
        }
        if !expired.is_empty() {
            debug!(target: LOG, "expired {} subscriptions", expired.len());
        }
    }

    /// Applies one property change and returns the notifications due.
    ///
    /// Object-level subscriptions report present-value and status-flags
    /// changes; property-level subscriptions their property only.
    /// Increment-bearing subscriptions suppress reports until the numeric
    /// movement reaches the increment.
    pub fn on_change(&mut self, change: &Change, now: Instant) -> Vec<CovDispatch> {
        let mut due: Vec<SubscriptionKey> = Vec::new();

        if let Some(keys) = self.by_property.get(&(change.object, change.property)) {
            due.extend(keys.iter().copied());
        }
        if change.property == property::PRESENT_VALUE
            || change.property == property::STATUS_FLAGS
        {
            if let Some(keys) = self.by_object.get(&change.object) {
                due.extend(keys.iter().copied().filter(|k| k.property.is_none()));
            }
        }

        let mut out = Vec::new();
        for key in due {
            let Some(sub) = self.subs.get_mut(&key) else { continue };
            if let Some(expires) = sub.expires {
                if expires <= now {
                    continue;
                }
            }
            if !change_is_reportable(sub, &change.values) {
                continue;
            }
            sub.last_reported = Some(change.values.clone());
            let time_remaining = sub
                .expires
                .map(|e| e.saturating_duration_since(now).as_secs() as u32)
                .unwrap_or(0);
            out.push(CovDispatch {
                subscriber: key.subscriber,
                confirmed: sub.confirmed,
                notification: CovNotification {
                    process_id: key.process_id,
                    initiating_device: self.device,
                    monitored_object: change.object,
                    time_remaining_seconds: time_remaining,
                    values: vec![PropertyValue {
                        property: change.property,
                        array_index: None,
                        value: change.values.clone(),
                        priority: None,
                    }],
                },
            });
        }
        // Deterministic order for the callers serializing notifications.
        out.sort_by_key(|d| (d.subscriber, d.notification.process_id));
        out
    }

    /// Age of the oldest subscription, for diagnostics.
    pub fn oldest_subscription_age(&self, now: Instant) -> Option<Duration> {
        self.subs.values().map(|s| now.duration_since(s.created)).max()
    }

    /// Remaining lifetime for a refresh response.
    pub fn lifetime_of(&self, key: &SubscriptionKey) -> Option<Duration> {
        self.subs.get(key).and_then(|s| s.lifetime)
    }
}

fn change_is_reportable(sub: &Subscription, new_values: &[Value]) -> bool {
    let Some(last) = &sub.last_reported else {
        // First observation after subscribing always reports.
        return true;
    };
    match (sub.cov_increment, numeric_of(new_values), numeric_of(last)) {
        (Some(increment), Some(new), Some(old)) => (new - old).abs() >= increment,
        // Non-numeric (or no increment): any inequality reports.
        _ => last != new_values,
    }
}

fn numeric_of(values: &[Value]) -> Option<f64> {
    match values {
        [single] => single.as_f64(),
        _ => None,
    }
}
