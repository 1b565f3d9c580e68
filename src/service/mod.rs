// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Application services: the service-choice numbering, the dispatch
//! registry, and (in [`codecs`]) the typed request/response bodies.

pub mod codecs;

use std::collections::HashMap;

use log::{debug, warn};

use crate::addr::Address;
use crate::transaction::Response;
use crate::wire::apdu::reject_reason;

const LOG: &str = "bacnet::service";

/// Confirmed service choices (Clause 21).
pub mod confirmed {
    pub const ACKNOWLEDGE_ALARM: u8 = 0;
    pub const COV_NOTIFICATION: u8 = 1;
    pub const EVENT_NOTIFICATION: u8 = 2;
    pub const GET_ALARM_SUMMARY: u8 = 3;
    pub const GET_ENROLLMENT_SUMMARY: u8 = 4;
    pub const SUBSCRIBE_COV: u8 = 5;
    pub const ATOMIC_READ_FILE: u8 = 6;
    pub const ATOMIC_WRITE_FILE: u8 = 7;
    pub const ADD_LIST_ELEMENT: u8 = 8;
    pub const REMOVE_LIST_ELEMENT: u8 = 9;
    pub const CREATE_OBJECT: u8 = 10;
    pub const DELETE_OBJECT: u8 = 11;
    pub const READ_PROPERTY: u8 = 12;
    pub const READ_PROPERTY_MULTIPLE: u8 = 14;
    pub const WRITE_PROPERTY: u8 = 15;
    pub const WRITE_PROPERTY_MULTIPLE: u8 = 16;
    pub const DEVICE_COMMUNICATION_CONTROL: u8 = 17;
    pub const PRIVATE_TRANSFER: u8 = 18;
    pub const TEXT_MESSAGE: u8 = 19;
    pub const REINITIALIZE_DEVICE: u8 = 20;
    pub const VT_OPEN: u8 = 21;
    pub const VT_CLOSE: u8 = 22;
    pub const VT_DATA: u8 = 23;
    pub const READ_RANGE: u8 = 26;
    pub const SUBSCRIBE_COV_PROPERTY: u8 = 28;
    pub const GET_EVENT_INFORMATION: u8 = 29;
    pub const SUBSCRIBE_COV_PROPERTY_MULTIPLE: u8 = 30;
    pub const AUDIT_NOTIFICATION: u8 = 32;
    pub const AUDIT_LOG_QUERY: u8 = 33;
}

/// Unconfirmed service choices (Clause 21).
pub mod unconfirmed {
    pub const I_AM: u8 = 0;
    pub const I_HAVE: u8 = 1;
    pub const COV_NOTIFICATION: u8 = 2;
    pub const EVENT_NOTIFICATION: u8 = 3;
    pub const PRIVATE_TRANSFER: u8 = 4;
    pub const TEXT_MESSAGE: u8 = 5;
    pub const TIME_SYNCHRONIZATION: u8 = 6;
    pub const WHO_HAS: u8 = 7;
    pub const WHO_IS: u8 = 8;
    pub const UTC_TIME_SYNCHRONIZATION: u8 = 9;
    pub const WRITE_GROUP: u8 = 10;
    pub const AUDIT_NOTIFICATION: u8 = 12;
    pub const WHO_AM_I: u8 = 13;
    pub const YOU_ARE: u8 = 14;
}

/// Addressing facts a handler may need beyond the service body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHead {
    pub source: Address,
}

type ConfirmedHandler<C> = Box<dyn FnMut(&mut C, &RequestHead, &[u8]) -> Response + Send>;
type UnconfirmedHandler<C> = Box<dyn FnMut(&mut C, &RequestHead, &[u8]) + Send>;

/// The dispatch table: `(direction, service choice) → handler`.
///
/// Handlers are registered once at application start against a caller-owned
/// context `C` (the application state), keeping the registry free of any
/// shared-ownership machinery. An unknown confirmed choice answers
/// `Reject(unrecognized-service)`; an unknown unconfirmed choice is dropped
/// with a debug line.
pub struct ServiceRegistry<C> {
    confirmed: HashMap<u8, ConfirmedHandler<C>>,
    unconfirmed: HashMap<u8, UnconfirmedHandler<C>>,
}

impl<C> Default for ServiceRegistry<C> {
    fn default() -> Self {
        ServiceRegistry { confirmed: HashMap::new(), unconfirmed: HashMap::new() }
    }
}

impl<C> ServiceRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_confirmed(
        &mut self,
        choice: u8,
        handler: impl FnMut(&mut C, &RequestHead, &[u8]) -> Response + Send + 'static,
    ) {
        if self.confirmed.insert(choice, Box::new(handler)).is_some() {
            warn!(target: LOG, "confirmed service {} registered twice; replaced", choice);
        }
    }

    pub fn register_unconfirmed(
        &mut self,
        choice: u8,
        handler: impl FnMut(&mut C, &RequestHead, &[u8]) + Send + 'static,
    ) {
        if self.unconfirmed.insert(choice, Box::new(handler)).is_some() {
            warn!(target: LOG, "unconfirmed service {} registered twice; replaced", choice);
        }
    }

    pub fn dispatch_confirmed(
        &mut self,
        ctx: &mut C,
        head: &RequestHead,
        choice: u8,
        data: &[u8],
    ) -> Response {
        match self.confirmed.get_mut(&choice) {
            Some(handler) => handler(ctx, head, data),
            None => {
                debug!(target: LOG, "unrecognized confirmed service {}", choice);
                Response::Reject(reject_reason::UNRECOGNIZED_SERVICE)
            }
        }
    }

    pub fn dispatch_unconfirmed(
        &mut self,
        ctx: &mut C,
        head: &RequestHead,
        choice: u8,
        data: &[u8],
    ) {
        match self.unconfirmed.get_mut(&choice) {
            Some(handler) => handler(ctx, head, data),
            None => debug!(target: LOG, "unrecognized unconfirmed service {}; dropped", choice),
        }
    }

    pub fn confirmed_choices(&self) -> Vec<u8> {
        let mut choices: Vec<u8> = self.confirmed.keys().copied().collect();
        choices.sort_unstable();
        choices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::MacAddr;
    use crate::transaction::Response;

    fn head() -> RequestHead {
        RequestHead { source: Address::local(MacAddr::new(&[1]).unwrap()) }
    }

    #[test]
    fn dispatches_to_registered_handler() {
        let mut registry: ServiceRegistry<u32> = ServiceRegistry::new();
        registry.register_confirmed(confirmed::READ_PROPERTY, |calls, _, data| {
            *calls += 1;
            Response::Complex(data.to_vec())
        });
        let mut calls = 0;
        let response =
            registry.dispatch_confirmed(&mut calls, &head(), confirmed::READ_PROPERTY, &[0xAB]);
        assert_eq!(calls, 1);
        assert_eq!(response, Response::Complex(vec![0xAB]));
    }

    #[test]
    fn unknown_confirmed_choice_rejects() {
        let mut registry: ServiceRegistry<()> = ServiceRegistry::new();
        let response = registry.dispatch_confirmed(&mut (), &head(), 200, &[]);
        assert_eq!(response, Response::Reject(reject_reason::UNRECOGNIZED_SERVICE));
    }

    #[test]
    fn unknown_unconfirmed_choice_is_dropped() {
        let mut registry: ServiceRegistry<u32> = ServiceRegistry::new();
        let mut calls = 0;
        registry.dispatch_unconfirmed(&mut calls, &head(), 200, &[]);
        assert_eq!(calls, 0);
    }

    #[test]
    fn unconfirmed_handlers_see_the_source() {
        let mut registry: ServiceRegistry<Option<Address>> = ServiceRegistry::new();
        registry.register_unconfirmed(unconfirmed::WHO_IS, |seen, head, _| {
            *seen = Some(head.source);
        });
        let mut seen = None;
        registry.dispatch_unconfirmed(&mut seen, &head(), unconfirmed::WHO_IS, &[]);
        assert_eq!(seen, Some(head().source));
    }

    #[test]
    fn confirmed_choices_are_sorted() {
        let mut registry: ServiceRegistry<()> = ServiceRegistry::new();
        registry.register_confirmed(confirmed::WRITE_PROPERTY, |_, _, _| Response::Simple);
        registry.register_confirmed(confirmed::READ_PROPERTY, |_, _, _| Response::Simple);
        assert_eq!(
            registry.confirmed_choices(),
            vec![confirmed::READ_PROPERTY, confirmed::WRITE_PROPERTY]
        );
    }
}
