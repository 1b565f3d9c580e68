// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A BACnet (ASHRAE 135-2020) protocol core.
//!
//! The crate is a layered stack. Each layer owns one concern and talks to its
//! neighbors through narrow typed contracts, so every layer is testable on
//! its own:
//!
//! - [`wire`]: tag-length-value codec for application data (Clause 20),
//!   NPDU/APDU framing (Clauses 6 and 20.1), and the per-data-link
//!   virtual link control frames (Annexes J, U, AB and Clause 7).
//! - [`network`]: NPDU routing, router discovery and the router cache.
//! - [`transaction`]: the client/server transaction state machines with
//!   segmented request/response reassembly (Clause 5).
//! - [`service`]: typed request/response codecs for the application
//!   services and the dispatch registry.
//! - [`datalink`]: UDP/IPv4 (Annex J, including BBMD), UDP/IPv6 (Annex U)
//!   and raw Ethernet (Clause 7) ports behind the [`datalink::TransportPort`]
//!   contract.
//! - [`sc`]: the BACnet Secure Connect hub-and-spoke transport (Annex AB)
//!   over WebSocket/TLS 1.3.
//! - [`cov`] and [`event`]: change-of-value subscriptions and the
//!   intrinsic-reporting event algorithms.
//! - [`app`]: the long-lived `Application` value tying the stack together.
//!
//! All protocol state is mutated on a single event loop; transports run
//! their own socket tasks and hand frames in through channels.

pub mod addr;
pub mod app;
pub mod config;
pub mod cov;
pub mod datalink;
pub mod error;
pub mod event;
pub mod network;
pub mod object;
pub mod sc;
pub mod service;
pub mod transaction;
pub mod types;
pub mod util;
pub mod wire;

pub use addr::{Address, MacAddr};
pub use app::{Application, ApplicationHandle};
pub use config::DeviceConfig;
pub use error::{DecodeError, LinkError, SecurityError, ServiceError, TransactionError};
pub use types::{ObjectId, ObjectType, PropertyId};
