// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Identifiers and protocol-wide limits.

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Largest valid object instance (22 bits, with 4194303 reserved as the
/// unspecified wildcard).
pub const MAX_INSTANCE: u32 = 4_194_302;

/// Wildcard instance used by Who-Has and device-address binding.
pub const WILDCARD_INSTANCE: u32 = 4_194_303;

/// Decode-side caps (spec'd denial-of-service limits).
pub mod limits {
    /// No decoded length field may exceed this.
    pub const MAX_DECODE_LEN: u32 = 1 << 20;
    /// Constructed data may nest at most this deep.
    pub const MAX_NESTING: usize = 32;
    /// No decoded list may carry more items than this.
    pub const MAX_LIST_ITEMS: usize = 10_000;
    /// Network-number lists in Clause 6 messages cap here.
    pub const MAX_NETWORK_LIST: usize = 512;
    /// Reassembled segmented APDUs cap here.
    pub const MAX_REASSEMBLY: usize = 1 << 20;
    /// Bound on cached vendor enumeration entries.
    pub const MAX_VENDOR_ENUMS: usize = 4096;
}

/// A 10-bit object type. Standard types are plain constants; the enum stays
/// open because vendors allocate the upper range.
pub type ObjectType = u16;

/// Standard object types the core itself needs to know about.
pub mod object_type {
    use super::ObjectType;
    pub const ANALOG_INPUT: ObjectType = 0;
    pub const ANALOG_OUTPUT: ObjectType = 1;
    pub const ANALOG_VALUE: ObjectType = 2;
    pub const BINARY_INPUT: ObjectType = 3;
    pub const BINARY_OUTPUT: ObjectType = 4;
    pub const BINARY_VALUE: ObjectType = 5;
    pub const DEVICE: ObjectType = 8;
    pub const EVENT_ENROLLMENT: ObjectType = 9;
    pub const FILE: ObjectType = 10;
    pub const NOTIFICATION_CLASS: ObjectType = 15;
    pub const MULTI_STATE_VALUE: ObjectType = 19;
    pub const MAX: ObjectType = 0x3FF;
}

/// A property identifier. Exposed as an integer constant set only; the
/// content model behind each property is out of scope for the core.
pub type PropertyId = u32;

/// The property identifiers the core dispatches on.
pub mod property {
    use super::PropertyId;
    pub const ALL: PropertyId = 8;
    pub const EVENT_ENABLE: PropertyId = 35;
    pub const EVENT_STATE: PropertyId = 36;
    pub const HIGH_LIMIT: PropertyId = 45;
    pub const LOW_LIMIT: PropertyId = 59;
    pub const NOTIFICATION_CLASS: PropertyId = 17;
    pub const NOTIFY_TYPE: PropertyId = 72;
    pub const OBJECT_IDENTIFIER: PropertyId = 75;
    pub const OBJECT_LIST: PropertyId = 76;
    pub const OBJECT_NAME: PropertyId = 77;
    pub const OBJECT_TYPE: PropertyId = 79;
    pub const PRESENT_VALUE: PropertyId = 85;
    pub const PRIORITY: PropertyId = 86;
    pub const RECIPIENT_LIST: PropertyId = 102;
    pub const RELIABILITY: PropertyId = 103;
    pub const REQUIRED: PropertyId = 105;
    pub const STATUS_FLAGS: PropertyId = 111;
    pub const TIME_DELAY: PropertyId = 113;
    pub const COV_INCREMENT: PropertyId = 22;
    pub const DEADBAND: PropertyId = 25;
}

/// A packed 32-bit object identifier: 10-bit type, 22-bit instance.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u32);

impl ObjectId {
    pub fn new(object_type: ObjectType, instance: u32) -> Option<ObjectId> {
        if object_type > object_type::MAX || instance > WILDCARD_INSTANCE {
            return None;
        }
        Some(ObjectId(((object_type as u32) << 22) | instance))
    }

    pub fn from_raw(raw: u32) -> ObjectId {
        ObjectId(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    pub fn object_type(&self) -> ObjectType {
        (self.0 >> 22) as ObjectType
    }

    pub fn instance(&self) -> u32 {
        self.0 & 0x3F_FFFF
    }

    /// The Device object identifier for a device instance.
    pub fn device(instance: u32) -> Option<ObjectId> {
        ObjectId::new(object_type::DEVICE, instance)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type(), self.instance())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self)
    }
}

impl FromStr for ObjectId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ConfigError::InvalidOption {
            name: "object-id",
            reason: format!("{:?} is not <type>:<instance>", s),
        };
        let (t, i) = s.split_once(':').ok_or_else(bad)?;
        let object_type: ObjectType = t.parse().map_err(|_| bad())?;
        let instance: u32 = i.parse().map_err(|_| bad())?;
        ObjectId::new(object_type, instance).ok_or_else(bad)
    }
}

/// A bounded registry of vendor-proprietary enumeration codes seen on the
/// wire (private transfers, proprietary events). Purely diagnostic; its job
/// is to stay bounded no matter what peers send.
#[derive(Debug, Default)]
pub struct VendorRegistry {
    entries: std::collections::HashMap<(u16, u32), u64>,
    tick: u64,
}

impl VendorRegistry {
    pub fn record(&mut self, vendor_id: u16, code: u32) {
        self.tick += 1;
        let tick = self.tick;
        self.entries.insert((vendor_id, code), tick);
        if self.entries.len() > limits::MAX_VENDOR_ENUMS {
            // Sweep the older half rather than churning one-by-one.
            let mut ages: Vec<u64> = self.entries.values().copied().collect();
            ages.sort_unstable();
            let cutoff = ages[ages.len() / 2];
            self.entries.retain(|_, seen| *seen > cutoff);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, vendor_id: u16, code: u32) -> bool {
        self.entries.contains_key(&(vendor_id, code))
    }
}

/// Network-priority bits of the NPDU control octet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum NetworkPriority {
    #[default]
    Normal = 0,
    Urgent = 1,
    CriticalEquipment = 2,
    LifeSafety = 3,
}

impl NetworkPriority {
    pub fn from_bits(bits: u8) -> NetworkPriority {
        match bits & 0x3 {
            1 => NetworkPriority::Urgent,
            2 => NetworkPriority::CriticalEquipment,
            3 => NetworkPriority::LifeSafety,
            _ => NetworkPriority::Normal,
        }
    }
}
