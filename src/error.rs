// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Error types for the stack, one enum per layer.
//!
//! Decode failures stay at the transport boundary: a peer that sends a
//! malformed frame gets its frame dropped and a WARN log line, nothing else.
//! Service, transaction and security errors are values the caller sees.

use thiserror::Error;

/// Results returned from wire-format decoders.
pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// A syntactically invalid PDU or frame from a peer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer ended before the field was complete")]
    Truncated,
    #[error("invalid tag octet")]
    InvalidTag,
    #[error("expected tag {expected}, found tag {actual}")]
    UnexpectedTag { expected: u8, actual: u8 },
    #[error("length {0} exceeds the decode cap")]
    LengthTooLarge(u32),
    #[error("constructed data nested deeper than the limit")]
    NestingTooDeep,
    #[error("unknown character set {0}")]
    InvalidCharset(u8),
    #[error("list exceeds the decoded item cap")]
    CountLimitExceeded,
    #[error("value is out of range for the field")]
    OutOfRange,
    #[error("unknown PDU or function code {0}")]
    UnknownPduType(u8),
}

/// A well-formed request the application layer rejected, as carried by an
/// Error-PDU. Classes and codes are the Clause 18 integer enumerations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("service error class {class} code {code}")]
pub struct ServiceError {
    pub class: u16,
    pub code: u16,
}

impl ServiceError {
    pub const fn new(class: u16, code: u16) -> Self {
        ServiceError { class, code }
    }
}

/// Error classes from Clause 18 that the core itself raises.
pub mod error_class {
    pub const DEVICE: u16 = 0;
    pub const OBJECT: u16 = 1;
    pub const PROPERTY: u16 = 2;
    pub const RESOURCES: u16 = 3;
    pub const SECURITY: u16 = 4;
    pub const SERVICES: u16 = 5;
    pub const COMMUNICATION: u16 = 7;
}

/// Error codes from Clause 18 that the core itself raises.
pub mod error_code {
    pub const OTHER: u16 = 0;
    pub const PASSWORD_FAILURE: u16 = 26;
    pub const RESOURCES_OTHER: u16 = 27;
    pub const UNKNOWN_OBJECT: u16 = 31;
    pub const UNKNOWN_PROPERTY: u16 = 32;
    pub const VALUE_OUT_OF_RANGE: u16 = 37;
    pub const WRITE_ACCESS_DENIED: u16 = 40;
    pub const INVALID_DATA_TYPE: u16 = 9;
    pub const NOT_COV_PROPERTY: u16 = 44;
    pub const SERVICE_REQUEST_DENIED: u16 = 29;
}

/// Why a confirmed transaction ended without an ACK.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("no response within the APDU timeout after all retries")]
    Timeout,
    #[error("transaction cancelled")]
    Cancelled,
    #[error("an identical (peer, invoke-id) transaction is already active")]
    ResourcesBusy,
    #[error("no route to the destination network")]
    PeerUnreachable,
    #[error("peer rejected the request: reason {0}")]
    Rejected(u8),
    #[error("peer aborted the transaction: reason {0}")]
    Aborted(u8),
    #[error("peer returned an error: {0}")]
    Service(ServiceError),
    #[error("segmentation is required but the peer does not support it")]
    SegmentationNotSupported,
}

/// Failures raised by a data-link port.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("failed to bind the port socket: {0}")]
    BindFailed(#[source] std::io::Error),
    #[error("socket i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("the port is not started")]
    NotStarted,
    #[error("address {0} does not fit this data link")]
    InvalidAddress(String),
    #[error("outbound frame of {0} bytes exceeds the link MTU")]
    FrameTooLarge(usize),
    #[error("virtual address resolution timed out")]
    ResolutionTimeout,
}

/// Failures that close a Secure Connect link. Never suppressed.
#[derive(Error, Debug)]
pub enum SecurityError {
    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),
    #[error("peer claimed origin VMAC it does not own")]
    VmacSpoof,
    #[error("connection from unauthorized origin")]
    UnauthorizedOrigin,
    #[error("VMAC or UUID collides with an existing connection")]
    Collision,
    #[error("invalid certificate material: {0}")]
    InvalidCertificate(String),
}

/// Configuration problems surfaced at startup; fatal to the component.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("instance number {0} exceeds the 22-bit range")]
    InstanceOutOfRange(u32),
    #[error("{0}")]
    InvalidAddress(String),
    #[error("secure connect requires either TLS material or allow_plaintext")]
    MissingTlsMaterial,
    #[error("invalid option {name}: {reason}")]
    InvalidOption { name: &'static str, reason: String },
}
