// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Thin wrappers around unbounded senders.
//!
//! Components hand each other sinks rather than channel halves so that a
//! receiver that has gone away turns into a log line, not an error the
//! sender has to thread upward.

use futures::channel::mpsc;
use log::warn;
use std::fmt;

/// An unbounded sender that logs and drops on a closed receiver.
pub struct UnboundedSink<T> {
    sender: mpsc::UnboundedSender<T>,
    /// Short name used in the drop log line, e.g. "network".
    label: &'static str,
}

impl<T> UnboundedSink<T> {
    pub fn new(sender: mpsc::UnboundedSender<T>, label: &'static str) -> Self {
        UnboundedSink { sender, label }
    }

    pub fn send(&self, msg: T) {
        if self.sender.unbounded_send(msg).is_err() {
            warn!(target: "bacnet::sink", "{} receiver is gone; dropping message", self.label);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl<T> Clone for UnboundedSink<T> {
    fn clone(&self) -> Self {
        UnboundedSink { sender: self.sender.clone(), label: self.label }
    }
}

impl<T> fmt::Debug for UnboundedSink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnboundedSink({})", self.label)
    }
}

/// Creates a labelled sink together with its receiving half.
pub fn unbounded<T>(label: &'static str) -> (UnboundedSink<T>, mpsc::UnboundedReceiver<T>) {
    let (tx, rx) = mpsc::unbounded();
    (UnboundedSink::new(tx, label), rx)
}
