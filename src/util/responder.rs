// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Single-shot completion channels handed through the stack.

use futures::channel::oneshot;

/// The sending half of a oneshot, consumed by answering exactly once.
///
/// Dropping a responder wakes the receiver with a cancellation, so a
/// transaction that dies without answering still frees its waiter.
#[derive(Debug)]
pub struct Responder<T>(oneshot::Sender<T>);

impl<T> Responder<T> {
    pub fn new() -> (Responder<T>, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (Responder(tx), rx)
    }

    pub fn respond(self, response: T) {
        // The receiver having gone away means nobody is waiting anymore.
        let _ = self.0.send(response);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.is_canceled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn respond_completes_receiver() {
        let (responder, receiver) = Responder::new();
        responder.respond(41);
        assert_eq!(receiver.await, Ok(41));
    }

    #[tokio::test]
    async fn drop_wakes_receiver_with_cancellation() {
        let (responder, receiver) = Responder::<u32>::new();
        drop(responder);
        assert!(receiver.await.is_err());
    }

    #[test]
    fn canceled_receiver_is_visible() {
        let (responder, receiver) = Responder::<u32>::new();
        assert!(!responder.is_canceled());
        drop(receiver);
        assert!(responder.is_canceled());
    }
}
