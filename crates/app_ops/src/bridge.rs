//! Synchronous cross-thread error resolution
//!
//! A worker that hits a recoverable error blocks until the UI answers.
//! The call is modelled as a message with a one-shot reply channel
//! instead of a re-entrant callback, so it stays testable without a
//! real event loop: tests implement [`ErrorResolver`] directly.

use crate::error::ItemErrorKind;
use crossbeam_channel::{Receiver, Sender};
use std::path::PathBuf;

/// What the user chose for a failed item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Retry,
    Skip,
    /// Skip this item and every later error of the same kind
    SkipAll,
    Overwrite,
    /// Overwrite this collision and every later one
    OverwriteAll,
    /// Re-run the step against a different target
    Rename(PathBuf),
    Cancel,
}

/// Everything the prompt needs to render
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub kind: ItemErrorKind,
    pub source: PathBuf,
    pub target: Option<PathBuf>,
    pub message: String,
}

/// Resolves per-item errors on behalf of the user
///
/// Must be callable from a worker thread; it may block on a modal
/// prompt but must not block forever.
pub trait ErrorResolver: Send + Sync {
    fn resolve(&self, context: &ErrorContext) -> Decision;
}

/// Answers every prompt the same way; the headless default
pub struct AutoResolver(pub Decision);

impl ErrorResolver for AutoResolver {
    fn resolve(&self, context: &ErrorContext) -> Decision {
        tracing::debug!(
            "auto-resolving {:?} on {} with {:?}",
            context.kind,
            context.source.display(),
            self.0
        );
        self.0.clone()
    }
}

/// One pending question for the UI thread
pub struct UiRequest {
    pub context: ErrorContext,
    reply: Sender<Decision>,
}

impl UiRequest {
    pub fn respond(self, decision: Decision) {
        // The worker may have been cancelled while the prompt was open
        let _ = self.reply.send(decision);
    }
}

/// Worker-side endpoint; implements [`ErrorResolver`] by sending the
/// question across and blocking on the reply
#[derive(Clone)]
pub struct BridgeClient {
    tx: Sender<UiRequest>,
}

/// UI-side endpoint; drain with `try_recv` from the event loop
pub struct BridgeHost {
    rx: Receiver<UiRequest>,
}

impl BridgeHost {
    pub fn try_recv(&self) -> Option<UiRequest> {
        self.rx.try_recv().ok()
    }

    pub fn recv(&self) -> Option<UiRequest> {
        self.rx.recv().ok()
    }
}

/// Create a connected client/host pair
pub fn bridge() -> (BridgeClient, BridgeHost) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (BridgeClient { tx }, BridgeHost { rx })
}

impl ErrorResolver for BridgeClient {
    fn resolve(&self, context: &ErrorContext) -> Decision {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let request = UiRequest {
            context: context.clone(),
            reply: reply_tx,
        };
        if self.tx.send(request).is_err() {
            // The UI side is gone; unwind cleanly
            return Decision::Cancel;
        }
        reply_rx.recv().unwrap_or(Decision::Cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_through_channel() {
        let (client, host) = bridge();

        let worker = std::thread::spawn(move || {
            client.resolve(&ErrorContext {
                kind: ItemErrorKind::AlreadyExists,
                source: PathBuf::from("a.txt"),
                target: Some(PathBuf::from("b.txt")),
                message: "target exists".into(),
            })
        });

        let request = host.recv().expect("request should arrive");
        assert_eq!(request.context.kind, ItemErrorKind::AlreadyExists);
        request.respond(Decision::Overwrite);

        assert_eq!(worker.join().unwrap(), Decision::Overwrite);
    }

    #[test]
    fn test_dropped_host_means_cancel() {
        let (client, host) = bridge();
        drop(host);
        let decision = client.resolve(&ErrorContext {
            kind: ItemErrorKind::NotFound,
            source: PathBuf::from("a.txt"),
            target: None,
            message: "gone".into(),
        });
        assert_eq!(decision, Decision::Cancel);
    }
}
