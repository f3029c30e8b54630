//! Restricted messaging between the application window and a bounce context
//!
//! A [`CrossContextChannel`] opens a popup or hidden frame and waits for the
//! one [`BounceMessage`] it is expected to send back. Only messages stamped
//! with the expected origin are acted upon; anything else is dropped without
//! settling the wait. Every exit path (reply, timeout, user close, or the
//! waiting future being dropped) deregisters the listener and closes the
//! context.

use std::{fmt, sync::Arc, time::Duration};

use thiserror::Error;
use url::Url;

use crate::Origin;

mod bus;
mod message;

pub use bus::{MessageBus, MessageEvent, MessageListener};
pub use message::{
    BounceFailure, BounceMessage, IssuedToken, INVALID_REQUEST, INVALID_STATE,
    TOKEN_EXCHANGE_FAILED,
};

/// How long to wait between checks for a context closed by the user
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// The kind of secondary browsing context to open
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContextKind {
    /// A visible popup window
    Popup,
    /// A hidden frame embedded in the opener
    Frame,
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContextKind::Popup => "popup",
            ContextKind::Frame => "frame",
        })
    }
}

/// A secondary browsing context owned by the window that opened it
pub trait BrowsingContext: Send + Sync {
    /// Whether the context has been closed, by the user or otherwise
    fn is_closed(&self) -> bool;

    /// Closes the popup or removes the frame
    fn close(&self);
}

/// Opens secondary browsing contexts
pub trait ContextOpener: Send + Sync {
    /// Opens a context of `kind` loading `url`
    ///
    /// Returns `None` if the context could not be opened, such as when a popup
    /// blocker intervenes.
    fn open(&self, url: &Url, kind: ContextKind) -> Option<Box<dyn BrowsingContext>>;
}

/// An error while waiting on a bounce context
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// The context could not be opened
    #[error("the {0} could not be opened; allow popups for this site and try again")]
    Blocked(ContextKind),
    /// No valid reply arrived in time
    #[error("timed out waiting for the {0} to respond")]
    Timeout(ContextKind),
    /// The user closed the context before it replied
    #[error("the {0} was closed before authentication completed")]
    UserCancelled(ContextKind),
    /// The context replied with an error
    #[error("the bounce reported an error: {0}")]
    Bounce(BounceFailure),
    /// The window's message bus went away
    #[error("the message channel was torn down")]
    Disconnected,
}

/// Opens bounce contexts and correlates their replies
#[derive(Clone)]
pub struct CrossContextChannel {
    bus: MessageBus,
    opener: Arc<dyn ContextOpener>,
    poll_interval: Duration,
}

impl CrossContextChannel {
    /// Constructs a channel receiving on `bus` and opening contexts with `opener`
    pub fn new(bus: MessageBus, opener: Arc<dyn ContextOpener>) -> Self {
        Self {
            bus,
            opener,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Sets how often to check whether the user closed the context
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// The message bus replies arrive on
    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// Opens a context of `kind` at `target` and starts listening for its reply
    ///
    /// The listener is registered before the context is opened so that an
    /// immediate reply cannot be missed.
    pub fn open(
        &self,
        target: &Url,
        expected_origin: Origin,
        kind: ContextKind,
    ) -> Result<ChannelHandle, ChannelError> {
        let listener = self.bus.listen();

        let context = match self.opener.open(target, kind) {
            Some(context) => context,
            None => {
                tracing::warn!(%kind, "unable to open bounce context");
                return Err(ChannelError::Blocked(kind));
            }
        };

        tracing::debug!(%kind, target = %target, "opened bounce context");

        Ok(ChannelHandle {
            listener,
            context,
            expected_origin,
            kind,
            poll_interval: self.poll_interval,
        })
    }
}

impl fmt::Debug for CrossContextChannel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CrossContextChannel")
            .field("bus", &self.bus)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

/// An open bounce context and its registered listener
///
/// Dropping the handle closes the context and deregisters the listener.
pub struct ChannelHandle {
    listener: MessageListener,
    context: Box<dyn BrowsingContext>,
    expected_origin: Origin,
    kind: ContextKind,
    poll_interval: Duration,
}

impl ChannelHandle {
    /// The kind of context behind this handle
    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    /// Waits up to `timeout` for the context to reply
    ///
    /// The context is closed and the listener deregistered however the wait
    /// ends.
    pub async fn await_message(mut self, timeout: Duration) -> Result<IssuedToken, ChannelError> {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                biased;

                event = self.listener.recv() => match event {
                    Some(event) => {
                        if let Some(result) = self.accept(event) {
                            break result;
                        }
                    }
                    None => break Err(ChannelError::Disconnected),
                },
                _ = &mut deadline => break Err(ChannelError::Timeout(self.kind)),
                _ = poll.tick() => {
                    if self.context.is_closed() {
                        break self
                            .drain_delivered()
                            .unwrap_or(Err(ChannelError::UserCancelled(self.kind)));
                    }
                }
            }
        };

        match &result {
            Ok(_) => tracing::debug!(kind = %self.kind, "bounce context delivered a token"),
            Err(error) => tracing::debug!(kind = %self.kind, %error, "bounce context failed"),
        }

        result
    }

    /// Closes the context and deregisters the listener
    pub fn close(self) {}

    /// Settles on a reply the context posted just before it closed
    fn drain_delivered(&mut self) -> Option<Result<IssuedToken, ChannelError>> {
        while let Some(event) = self.listener.try_recv() {
            if let Some(result) = self.accept(event) {
                return Some(result);
            }
        }
        None
    }

    fn accept(&self, event: MessageEvent) -> Option<Result<IssuedToken, ChannelError>> {
        if event.origin != self.expected_origin {
            tracing::warn!(
                expected = %self.expected_origin,
                actual = %event.origin,
                "dropping message from unexpected origin"
            );
            return None;
        }

        match serde_json::from_value(event.data) {
            Ok(BounceMessage::Success(issued)) => Some(Ok(issued)),
            Ok(BounceMessage::Error(failure)) => Some(Err(ChannelError::Bounce(failure))),
            Err(_) => {
                tracing::trace!("ignoring message that is not a bounce reply");
                None
            }
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        if !self.context.is_closed() {
            self.context.close();
        }
        tracing::trace!(kind = %self.kind, "released bounce context");
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("expected_origin", &self.expected_origin)
            .field("kind", &self.kind)
            .field("closed", &self.context.is_closed())
            .finish()
    }
}
