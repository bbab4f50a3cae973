//! Tag → handler table for inbound messages.
//!
//! Handlers are registered while the rank is assembled and looked up by
//! indexing with the tag on every dispatch. Messages whose tag has no handler
//! are left for other consumers of the inbox, such as the virtual
//! communicator's reply demultiplexer.

use crate::error::CommResult;
use crate::message::{Mailbox, Message};
use crate::types::{MessageTag, MessageUnit};

/// Consumer of inbound messages of one tag.
pub trait MessageHandler {
    /// Handle `message` whose payload is `units`; replies go to `outbox`.
    fn handle(
        &mut self,
        message: &Message,
        units: &[MessageUnit],
        outbox: &mut Mailbox,
    ) -> CommResult<()>;
}

impl<F> MessageHandler for F
where
    F: FnMut(&Message, &[MessageUnit], &mut Mailbox) -> CommResult<()>,
{
    fn handle(
        &mut self,
        message: &Message,
        units: &[MessageUnit],
        outbox: &mut Mailbox,
    ) -> CommResult<()> {
        self(message, units, outbox)
    }
}

/// Handlers indexed by tag.
#[derive(Default)]
pub struct HandlerMap {
    handlers: Vec<Option<Box<dyn MessageHandler>>>,
    dispatched: u64,
}

impl std::fmt::Debug for HandlerMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerMap")
            .field("registered", &self.len())
            .field("dispatched", &self.dispatched)
            .finish()
    }
}

impl HandlerMap {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `tag`, returning the handler it replaces.
    pub fn register(
        &mut self,
        tag: MessageTag,
        handler: impl MessageHandler + 'static,
    ) -> Option<Box<dyn MessageHandler>> {
        let index = tag as usize;
        if index >= self.handlers.len() {
            self.handlers.resize_with(index + 1, || None);
        }
        self.handlers[index].replace(Box::new(handler))
    }

    /// Whether `tag` has a handler.
    pub fn contains(&self, tag: MessageTag) -> bool {
        matches!(self.handlers.get(tag as usize), Some(Some(_)))
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.iter().filter(|h| h.is_some()).count()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages handed to a handler so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    /// Run the handler of every inbox message that has one, in inbox order.
    ///
    /// Returns the number of messages handled.
    pub fn dispatch(&mut self, inbox: &Mailbox, outbox: &mut Mailbox) -> CommResult<usize> {
        let mut handled = 0;
        for message in inbox.messages() {
            let Some(Some(handler)) = self.handlers.get_mut(message.tag() as usize) else {
                continue;
            };
            handler.handle(message, inbox.units(message)?, outbox)?;
            handled += 1;
        }
        self.dispatched += handled as u64;
        Ok(handled)
    }
}
