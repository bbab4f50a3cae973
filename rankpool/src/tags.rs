//! Message tags allocated by symbol at startup.
//!
//! Components ask for the tags they need by name while the rank is being
//! assembled; the resulting numbers are stable for the process lifetime and
//! the names are kept for reporting.

use std::collections::HashMap;

use crate::error::{CommError, CommResult};
use crate::types::MessageTag;

/// Suffix given to the symbol of a reply tag.
pub const REPLY_SUFFIX: &str = "_REPLY";

/// Bidirectional symbol ↔ tag table.
#[derive(Debug, Default, Clone)]
pub struct TagRegistry {
    symbols: Vec<String>,
    by_symbol: HashMap<String, MessageTag>,
}

impl TagRegistry {
    /// Empty registry; the first allocated tag is 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next tag for `symbol`.
    ///
    /// # Errors
    ///
    /// [`CommError::DuplicateTagSymbol`] if `symbol` already has a tag,
    /// [`CommError::TagSpaceExhausted`] once every tag value is taken.
    pub fn allocate(&mut self, symbol: &str) -> CommResult<MessageTag> {
        if self.by_symbol.contains_key(symbol) {
            return Err(CommError::DuplicateTagSymbol(symbol.to_string()));
        }
        let tag = MessageTag::try_from(self.symbols.len())
            .map_err(|_| CommError::TagSpaceExhausted)?;
        self.symbols.push(symbol.to_string());
        self.by_symbol.insert(symbol.to_string(), tag);
        tracing::debug!("tag {} allocated for {}", tag, symbol);
        Ok(tag)
    }

    /// Allocate a request tag for `symbol` and its reply tag `symbol_REPLY`.
    pub fn allocate_with_reply(&mut self, symbol: &str) -> CommResult<(MessageTag, MessageTag)> {
        let request = self.allocate(symbol)?;
        let reply = self.allocate(&format!("{symbol}{REPLY_SUFFIX}"))?;
        Ok((request, reply))
    }

    /// Tag allocated for `symbol`.
    pub fn resolve(&self, symbol: &str) -> Option<MessageTag> {
        self.by_symbol.get(symbol).copied()
    }

    /// Symbol of `tag`.
    pub fn symbol(&self, tag: MessageTag) -> Option<&str> {
        self.symbols.get(tag as usize).map(String::as_str)
    }

    /// Number of allocated tags.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Whether no tag was allocated.
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}
