//! Forwarder matching.
//!
//! Decides which forwarders receive an inbound message:
//! - the message's chat must be one of the forwarder's sources
//! - the forwarder must be enabled
//! - the direction gate (`incoming` / `outgoing`) must permit the message
//! - no blocked word may appear in the text or caption
//!
//! A direction-gate denial is reported separately so the caller can record a
//! pass-through marker for that target.

use tracing::debug;

use crate::platform::{ChatId, Message};
use crate::rules::model::{Forwarder, RuleFile};

/// Result of matching one message (or one media group) against the registry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchOutcome {
    /// Forwarders that receive the message, in registry order.
    pub relay: Vec<Forwarder>,
    /// Targets whose direction gate denied the message.
    pub suppressed: Vec<ChatId>,
}

impl MatchOutcome {
    pub fn is_empty(&self) -> bool {
        self.relay.is_empty() && self.suppressed.is_empty()
    }
}

/// Matches messages against a rule snapshot.
pub struct RuleEngine<'a> {
    rules: &'a RuleFile,
}

impl<'a> RuleEngine<'a> {
    pub fn new(rules: &'a RuleFile) -> Self {
        Self { rules }
    }

    /// Match a single message.
    pub fn evaluate(&self, msg: &Message) -> MatchOutcome {
        let texts: Vec<&str> = msg.content.text_or_caption().into_iter().collect();
        match_forwarders(&self.rules.forwarders, msg.chat.id, msg.outgoing, &texts)
    }

    /// Match a media group. Every item's caption counts for the blocked-word gate.
    pub fn evaluate_group(&self, items: &[Message]) -> MatchOutcome {
        let Some(first) = items.first() else {
            return MatchOutcome::default();
        };
        let texts: Vec<&str> = items
            .iter()
            .filter_map(|m| m.content.text_or_caption())
            .collect();
        match_forwarders(&self.rules.forwarders, first.chat.id, first.outgoing, &texts)
    }
}

/// Case-insensitive substring test of every blocked word against every text.
fn blocked_word<'f>(forwarder: &'f Forwarder, texts: &[&str]) -> Option<&'f str> {
    let lowered: Vec<String> = texts.iter().map(|t| t.to_lowercase()).collect();
    forwarder
        .blocked_words
        .iter()
        .filter(|w| !w.is_empty())
        .find(|w| {
            let needle = w.to_lowercase();
            lowered.iter().any(|t| t.contains(&needle))
        })
        .map(String::as_str)
}

/// Core matching over an explicit forwarder list.
pub fn match_forwarders(
    forwarders: &[Forwarder],
    source: ChatId,
    outgoing: bool,
    texts: &[&str],
) -> MatchOutcome {
    let mut outcome = MatchOutcome::default();

    for forwarder in forwarders {
        if !forwarder.has_source(source) || !forwarder.enabled {
            continue;
        }

        if !forwarder.permits(outgoing) {
            debug!(
                target_chat = forwarder.target,
                source_chat = source,
                outgoing,
                "Direction gate denied relay"
            );
            outcome.suppressed.push(forwarder.target);
            continue;
        }

        if let Some(word) = blocked_word(forwarder, texts) {
            debug!(
                target_chat = forwarder.target,
                source_chat = source,
                word,
                "Blocked word matched"
            );
            continue;
        }

        outcome.relay.push(forwarder.clone());
    }

    outcome
}
