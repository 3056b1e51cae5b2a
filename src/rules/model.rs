//! Forwarder configuration as persisted in the rule file.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::platform::ChatId;

/// Top-level layout of `forwarding.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleFile {
    #[serde(default)]
    pub forwarders: Vec<Forwarder>,
    /// Local image files; photos that match one are never relayed.
    #[serde(default)]
    pub blocked_images: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardingMode {
    /// Re-send the content as a new message.
    #[default]
    Copy,
    /// Use the platform's native forward.
    Forward,
}

impl ForwardingMode {
    pub fn toggled(self) -> Self {
        match self {
            Self::Copy => Self::Forward,
            Self::Forward => Self::Copy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceMode {
    /// Keys are literal words matched on word boundaries.
    #[default]
    WordBoundaryMatch,
    /// Keys are raw regexes matched anywhere.
    Global,
}

fn default_translate_to() -> String {
    "en".into()
}

fn default_translate_from() -> String {
    "auto".into()
}

fn default_original_prefix() -> String {
    "Original:".into()
}

fn default_translation_prefix() -> String {
    "Translated:".into()
}

/// Ordered word → replacement pairs. Persisted as a JSON object whose key
/// order is the application order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplaceWords(pub Vec<(String, String)>);

impl ReplaceWords {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Insert or replace, keeping the original position of an existing key.
    pub fn insert(&mut self, word: String, replacement: String) {
        match self.0.iter_mut().find(|(k, _)| *k == word) {
            Some(entry) => entry.1 = replacement,
            None => self.0.push((word, replacement)),
        }
    }

    pub fn remove(&mut self, word: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|(k, _)| k != word);
        self.0.len() != before
    }
}

impl Serialize for ReplaceWords {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ReplaceWords {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedPairs;

        impl<'de> Visitor<'de> for OrderedPairs {
            type Value = ReplaceWords;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of word to replacement")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut words = ReplaceWords::default();
                while let Some((k, v)) = access.next_entry::<String, String>()? {
                    words.insert(k, v);
                }
                Ok(words)
            }
        }

        deserializer.deserialize_map(OrderedPairs)
    }
}

/// Capture group selector: numeric index or group name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CaptureGroup {
    Index(usize),
    Name(String),
}

impl Default for CaptureGroup {
    fn default() -> Self {
        Self::Index(0)
    }
}

/// One extraction rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractPattern {
    pub regex: String,
    #[serde(default)]
    pub group: CaptureGroup,
}

/// Ordered extraction rules. Also accepts the older `{ regex: group }` object form.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Patterns(pub Vec<ExtractPattern>);

impl<'de> Deserialize<'de> for Patterns {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PatternsVisitor;

        impl<'de> Visitor<'de> for PatternsVisitor {
            type Value = Patterns;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a list of patterns or a map of regex to group")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut patterns = Vec::new();
                while let Some(p) = seq.next_element::<ExtractPattern>()? {
                    patterns.push(p);
                }
                Ok(Patterns(patterns))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut patterns = Vec::new();
                while let Some((regex, group)) = access.next_entry::<String, CaptureGroup>()? {
                    patterns.push(ExtractPattern { regex, group });
                }
                Ok(Patterns(patterns))
            }
        }

        deserializer.deserialize_any(PatternsVisitor)
    }
}

/// A destination chat with its sources and transform settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forwarder {
    pub name: String,
    pub target: ChatId,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub forwarding_mode: ForwardingMode,
    #[serde(default = "default_true")]
    pub incoming: bool,
    #[serde(default = "default_true")]
    pub outgoing: bool,
    #[serde(default = "default_true")]
    pub reply: bool,
    /// When false, text identical to the target's last message is skipped.
    #[serde(default)]
    pub duplicated_text: bool,
    #[serde(default)]
    pub send_text_only: bool,
    /// Translate outbound text.
    #[serde(default)]
    pub translate: bool,
    #[serde(default = "default_translate_to")]
    pub translate_to: String,
    #[serde(default = "default_translate_from")]
    pub translate_from: String,
    /// Prepend the original text to the translation.
    #[serde(default)]
    pub translate_show_original: bool,
    #[serde(default = "default_original_prefix")]
    pub translate_original_prefix: String,
    #[serde(default = "default_translation_prefix")]
    pub translate_translation_prefix: String,
    #[serde(default)]
    pub replace_words_mode: ReplaceMode,
    #[serde(default)]
    pub replace_words: ReplaceWords,
    #[serde(default)]
    pub blocked_words: Vec<String>,
    /// Source chat id → display name.
    #[serde(default)]
    pub source: BTreeMap<ChatId, String>,
    #[serde(default)]
    pub patterns: Patterns,
}

fn default_true() -> bool {
    true
}

impl Forwarder {
    /// A forwarder with onboarding defaults.
    pub fn new(name: impl Into<String>, target: ChatId, source: BTreeMap<ChatId, String>) -> Self {
        Self {
            name: name.into(),
            target,
            enabled: true,
            forwarding_mode: ForwardingMode::Copy,
            incoming: true,
            outgoing: true,
            reply: true,
            duplicated_text: false,
            send_text_only: false,
            translate: false,
            translate_to: default_translate_to(),
            translate_from: default_translate_from(),
            translate_show_original: false,
            translate_original_prefix: default_original_prefix(),
            translate_translation_prefix: default_translation_prefix(),
            replace_words_mode: ReplaceMode::WordBoundaryMatch,
            replace_words: ReplaceWords::default(),
            blocked_words: Vec::new(),
            source,
            patterns: Patterns::default(),
        }
    }

    pub fn has_source(&self, chat: ChatId) -> bool {
        self.source.contains_key(&chat)
    }

    /// Whether the direction gate lets an event through.
    pub fn permits(&self, outgoing: bool) -> bool {
        if outgoing { self.outgoing } else { self.incoming }
    }
}
