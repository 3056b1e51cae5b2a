//! Outbound text pipeline: word replacement, pattern extraction, translation.
//!
//! Stages run in that order. User-supplied regexes that fail to compile are
//! logged and skipped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use regex::{NoExpand, Regex};
use tracing::{debug, warn};

use crate::platform::Translator;
use crate::rules::model::{CaptureGroup, Forwarder, ReplaceMode};

/// Symbols that bind to the adjacent word in boundary mode.
const BOUND_SYMBOLS: [char; 3] = ['@', '#', '$'];

/// Stands in for a leading hashtag while the text is translated.
const HASHTAG_SENTINEL: &str = "[[0]]";

/// Destination length limit, in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextLimit {
    Caption,
    Text,
}

impl TextLimit {
    pub fn chars(self) -> usize {
        match self {
            Self::Caption => 1024,
            Self::Text => 4096,
        }
    }
}

pub struct ContentTransformer {
    translator: Option<Arc<dyn Translator>>,
    cache: Mutex<HashMap<String, Option<Regex>>>,
}

impl ContentTransformer {
    pub fn new(translator: Option<Arc<dyn Translator>>) -> Self {
        Self {
            translator,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Run the full pipeline. Missing text becomes the empty string.
    pub async fn transform(&self, f: &Forwarder, text: Option<&str>, limit: TextLimit) -> String {
        let Some(text) = text else {
            return String::new();
        };
        let replaced = self.replace(f, text);
        let extracted = self.extract(f, &replaced);
        self.translate(f, &extracted, limit).await
    }

    /// Apply the forwarder's replacements in declaration order.
    pub fn replace(&self, f: &Forwarder, text: &str) -> String {
        let mut out = text.to_string();
        for (word, replacement) in f.replace_words.iter() {
            if word.is_empty() {
                continue;
            }
            out = match f.replace_words_mode {
                ReplaceMode::WordBoundaryMatch => match self.compiled(&boundary_pattern(word)) {
                    Some(re) => re.replace_all(&out, NoExpand(replacement)).into_owned(),
                    None => out,
                },
                ReplaceMode::Global => match self.compiled(&format!("(?i){word}")) {
                    Some(re) => re.replace_all(&out, replacement).into_owned(),
                    None => out,
                },
            };
        }
        out
    }

    /// Replace the text with the selected group of the first matching pattern.
    pub fn extract(&self, f: &Forwarder, text: &str) -> String {
        for pattern in &f.patterns.0 {
            let Some(re) = self.compiled(&format!("(?s){}", pattern.regex)) else {
                continue;
            };
            let Some(caps) = re.captures(text) else {
                continue;
            };

            debug!(pattern = %pattern.regex, "Extraction pattern matched");
            let group = match &pattern.group {
                CaptureGroup::Index(i) => caps.get(*i),
                CaptureGroup::Name(name) => caps.name(name),
            };
            return group.map(|m| m.as_str().to_string()).unwrap_or_default();
        }
        text.to_string()
    }

    /// Translate when enabled, keeping a leading hashtag verbatim.
    ///
    /// Falls back to `text` when translation is off, the service fails, or the
    /// result would exceed `limit`.
    pub async fn translate(&self, f: &Forwarder, text: &str, limit: TextLimit) -> String {
        if !f.translate || text.trim().is_empty() {
            return text.to_string();
        }
        let Some(translator) = &self.translator else {
            return text.to_string();
        };

        let (hashtag, masked) = mask_hashtag(text);
        let translated = match translator
            .translate(&masked, &f.translate_to, &f.translate_from)
            .await
        {
            Ok(t) => t,
            Err(e) => {
                warn!(target_chat = f.target, error = %e, "Translation failed, sending original");
                return text.to_string();
            }
        };
        let translated = match hashtag {
            Some(tag) => restore_hashtag(&translated, tag),
            None => translated,
        };

        let result = if f.translate_show_original {
            format!(
                "{} {}\n\n{} {}",
                f.translate_original_prefix, text, f.translate_translation_prefix, translated
            )
        } else {
            translated
        };

        if result.chars().count() > limit.chars() {
            debug!(
                target_chat = f.target,
                limit = limit.chars(),
                "Translation exceeds limit, sending original"
            );
            return text.to_string();
        }
        result
    }

    fn compiled(&self, pattern: &str) -> Option<Regex> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache
            .entry(pattern.to_string())
            .or_insert_with(|| match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern, error = %e, "Skipping invalid regex");
                    None
                }
            })
            .clone()
    }
}

/// Case-insensitive whole-word pattern for a literal key.
fn boundary_pattern(word: &str) -> String {
    let mut chars = word.chars();
    let first = chars.next();
    let last = word.chars().next_back();

    if word.chars().count() > 1 {
        if let Some(sym) = first.filter(|c| BOUND_SYMBOLS.contains(c)) {
            let rest = &word[sym.len_utf8()..];
            return format!(r"(?i){}\b{}\b", regex::escape(&sym.to_string()), regex::escape(rest));
        }
        if let Some(sym) = last.filter(|c| BOUND_SYMBOLS.contains(c)) {
            let rest = &word[..word.len() - sym.len_utf8()];
            return format!(r"(?i)\b{}{}", regex::escape(rest), regex::escape(&sym.to_string()));
        }
    }
    format!(r"(?i)\b{}\b", regex::escape(word))
}

/// Split off a leading `#tag` token, replacing it with the sentinel.
fn mask_hashtag(text: &str) -> (Option<&str>, String) {
    let trimmed = text.trim_start();
    if !trimmed.starts_with('#') {
        return (None, text.to_string());
    }
    let end = trimmed
        .char_indices()
        .skip(1)
        .find(|(_, c)| !(c.is_alphanumeric() || *c == '_'))
        .map(|(i, _)| i)
        .unwrap_or(trimmed.len());
    if end == 1 {
        return (None, text.to_string());
    }
    // Leading whitespace travels with the tag.
    let lead = text.len() - trimmed.len();
    let tag = &text[..lead + end];
    (Some(tag), format!("{HASHTAG_SENTINEL}{}", &trimmed[end..]))
}

/// Put the hashtag back; prepend it when the service mangled the sentinel.
fn restore_hashtag(translated: &str, tag: &str) -> String {
    if translated.contains(HASHTAG_SENTINEL) {
        translated.replacen(HASHTAG_SENTINEL, tag, 1)
    } else {
        format!("{tag} {}", translated.trim_start())
    }
}
