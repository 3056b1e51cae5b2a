//! Admin input handling for forwarder registration.
//!
//! Admins type chats one per line as numeric ids, `@usernames`, or links to
//! a message in the chat (`https://t.me/c/<id>/<msg>` for private chats,
//! `https://t.me/<username>/<msg>` for public ones). Each line is resolved
//! through the platform; lines that fail land in an invalid list instead of
//! aborting the whole batch.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{info, warn};

use crate::error::{PlatformError, RuleError};
use crate::platform::{ChatId, PlatformClient};
use crate::rules::model::Forwarder;
use crate::rules::store::RuleStore;

static PRIVATE_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https://t\.me/c/(\d+)/\d+").expect("valid regex"));

static PUBLIC_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https://t\.me/(\w+)/\d+").expect("valid regex"));

static USERNAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@?([A-Za-z]\w*)$").expect("valid regex"));

/// A chat reference as typed by an admin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatReference {
    Id(ChatId),
    Username(String),
}

impl ChatReference {
    /// Form accepted by `PlatformClient::resolve_chat`.
    pub fn query(&self) -> String {
        match self {
            Self::Id(id) => id.to_string(),
            Self::Username(name) => format!("@{name}"),
        }
    }
}

/// Parse one line of admin input.
pub fn parse_reference(line: &str) -> Option<ChatReference> {
    let line = line.trim();

    if let Some(caps) = PRIVATE_LINK.captures(line) {
        return format!("-100{}", &caps[1])
            .parse()
            .ok()
            .map(ChatReference::Id);
    }
    if let Some(caps) = PUBLIC_LINK.captures(line) {
        return Some(ChatReference::Username(caps[1].to_string()));
    }
    if let Ok(id) = line.parse::<ChatId>() {
        return Some(ChatReference::Id(id));
    }
    USERNAME
        .captures(line)
        .map(|caps| ChatReference::Username(caps[1].to_string()))
}

/// Outcome of resolving a batch of chat references.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    /// Chat id → display name.
    pub chats: BTreeMap<ChatId, String>,
    /// Lines that could not be parsed or resolved.
    pub invalid: Vec<String>,
}

/// Resolve newline-separated chat references.
pub async fn resolve_chats(platform: &dyn PlatformClient, input: &str) -> Resolution {
    let mut resolution = Resolution::default();

    for line in input.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some(reference) = parse_reference(line) else {
            resolution.invalid.push(line.to_string());
            continue;
        };

        match platform.resolve_chat(&reference.query()).await {
            Ok(chat) => {
                resolution.chats.insert(chat.id, chat.title);
            }
            Err(e) => {
                if !matches!(e, PlatformError::ChatNotFound(_)) {
                    warn!(reference = line, error = %e, "Chat lookup failed");
                }
                resolution.invalid.push(line.to_string());
            }
        }
    }

    resolution
}

/// Parse `word>replacement` lines. Only the first `>` splits.
pub fn parse_replacements(input: &str) -> Result<Vec<(String, String)>, RuleError> {
    input
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let (word, replacement) = line.split_once('>').ok_or_else(|| {
                RuleError::InvalidInput(format!("expected `word>replacement`, got {line:?}"))
            })?;
            if word.is_empty() {
                return Err(RuleError::InvalidInput(format!("empty word in {line:?}")));
            }
            Ok((word.to_string(), replacement.to_string()))
        })
        .collect()
}

/// A newly registered forwarder and the source lines that were skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct Onboarded {
    pub forwarder: Forwarder,
    pub invalid_sources: Vec<String>,
}

/// Register a forwarder from a target reference and newline-separated sources.
///
/// The forwarder is named after the target chat and gets the default settings.
pub async fn onboard(
    store: &RuleStore,
    platform: &dyn PlatformClient,
    target_input: &str,
    sources_input: &str,
) -> Result<Onboarded, RuleError> {
    let target = resolve_chats(platform, target_input).await;
    let Some((&target_id, target_name)) = target.chats.iter().next() else {
        return Err(RuleError::InvalidInput("the target chat is invalid".into()));
    };

    if store.get(target_id).await.is_ok() {
        return Err(RuleError::DuplicateTarget { target: target_id });
    }

    let mut sources = resolve_chats(platform, sources_input).await;
    sources.chats.remove(&target_id);
    if sources.chats.is_empty() {
        return Err(RuleError::InvalidInput("no valid source chats".into()));
    }

    let forwarder = Forwarder::new(target_name.clone(), target_id, sources.chats);
    store.create(forwarder.clone()).await?;

    info!(
        target_chat = target_id,
        name = %forwarder.name,
        sources = forwarder.source.len(),
        invalid = sources.invalid.len(),
        "Forwarder registered"
    );

    Ok(Onboarded {
        forwarder,
        invalid_sources: sources.invalid,
    })
}
