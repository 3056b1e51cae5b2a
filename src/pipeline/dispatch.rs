//! Dispatch state machine.
//!
//! Each inbound event is classified into one terminal state, matched against
//! the rule snapshot, and relayed to every matching forwarder. The
//! correlation store is updated after every successful send so later edits,
//! replies, pins and deletes can find the copies.
//!
//! A relayed message is itself a new message in the target chat. When that
//! chat is a source of another forwarder, the copy is dispatched again. The
//! chain of chats already visited stops relay loops.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::correlation::{Correlation, CorrelationKey, CorrelationStore};
use crate::error::{DatabaseError, PlatformError};
use crate::pipeline::gate::MediaGroupGate;
use crate::pipeline::transform::{ContentTransformer, TextLimit};
use crate::platform::{
    Chat, ChatId, Content, DownloadedMedia, FileKind, ImageComparator, InboundEvent, MediaSource,
    Message, MessageId, PlatformClient, Poll, PollKind, Translator,
};
use crate::rules::engine::{MatchOutcome, RuleEngine, match_forwarders};
use crate::rules::model::{Forwarder, ForwardingMode};
use crate::rules::store::RuleStore;

/// Terminal dispatch states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    New,
    Edited,
    Reply,
    Pinned,
    MediaGroupNew,
    MediaGroupEdited,
    MediaGroupReply,
    Deleted,
}

impl DispatchState {
    pub fn classify(event: &InboundEvent) -> Self {
        match event {
            InboundEvent::New(msg) => match (msg.media_group_id.is_some(), msg.reply_to.is_some()) {
                (true, true) => Self::MediaGroupReply,
                (true, false) => Self::MediaGroupNew,
                (false, true) => Self::Reply,
                (false, false) => Self::New,
            },
            InboundEvent::Edited(msg) if msg.media_group_id.is_some() => Self::MediaGroupEdited,
            InboundEvent::Edited(_) => Self::Edited,
            InboundEvent::Pinned { .. } => Self::Pinned,
            InboundEvent::Deleted { .. } => Self::Deleted,
        }
    }

    /// States that create new messages in the target.
    pub fn creates(self) -> bool {
        matches!(
            self,
            Self::New | Self::Reply | Self::MediaGroupNew | Self::MediaGroupReply
        )
    }
}

/// Why a forwarder (or the whole event) was not relayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The direction gate denied the event; a pass-through marker was recorded.
    DirectionGate,
    /// The anchor message (edit, reply or pin) was never relayed to the target.
    NotCorrelated,
    /// The anchor message was deliberately not relayed to the target.
    Suppressed,
    /// Text equals the target's most recent message.
    Duplicate,
    /// The edit would not change the destination message.
    NotModified,
    /// The destination message no longer exists.
    MessageGone,
    /// Another event of the same media group is handling it.
    AlreadyClaimed,
    BlockedImage,
    /// The source chat forbids forwarding.
    ProtectedContent,
    /// The target refused the poll.
    PollRefused,
    /// Nothing left to send after transformation.
    EmptyText,
    /// The target already appears earlier in this relay chain.
    Cycle,
    Unsupported(String),
}

/// Observable result of one dispatch decision.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Sent { target: ChatId, ids: Vec<MessageId> },
    Edited { target: ChatId, ids: Vec<MessageId> },
    Pinned { target: ChatId, id: MessageId },
    Deleted { count: usize },
    Skipped { target: Option<ChatId>, reason: SkipReason },
    Failed { target: Option<ChatId>, error: String },
}

/// Tunables for the orchestrator.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub max_retries: u32,
    pub blocked_image_threshold: f64,
    pub media_group_ttl: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            blocked_image_threshold: 0.95,
            media_group_ttl: Duration::from_secs(60),
        }
    }
}

impl From<&RelayConfig> for DispatchConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            blocked_image_threshold: config.blocked_image_threshold,
            media_group_ttl: config.media_group_ttl,
        }
    }
}

/// A unit of work for one chat in the relay chain.
enum Work {
    Messages {
        state: DispatchState,
        items: Vec<Message>,
    },
    Pin {
        chat: Chat,
        pinned_id: MessageId,
        outgoing: bool,
    },
}

/// Successful relay to one forwarder.
struct Delivered {
    outcome: DispatchOutcome,
    /// The copy as seen from the target chat, for chained relays.
    echo: Option<Work>,
}

/// Early exit from a per-forwarder relay.
#[derive(Debug)]
enum Halt {
    Skip(SkipReason),
    Fail(String),
}

impl From<PlatformError> for Halt {
    fn from(e: PlatformError) -> Self {
        match e {
            PlatformError::MessageNotModified => Self::Skip(SkipReason::NotModified),
            PlatformError::MessageIdInvalid => Self::Skip(SkipReason::MessageGone),
            PlatformError::Unsupported(what) => Self::Skip(SkipReason::Unsupported(what)),
            other => Self::Fail(other.to_string()),
        }
    }
}

impl From<DatabaseError> for Halt {
    fn from(e: DatabaseError) -> Self {
        Self::Fail(e.to_string())
    }
}

impl Halt {
    fn report(self, target: Option<ChatId>) -> DispatchOutcome {
        match self {
            Self::Skip(reason) => {
                info!(target_chat = ?target, reason = ?reason, "Relay skipped");
                DispatchOutcome::Skipped { target, reason }
            }
            Self::Fail(error) => {
                error!(target_chat = ?target, error = %error, "Relay failed");
                DispatchOutcome::Failed { target, error }
            }
        }
    }
}

pub struct DispatchOrchestrator {
    platform: Arc<dyn PlatformClient>,
    correlations: Arc<dyn CorrelationStore>,
    rules: Arc<RuleStore>,
    transformer: ContentTransformer,
    gate: MediaGroupGate,
    comparator: Option<Arc<dyn ImageComparator>>,
    config: DispatchConfig,
}

impl DispatchOrchestrator {
    pub fn new(
        platform: Arc<dyn PlatformClient>,
        correlations: Arc<dyn CorrelationStore>,
        rules: Arc<RuleStore>,
        translator: Option<Arc<dyn Translator>>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            platform,
            correlations,
            rules,
            transformer: ContentTransformer::new(translator),
            gate: MediaGroupGate::new(config.media_group_ttl),
            comparator: None,
            config,
        }
    }

    pub fn with_image_comparator(mut self, comparator: Arc<dyn ImageComparator>) -> Self {
        self.comparator = Some(comparator);
        self
    }

    pub fn rules(&self) -> &RuleStore {
        &self.rules
    }

    /// Drop expired media-group claims.
    pub fn prune_media_groups(&self) -> usize {
        self.gate.prune()
    }

    /// Handle one inbound event to completion. Never panics on platform or
    /// store failures; every decision comes back as an outcome.
    pub async fn handle(&self, event: InboundEvent) -> Vec<DispatchOutcome> {
        let state = DispatchState::classify(&event);
        debug!(?state, source_chat = ?event.source_chat(), "Dispatching event");

        match event {
            InboundEvent::Deleted { chat, message_ids } => {
                vec![self.propagate_delete(chat, &message_ids).await]
            }
            InboundEvent::Pinned {
                chat,
                pinned_id,
                outgoing,
            } => {
                let chain = vec![chat.id];
                self.dispatch(
                    Work::Pin {
                        chat,
                        pinned_id,
                        outgoing,
                    },
                    chain,
                )
                .await
            }
            InboundEvent::New(msg) | InboundEvent::Edited(msg) => {
                let chain = vec![msg.chat.id];
                if state == DispatchState::MediaGroupEdited {
                    return self
                        .dispatch(
                            Work::Messages {
                                state,
                                items: vec![msg],
                            },
                            chain,
                        )
                        .await;
                }

                let items = match self.collect_group(&msg).await {
                    Ok(Some(items)) => items,
                    Ok(None) => {
                        return vec![DispatchOutcome::Skipped {
                            target: None,
                            reason: SkipReason::AlreadyClaimed,
                        }];
                    }
                    Err(halt) => return vec![halt.report(None)],
                };
                self.dispatch(Work::Messages { state, items }, chain).await
            }
        }
    }

    /// The whole media group for the first event of a burst, `None` for the rest.
    async fn collect_group(&self, msg: &Message) -> Result<Option<Vec<Message>>, Halt> {
        let Some(group_id) = &msg.media_group_id else {
            return Ok(Some(vec![msg.clone()]));
        };
        if !self.gate.claim_first(msg.chat.id, group_id) {
            return Ok(None);
        }

        let mut items = self
            .with_retry("get_grouped_items", || {
                self.platform.get_grouped_items(msg.chat.id, msg.id)
            })
            .await?;
        if items.is_empty() {
            items.push(msg.clone());
        }
        debug!(source_chat = msg.chat.id, group_id, items = items.len(), "Media group collected");
        Ok(Some(items))
    }

    fn dispatch(&self, work: Work, chain: Vec<ChatId>) -> BoxFuture<'_, Vec<DispatchOutcome>> {
        async move {
            let rules = self.rules.snapshot().await;

            let (matched, origins): (MatchOutcome, Vec<MessageId>) = match &work {
                Work::Pin { chat, outgoing, .. } => {
                    (match_forwarders(&rules.forwarders, chat.id, *outgoing, &[]), Vec::new())
                }
                Work::Messages { state, items } => {
                    let Some(first) = items.first() else {
                        return Vec::new();
                    };
                    let engine = RuleEngine::new(&rules);
                    let matched = if items.len() > 1 {
                        engine.evaluate_group(items)
                    } else {
                        engine.evaluate(first)
                    };
                    let origins = if state.creates() {
                        items.iter().map(|m| m.id).collect()
                    } else {
                        Vec::new()
                    };
                    (matched, origins)
                }
            };

            let mut results = Vec::new();
            let source = match &work {
                Work::Pin { chat, .. } => chat.id,
                Work::Messages { items, .. } => items[0].chat.id,
            };

            for &target in &matched.suppressed {
                for &origin in &origins {
                    let key = CorrelationKey::new(target, source, origin);
                    if let Err(e) = self.correlations.mark_suppressed(key).await {
                        warn!(target_chat = target, origin, error = %e, "Failed to record pass-through marker");
                    }
                }
                results.push(DispatchOutcome::Skipped {
                    target: Some(target),
                    reason: SkipReason::DirectionGate,
                });
            }
            if matched.relay.is_empty() {
                return results;
            }

            if let Work::Messages { state, items } = &work {
                if state.creates() && self.is_blocked_image(&rules.blocked_images, items).await {
                    results.push(DispatchOutcome::Skipped {
                        target: None,
                        reason: SkipReason::BlockedImage,
                    });
                    return results;
                }
            }

            let mut edited_group: Option<Option<Vec<Message>>> = None;
            let mut echoes = Vec::new();

            for f in &matched.relay {
                if chain.contains(&f.target) {
                    results.push(Halt::Skip(SkipReason::Cycle).report(Some(f.target)));
                    continue;
                }

                let delivered = match &work {
                    Work::Pin {
                        chat, pinned_id, ..
                    } => self.pin(f, chat, *pinned_id).await,
                    Work::Messages { state, items } => match state {
                        DispatchState::New | DispatchState::Reply => {
                            self.send_single(f, &items[0]).await
                        }
                        DispatchState::Edited => self.edit_single(f, &items[0]).await,
                        DispatchState::MediaGroupNew | DispatchState::MediaGroupReply => {
                            self.send_group(f, items).await
                        }
                        DispatchState::MediaGroupEdited => match f.forwarding_mode {
                            ForwardingMode::Copy => self.edit_single(f, &items[0]).await,
                            ForwardingMode::Forward => {
                                self.reforward_group(f, &items[0], &mut edited_group).await
                            }
                        },
                        DispatchState::Pinned | DispatchState::Deleted => Err(Halt::Skip(
                            SkipReason::Unsupported(format!("{state:?} carries no message")),
                        )),
                    },
                };

                match delivered {
                    Ok(delivered) => {
                        results.push(delivered.outcome);
                        if let Some(echo) = delivered.echo {
                            echoes.push((f.target, echo));
                        }
                    }
                    Err(halt) => results.push(halt.report(Some(f.target))),
                }
            }

            for (target, echo) in echoes {
                if !self.rules.is_source(target).await {
                    continue;
                }
                let mut next = chain.clone();
                next.push(target);
                results.extend(self.dispatch(echo, next).await);
            }

            results
        }
        .boxed()
    }

    // ── New messages ────────────────────────────────────────────────

    async fn send_single(&self, f: &Forwarder, msg: &Message) -> Result<Delivered, Halt> {
        if f.forwarding_mode == ForwardingMode::Forward {
            return self.forward_items(f, std::slice::from_ref(msg)).await;
        }

        let target = f.target;
        let source = msg.chat.id;
        let anchor = match msg.reply_to {
            Some(reply_id) if f.reply => Some(self.resolve(target, source, reply_id).await?),
            _ => None,
        };

        let (content, _guard) = match &msg.content {
            Content::Text { web_preview, .. } => {
                let text = self
                    .transformer
                    .transform(f, msg.content.text_or_caption(), TextLimit::Text)
                    .await;
                if text.trim().is_empty() {
                    return Err(Halt::Skip(SkipReason::EmptyText));
                }
                if anchor.is_none() && !f.duplicated_text && self.is_duplicate(target, &text).await {
                    return Err(Halt::Skip(SkipReason::Duplicate));
                }
                (
                    Content::Text {
                        text,
                        web_preview: *web_preview,
                    },
                    None,
                )
            }
            Content::File { caption, .. } if f.send_text_only => {
                let text = self
                    .transformer
                    .transform(f, caption.as_deref(), TextLimit::Text)
                    .await;
                if text.trim().is_empty() {
                    return Err(Halt::Skip(SkipReason::EmptyText));
                }
                (Content::text(text), None)
            }
            Content::File {
                kind,
                source: media,
                caption,
            } => {
                let caption = self
                    .transformer
                    .transform(f, caption.as_deref(), TextLimit::Caption)
                    .await;
                self.outbound_file(&msg.chat, *kind, media, caption).await?
            }
            Content::Poll(poll) => (Content::Poll(self.prepare_poll(msg, poll).await?), None),
            other => (other.clone(), None),
        };

        let id = match self
            .with_retry("send", || self.platform.send(target, &content, anchor))
            .await
        {
            Ok(id) => id,
            Err(e) if matches!(content, Content::Poll(_)) && !e.is_retryable() => {
                warn!(target_chat = target, error = %e, "Poll refused by target");
                return Err(Halt::Skip(SkipReason::PollRefused));
            }
            Err(e) => return Err(e.into()),
        };

        self.correlations
            .put(CorrelationKey::new(target, source, msg.id), id)
            .await?;
        info!(
            source_chat = source,
            target_chat = target,
            origin = msg.id,
            dest = id,
            "Message relayed"
        );

        let echo = echo_content(&content).map(|content| Work::Messages {
            state: if anchor.is_some() {
                DispatchState::Reply
            } else {
                DispatchState::New
            },
            items: vec![Message {
                id,
                chat: target_chat(f),
                content,
                outgoing: true,
                media_group_id: None,
                reply_to: anchor,
            }],
        });

        Ok(Delivered {
            outcome: DispatchOutcome::Sent {
                target,
                ids: vec![id],
            },
            echo,
        })
    }

    async fn send_group(&self, f: &Forwarder, items: &[Message]) -> Result<Delivered, Halt> {
        if f.forwarding_mode == ForwardingMode::Forward {
            return self.forward_items(f, items).await;
        }

        let target = f.target;
        let source = items[0].chat.id;
        let anchor = match items.iter().find_map(|m| m.reply_to) {
            Some(reply_id) if f.reply => Some(self.resolve(target, source, reply_id).await?),
            _ => None,
        };

        if f.send_text_only {
            let Some(caption) = items
                .iter()
                .find_map(|m| m.content.text_or_caption().filter(|c| !c.trim().is_empty()))
            else {
                return Err(Halt::Skip(SkipReason::EmptyText));
            };
            let text = self
                .transformer
                .transform(f, Some(caption), TextLimit::Text)
                .await;
            if text.trim().is_empty() {
                return Err(Halt::Skip(SkipReason::EmptyText));
            }

            let content = Content::text(text);
            let id = self
                .with_retry("send", || self.platform.send(target, &content, anchor))
                .await?;
            self.correlations
                .put(CorrelationKey::new(target, source, items[0].id), id)
                .await?;
            info!(source_chat = source, target_chat = target, dest = id, "Media group relayed as text");

            return Ok(Delivered {
                outcome: DispatchOutcome::Sent {
                    target,
                    ids: vec![id],
                },
                echo: Some(Work::Messages {
                    state: if anchor.is_some() {
                        DispatchState::Reply
                    } else {
                        DispatchState::New
                    },
                    items: vec![Message {
                        id,
                        chat: target_chat(f),
                        content,
                        outgoing: true,
                        media_group_id: None,
                        reply_to: anchor,
                    }],
                }),
            });
        }

        let mut origins = Vec::with_capacity(items.len());
        let mut contents = Vec::with_capacity(items.len());
        let mut guards = Vec::new();
        for item in items {
            let Content::File {
                kind,
                source: media,
                caption,
            } = &item.content
            else {
                debug!(origin = item.id, "Skipping non-file media group item");
                continue;
            };
            if !kind.groupable() {
                continue;
            }
            let caption = self
                .transformer
                .transform(f, caption.as_deref(), TextLimit::Caption)
                .await;
            let (content, guard) = self.outbound_file(&item.chat, *kind, media, caption).await?;
            origins.push(item.id);
            contents.push(content);
            guards.extend(guard);
        }
        if contents.is_empty() {
            return Err(Halt::Skip(SkipReason::Unsupported(
                "media group has no groupable items".into(),
            )));
        }

        let ids = self
            .with_retry("send_group", || {
                self.platform.send_group(target, &contents, anchor)
            })
            .await?;
        drop(guards);

        for (origin, id) in origins.iter().zip(&ids) {
            self.correlations
                .put(CorrelationKey::new(target, source, *origin), *id)
                .await?;
        }
        info!(
            source_chat = source,
            target_chat = target,
            items = ids.len(),
            "Media group relayed"
        );

        let echo = if contents.iter().all(|c| echo_content(c).is_some()) && !ids.is_empty() {
            let group_id = format!("{target}:{}", ids[0]);
            Some(Work::Messages {
                state: if anchor.is_some() {
                    DispatchState::MediaGroupReply
                } else {
                    DispatchState::MediaGroupNew
                },
                items: ids
                    .iter()
                    .zip(contents)
                    .map(|(id, content)| Message {
                        id: *id,
                        chat: target_chat(f),
                        content,
                        outgoing: true,
                        media_group_id: Some(group_id.clone()),
                        reply_to: anchor,
                    })
                    .collect(),
            })
        } else {
            None
        };

        Ok(Delivered {
            outcome: DispatchOutcome::Sent { target, ids },
            echo,
        })
    }

    /// Native forward of one message or a whole media group.
    async fn forward_items(&self, f: &Forwarder, items: &[Message]) -> Result<Delivered, Halt> {
        let target = f.target;
        let source_chat = &items[0].chat;
        if source_chat.protected_content {
            return Err(Halt::Skip(SkipReason::ProtectedContent));
        }

        let origin_ids: Vec<MessageId> = items.iter().map(|m| m.id).collect();
        let dests = self
            .with_retry("forward", || {
                self.platform.forward(target, source_chat.id, &origin_ids)
            })
            .await?;

        for (origin, dest) in origin_ids.iter().zip(&dests) {
            self.correlations
                .put(CorrelationKey::new(target, source_chat.id, *origin), *dest)
                .await?;
        }
        info!(
            source_chat = source_chat.id,
            target_chat = target,
            items = dests.len(),
            "Forwarded"
        );

        let grouped = items.len() > 1;
        let group_id = dests.first().map(|d| format!("{target}:{d}"));
        let echo = Work::Messages {
            state: if grouped {
                DispatchState::MediaGroupNew
            } else {
                DispatchState::New
            },
            items: items
                .iter()
                .zip(&dests)
                .map(|(item, dest)| Message {
                    id: *dest,
                    chat: target_chat(f),
                    content: item.content.clone(),
                    outgoing: true,
                    media_group_id: if grouped { group_id.clone() } else { None },
                    reply_to: None,
                })
                .collect(),
        };

        Ok(Delivered {
            outcome: DispatchOutcome::Sent { target, ids: dests },
            echo: Some(echo),
        })
    }

    // ── Edits ───────────────────────────────────────────────────────

    async fn edit_single(&self, f: &Forwarder, msg: &Message) -> Result<Delivered, Halt> {
        if f.forwarding_mode == ForwardingMode::Forward {
            return self.reforward(f, std::slice::from_ref(msg)).await;
        }

        let target = f.target;
        let dest = self.resolve(target, msg.chat.id, msg.id).await?;

        let content = match &msg.content {
            Content::Text { web_preview, .. } => {
                let text = self
                    .transformer
                    .transform(f, msg.content.text_or_caption(), TextLimit::Text)
                    .await;
                self.with_retry("edit_text", || self.platform.edit_text(target, dest, &text))
                    .await?;
                Content::Text {
                    text,
                    web_preview: *web_preview,
                }
            }
            Content::File { caption, .. } if f.send_text_only => {
                let text = self
                    .transformer
                    .transform(f, caption.as_deref(), TextLimit::Text)
                    .await;
                if text.trim().is_empty() {
                    return Err(Halt::Skip(SkipReason::EmptyText));
                }
                self.with_retry("edit_text", || self.platform.edit_text(target, dest, &text))
                    .await?;
                Content::text(text)
            }
            Content::File {
                kind,
                source: media,
                caption,
            } => {
                let caption = self
                    .transformer
                    .transform(f, caption.as_deref(), TextLimit::Caption)
                    .await;

                if kind.groupable() {
                    // Media and caption go out in one edit, so an unchanged
                    // message comes back as NotModified.
                    let (replacement, _guard) = self
                        .outbound_file(&msg.chat, *kind, media, caption.clone())
                        .await?;
                    self.with_retry("edit_media", || {
                        self.platform.edit_media(target, dest, &replacement)
                    })
                    .await?;
                } else if kind.accepts_caption() {
                    self.with_retry("edit_caption", || {
                        self.platform.edit_caption(target, dest, &caption)
                    })
                    .await?;
                } else {
                    return Err(Halt::Skip(SkipReason::Unsupported(format!(
                        "{kind:?} cannot be edited"
                    ))));
                }

                Content::File {
                    kind: *kind,
                    source: media.clone(),
                    caption: Some(caption).filter(|c| !c.is_empty()),
                }
            }
            other => {
                return Err(Halt::Skip(SkipReason::Unsupported(format!(
                    "editing {:?}",
                    other.kind()
                ))));
            }
        };

        info!(source_chat = msg.chat.id, target_chat = target, dest, "Edit relayed");

        let echo = echo_content(&content).map(|content| Work::Messages {
            state: DispatchState::Edited,
            items: vec![Message {
                id: dest,
                chat: target_chat(f),
                content,
                outgoing: true,
                media_group_id: None,
                reply_to: None,
            }],
        });

        Ok(Delivered {
            outcome: DispatchOutcome::Edited {
                target,
                ids: vec![dest],
            },
            echo,
        })
    }

    /// Forward-mode edit: delete the old copies (and everything relayed from
    /// them), then forward the current version again.
    async fn reforward(&self, f: &Forwarder, items: &[Message]) -> Result<Delivered, Halt> {
        let target = f.target;
        let source_chat = &items[0].chat;
        if source_chat.protected_content {
            return Err(Halt::Skip(SkipReason::ProtectedContent));
        }

        let mut old = Vec::with_capacity(items.len());
        for item in items {
            match self
                .correlations
                .lookup(CorrelationKey::new(target, source_chat.id, item.id))
                .await?
            {
                Some(Correlation::Relayed(dest)) => old.push(dest),
                Some(Correlation::Suppressed) => return Err(Halt::Skip(SkipReason::Suppressed)),
                None => {}
            }
        }
        if old.is_empty() {
            return Err(Halt::Skip(SkipReason::NotCorrelated));
        }

        match self
            .with_retry("delete", || self.platform.delete(target, &old))
            .await
        {
            Ok(()) | Err(PlatformError::MessageIdInvalid) => {}
            Err(e) => return Err(e.into()),
        }
        self.propagate_delete(Some(target), &old).await;

        let delivered = self.forward_items(f, items).await?;
        let ids = match delivered.outcome {
            DispatchOutcome::Sent { ids, .. } => ids,
            other => return Ok(Delivered { outcome: other, ..delivered }),
        };
        info!(target_chat = target, replaced = old.len(), "Forwarded copy replaced after edit");

        Ok(Delivered {
            outcome: DispatchOutcome::Edited { target, ids },
            echo: delivered.echo,
        })
    }

    /// Forward-mode edit of a media-group item. The group is fetched once per
    /// event and claimed so concurrent edits of the same group re-forward once.
    ///
    /// The `edited:{group}` claim lives as long as any other gate entry. A
    /// second edit of the same album inside that window is skipped as
    /// `AlreadyClaimed`, so the target keeps the first edited version.
    async fn reforward_group(
        &self,
        f: &Forwarder,
        msg: &Message,
        group: &mut Option<Option<Vec<Message>>>,
    ) -> Result<Delivered, Halt> {
        if group.is_none() {
            let group_id = msg.media_group_id.as_deref().unwrap_or_default();
            let fetched = if self
                .gate
                .claim_first(msg.chat.id, &format!("edited:{group_id}"))
            {
                match self
                    .with_retry("get_grouped_items", || {
                        self.platform.get_grouped_items(msg.chat.id, msg.id)
                    })
                    .await
                {
                    Ok(items) if items.is_empty() => Some(vec![msg.clone()]),
                    Ok(items) => Some(items),
                    Err(e) => {
                        warn!(source_chat = msg.chat.id, error = %e, "Failed to fetch edited media group");
                        None
                    }
                }
            } else {
                None
            };
            *group = Some(fetched);
        }

        match group {
            Some(Some(items)) => self.reforward(f, items).await,
            _ => Err(Halt::Skip(SkipReason::AlreadyClaimed)),
        }
    }

    // ── Pins ────────────────────────────────────────────────────────

    async fn pin(&self, f: &Forwarder, chat: &Chat, pinned_id: MessageId) -> Result<Delivered, Halt> {
        let target = f.target;
        let dest = self.resolve(target, chat.id, pinned_id).await?;
        self.with_retry("pin", || self.platform.pin(target, dest))
            .await?;
        info!(source_chat = chat.id, target_chat = target, dest, "Pin relayed");

        Ok(Delivered {
            outcome: DispatchOutcome::Pinned { target, id: dest },
            echo: Some(Work::Pin {
                chat: target_chat(f),
                pinned_id: dest,
                outgoing: true,
            }),
        })
    }

    // ── Deletes ─────────────────────────────────────────────────────

    /// Delete every copy of the given origin messages, following the relay
    /// chain breadth-first. Missing mappings are ignored; never fails.
    pub async fn propagate_delete(
        &self,
        chat: Option<ChatId>,
        origin_ids: &[MessageId],
    ) -> DispatchOutcome {
        let mut queue: VecDeque<(Option<ChatId>, MessageId)> =
            origin_ids.iter().map(|id| (chat, *id)).collect();
        let mut visited = HashSet::new();
        let mut count = 0;

        while let Some((chat, origin)) = queue.pop_front() {
            if !visited.insert((chat, origin)) {
                continue;
            }

            let copies = match chat {
                Some(chat) => self.correlations.delete_by_origin(chat, origin).await,
                None => self.correlations.delete_by_origin_any_source(origin).await,
            };
            let copies = match copies {
                Ok(copies) => copies,
                Err(e) => {
                    warn!(source_chat = ?chat, origin, error = %e, "Correlation lookup for delete failed");
                    continue;
                }
            };

            for (target, dest) in copies {
                let ids = [dest];
                match self
                    .with_retry("delete", || self.platform.delete(target, &ids))
                    .await
                {
                    Ok(()) => {
                        count += 1;
                        debug!(target_chat = target, dest, "Relayed copy deleted");
                    }
                    Err(PlatformError::MessageIdInvalid) => {
                        debug!(target_chat = target, dest, "Relayed copy already gone");
                    }
                    Err(e) => {
                        warn!(target_chat = target, dest, error = %e, "Failed to delete relayed copy");
                    }
                }
                queue.push_back((Some(target), dest));
            }
        }

        if count > 0 {
            info!(source_chat = ?chat, deleted = count, "Delete relayed");
        }
        DispatchOutcome::Deleted { count }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    /// Destination id of an origin message in `target`.
    async fn resolve(
        &self,
        target: ChatId,
        source: ChatId,
        origin: MessageId,
    ) -> Result<MessageId, Halt> {
        match self
            .correlations
            .lookup(CorrelationKey::new(target, source, origin))
            .await?
        {
            Some(Correlation::Relayed(dest)) => Ok(dest),
            Some(Correlation::Suppressed) => Err(Halt::Skip(SkipReason::Suppressed)),
            None => {
                warn!(
                    target_chat = target,
                    source_chat = source,
                    origin,
                    "Anchor message does not exist in the target chat"
                );
                Err(Halt::Skip(SkipReason::NotCorrelated))
            }
        }
    }

    /// Content for a file copy. Protected chats cannot share file ids, so
    /// the media is downloaded and the guard removes it afterwards.
    async fn outbound_file(
        &self,
        chat: &Chat,
        kind: FileKind,
        media: &MediaSource,
        caption: String,
    ) -> Result<(Content, Option<DownloadedMedia>), Halt> {
        let caption = Some(caption).filter(|c| !c.is_empty() && kind.accepts_caption());
        let (source, guard) = match media {
            MediaSource::FileId(_) if chat.protected_content => {
                let path = self
                    .with_retry("download", || self.platform.download(media))
                    .await?;
                debug!(source_chat = chat.id, path = %path.display(), "Downloaded protected media");
                (MediaSource::Local(path.clone()), Some(DownloadedMedia::new(path)))
            }
            other => (other.clone(), None),
        };
        Ok((
            Content::File {
                kind,
                source,
                caption,
            },
            guard,
        ))
    }

    /// Quizzes need their answer; learn it by voting when the source hides it.
    async fn prepare_poll(&self, msg: &Message, poll: &Poll) -> Result<Poll, Halt> {
        let mut poll = poll.clone();
        if poll.kind == PollKind::Quiz && poll.correct_option.is_none() {
            let answer = self
                .with_retry("vote_poll", || self.platform.vote_poll(msg.chat.id, msg.id, 0))
                .await?;
            poll.correct_option = Some(answer.correct_option);
            poll.explanation = answer.explanation;
        }
        Ok(poll)
    }

    async fn is_duplicate(&self, target: ChatId, text: &str) -> bool {
        match self.platform.last_message_text(target).await {
            Ok(Some(last)) => last == text,
            Ok(None) => false,
            Err(e) => {
                debug!(target_chat = target, error = %e, "History unavailable, sending anyway");
                false
            }
        }
    }

    /// Whether any photo in `items` matches a blocked image.
    async fn is_blocked_image(&self, blocked: &[String], items: &[Message]) -> bool {
        let Some(comparator) = &self.comparator else {
            return false;
        };
        if blocked.is_empty() {
            return false;
        }

        for item in items {
            let Content::File {
                kind: FileKind::Photo,
                source: media @ MediaSource::FileId(_),
                ..
            } = &item.content
            else {
                continue;
            };

            let photo = match self
                .with_retry("download", || self.platform.download(media))
                .await
            {
                Ok(path) => DownloadedMedia::new(path),
                Err(e) => {
                    warn!(origin = item.id, error = %e, "Could not download photo for blocked-image check");
                    continue;
                }
            };

            for image in blocked {
                match comparator.similarity(photo.path(), Path::new(image)).await {
                    Ok(score) if score >= self.config.blocked_image_threshold => {
                        info!(origin = item.id, image = %image, score, "Blocked image matched");
                        return true;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(image = %image, error = %e, "Image comparison failed"),
                }
            }
        }
        false
    }

    /// Retry rate-limited calls with exponential backoff plus jitter.
    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, PlatformError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PlatformError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match call().await {
                Err(PlatformError::RateLimited { retry_after }) if attempt < self.config.max_retries => {
                    let backoff = retry_after.unwrap_or_else(|| backoff_delay(attempt));
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
                    warn!(op, attempt, backoff_ms = backoff.as_millis() as u64, "Rate limited, retrying");
                    tokio::time::sleep(backoff + jitter).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Upper bound on a computed retry delay.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Exponential delay for a retry that came without a `retry_after` hint.
fn backoff_delay(attempt: u32) -> Duration {
    let millis = 500u64.saturating_mul(2u64.saturating_pow(attempt));
    Duration::from_millis(millis).min(MAX_BACKOFF)
}

/// The target chat as a source for chained relays.
fn target_chat(f: &Forwarder) -> Chat {
    Chat {
        id: f.target,
        title: f.name.clone(),
        protected_content: false,
    }
}

/// Content that can be relayed again from the target. Local downloads are
/// removed after sending, so they cannot.
fn echo_content(content: &Content) -> Option<Content> {
    match content {
        Content::File {
            source: MediaSource::Local(_),
            ..
        } => None,
        other => Some(other.clone()),
    }
}
