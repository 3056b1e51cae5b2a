//! End-to-end relay tests.
//!
//! A recording in-memory platform stands in for Telegram. It keeps the live
//! messages of every chat, so tests assert on what a member of the target
//! chat would actually see.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;

use chat_relay::correlation::{Correlation, CorrelationKey, CorrelationStore, LibSqlCorrelationStore};
use chat_relay::error::PlatformError;
use chat_relay::pipeline::{DispatchConfig, DispatchOrchestrator, DispatchOutcome, SkipReason};
use chat_relay::platform::{
    Chat, ChatId, ChatInfo, Content, ExactMatchComparator, FileKind, InboundEvent, MediaSource,
    Message, MessageId, PlatformClient, Poll, PollKind, QuizAnswer,
};
use chat_relay::relay::Relay;
use chat_relay::rules::{Forwarder, ForwardingMode, RuleStore};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Chats {
    next_id: MessageId,
    live: HashMap<ChatId, BTreeMap<MessageId, Content>>,
    last_text: HashMap<ChatId, String>,
    groups: HashMap<(ChatId, MessageId), Vec<Message>>,
    replies: Vec<(ChatId, MessageId, Option<MessageId>)>,
    pinned: Vec<(ChatId, MessageId)>,
    /// Reject polls the way a chat with polls disabled does.
    refuse_polls: bool,
}

/// In-memory chat platform.
struct FakeChats {
    downloads: PathBuf,
    chats: Mutex<Chats>,
}

impl FakeChats {
    fn new(downloads: PathBuf) -> Self {
        Self {
            downloads,
            chats: Mutex::new(Chats {
                next_id: 1000,
                ..Chats::default()
            }),
        }
    }

    /// Post a message into a chat as a member would.
    fn post(&self, chat: &Chat, content: Content) -> Message {
        let mut chats = self.chats.lock().unwrap();
        chats.next_id += 1;
        let id = chats.next_id;
        chats.live.entry(chat.id).or_default().insert(id, content.clone());
        Message {
            id,
            chat: chat.clone(),
            content,
            outgoing: false,
            media_group_id: None,
            reply_to: None,
        }
    }

    /// Change a posted message in place.
    fn rewrite(&self, msg: &Message, content: Content) -> Message {
        let mut chats = self.chats.lock().unwrap();
        chats
            .live
            .entry(msg.chat.id)
            .or_default()
            .insert(msg.id, content.clone());
        Message {
            content,
            ..msg.clone()
        }
    }

    fn register_group(&self, items: &[Message]) {
        let mut chats = self.chats.lock().unwrap();
        for item in items {
            chats
                .groups
                .insert((item.chat.id, item.id), items.to_vec());
        }
    }

    fn live(&self, chat: ChatId) -> Vec<(MessageId, Content)> {
        let chats = self.chats.lock().unwrap();
        chats
            .live
            .get(&chat)
            .map(|m| m.iter().map(|(id, c)| (*id, c.clone())).collect())
            .unwrap_or_default()
    }

    fn texts(&self, chat: ChatId) -> Vec<String> {
        self.live(chat)
            .into_iter()
            .filter_map(|(_, c)| c.text_or_caption().map(str::to_string))
            .collect()
    }

    fn insert(chats: &mut Chats, chat: ChatId, content: Content) -> MessageId {
        chats.next_id += 1;
        let id = chats.next_id;
        if let Content::Text { text, .. } = &content {
            chats.last_text.insert(chat, text.clone());
        }
        chats.live.entry(chat).or_default().insert(id, content);
        id
    }
}

#[async_trait]
impl PlatformClient for FakeChats {
    async fn send(
        &self,
        chat: ChatId,
        content: &Content,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId, PlatformError> {
        let mut chats = self.chats.lock().unwrap();
        if chats.refuse_polls && matches!(content, Content::Poll(_)) {
            return Err(PlatformError::Api {
                code: 400,
                description: "polls can't be sent to this chat".into(),
            });
        }
        let id = Self::insert(&mut chats, chat, content.clone());
        chats.replies.push((chat, id, reply_to));
        Ok(id)
    }

    async fn send_group(
        &self,
        chat: ChatId,
        items: &[Content],
        reply_to: Option<MessageId>,
    ) -> Result<Vec<MessageId>, PlatformError> {
        let mut chats = self.chats.lock().unwrap();
        let ids: Vec<_> = items
            .iter()
            .map(|c| Self::insert(&mut chats, chat, c.clone()))
            .collect();
        for id in &ids {
            chats.replies.push((chat, *id, reply_to));
        }
        Ok(ids)
    }

    async fn forward(
        &self,
        to: ChatId,
        from: ChatId,
        ids: &[MessageId],
    ) -> Result<Vec<MessageId>, PlatformError> {
        let mut chats = self.chats.lock().unwrap();
        let mut forwarded = Vec::new();
        for id in ids {
            let content = chats
                .live
                .get(&from)
                .and_then(|m| m.get(id))
                .cloned()
                .ok_or(PlatformError::MessageIdInvalid)?;
            forwarded.push(Self::insert(&mut chats, to, content));
        }
        Ok(forwarded)
    }

    async fn edit_text(&self, chat: ChatId, id: MessageId, text: &str) -> Result<(), PlatformError> {
        let mut chats = self.chats.lock().unwrap();
        let slot = chats
            .live
            .get_mut(&chat)
            .and_then(|m| m.get_mut(&id))
            .ok_or(PlatformError::MessageIdInvalid)?;
        if slot.text_or_caption() == Some(text) {
            return Err(PlatformError::MessageNotModified);
        }
        *slot = Content::text(text);
        Ok(())
    }

    async fn edit_caption(&self, chat: ChatId, id: MessageId, text: &str) -> Result<(), PlatformError> {
        let mut chats = self.chats.lock().unwrap();
        let slot = chats
            .live
            .get_mut(&chat)
            .and_then(|m| m.get_mut(&id))
            .ok_or(PlatformError::MessageIdInvalid)?;
        match slot {
            Content::File { caption, .. } => {
                *caption = Some(text.to_string());
                Ok(())
            }
            _ => Err(PlatformError::Api {
                code: 400,
                description: "no caption to edit".into(),
            }),
        }
    }

    async fn edit_media(&self, chat: ChatId, id: MessageId, content: &Content) -> Result<(), PlatformError> {
        let mut chats = self.chats.lock().unwrap();
        let slot = chats
            .live
            .get_mut(&chat)
            .and_then(|m| m.get_mut(&id))
            .ok_or(PlatformError::MessageIdInvalid)?;
        if *slot == *content {
            return Err(PlatformError::MessageNotModified);
        }
        *slot = content.clone();
        Ok(())
    }

    async fn delete(&self, chat: ChatId, ids: &[MessageId]) -> Result<(), PlatformError> {
        let mut chats = self.chats.lock().unwrap();
        let live = chats.live.entry(chat).or_default();
        let removed = ids.iter().filter(|id| live.remove(id).is_some()).count();
        if removed == 0 {
            return Err(PlatformError::MessageIdInvalid);
        }
        Ok(())
    }

    async fn pin(&self, chat: ChatId, id: MessageId) -> Result<(), PlatformError> {
        let mut chats = self.chats.lock().unwrap();
        if !chats.live.get(&chat).is_some_and(|m| m.contains_key(&id)) {
            return Err(PlatformError::MessageIdInvalid);
        }
        chats.pinned.push((chat, id));
        Ok(())
    }

    async fn last_message_text(&self, chat: ChatId) -> Result<Option<String>, PlatformError> {
        Ok(self.chats.lock().unwrap().last_text.get(&chat).cloned())
    }

    async fn get_grouped_items(&self, chat: ChatId, id: MessageId) -> Result<Vec<Message>, PlatformError> {
        self.chats
            .lock()
            .unwrap()
            .groups
            .get(&(chat, id))
            .cloned()
            .ok_or(PlatformError::MessageIdInvalid)
    }

    async fn resolve_chat(&self, reference: &str) -> Result<ChatInfo, PlatformError> {
        Err(PlatformError::ChatNotFound(reference.to_string()))
    }

    async fn download(&self, source: &MediaSource) -> Result<PathBuf, PlatformError> {
        let MediaSource::FileId(file_id) = source else {
            return Err(PlatformError::Unsupported("local source".into()));
        };
        let path = self.downloads.join(format!("{}.bin", uuid::Uuid::new_v4()));
        std::fs::write(&path, file_id.as_bytes())?;
        Ok(path)
    }

    async fn vote_poll(&self, _: ChatId, _: MessageId, _: usize) -> Result<QuizAnswer, PlatformError> {
        Ok(QuizAnswer {
            correct_option: 2,
            explanation: None,
        })
    }
}

struct Harness {
    tmp: tempfile::TempDir,
    platform: Arc<FakeChats>,
    correlations: Arc<LibSqlCorrelationStore>,
    rules: Arc<RuleStore>,
    orchestrator: Arc<DispatchOrchestrator>,
}

async fn harness(forwarders: Vec<Forwarder>) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let rules = Arc::new(RuleStore::load(tmp.path().join("forwarding.json")).await.unwrap());
    for f in forwarders {
        rules.create(f).await.unwrap();
    }
    let platform = Arc::new(FakeChats::new(tmp.path().to_path_buf()));
    let correlations = Arc::new(LibSqlCorrelationStore::new_memory().await.unwrap());

    let orchestrator = DispatchOrchestrator::new(
        platform.clone(),
        correlations.clone(),
        rules.clone(),
        None,
        DispatchConfig::default(),
    )
    .with_image_comparator(Arc::new(ExactMatchComparator));

    Harness {
        tmp,
        platform,
        correlations,
        rules,
        orchestrator: Arc::new(orchestrator),
    }
}

fn chat(id: ChatId) -> Chat {
    Chat {
        id,
        title: format!("chat {id}"),
        protected_content: false,
    }
}

fn forwarder(source: ChatId, target: ChatId) -> Forwarder {
    Forwarder::new(
        format!("to {target}"),
        target,
        BTreeMap::from([(source, format!("chat {source}"))]),
    )
}

fn photo(file_id: &str, caption: Option<&str>) -> Content {
    Content::File {
        kind: FileKind::Photo,
        source: MediaSource::FileId(file_id.into()),
        caption: caption.map(str::to_string),
    }
}

fn group(h: &Harness, source: &Chat, contents: Vec<Content>) -> Vec<Message> {
    let items: Vec<_> = contents
        .into_iter()
        .map(|content| {
            let mut item = h.platform.post(source, content);
            item.media_group_id = Some("g1".into());
            item
        })
        .collect();
    h.platform.register_group(&items);
    items
}

fn quiz(correct_option: Option<usize>) -> Poll {
    Poll {
        question: "Capital of France?".into(),
        options: vec!["Berlin".into(), "Madrid".into(), "Paris".into()],
        kind: PollKind::Quiz,
        is_anonymous: true,
        allows_multiple_answers: false,
        correct_option,
        explanation: None,
    }
}

async fn handle(h: &Harness, event: InboundEvent) -> Vec<DispatchOutcome> {
    tokio::time::timeout(TEST_TIMEOUT, h.orchestrator.handle(event))
        .await
        .expect("dispatch hung")
}

#[tokio::test]
async fn copy_relays_and_follows_edits() {
    let h = harness(vec![forwarder(-1, -100)]).await;
    let msg = h.platform.post(&chat(-1), Content::text("hello"));

    let outcomes = handle(&h, InboundEvent::New(msg.clone())).await;
    let [DispatchOutcome::Sent { target: -100, ids }] = outcomes.as_slice() else {
        panic!("unexpected outcomes: {outcomes:?}");
    };
    assert_eq!(h.platform.texts(-100), vec!["hello"]);

    let edited = h.platform.rewrite(&msg, Content::text("hello world"));
    let outcomes = handle(&h, InboundEvent::Edited(edited.clone())).await;
    assert_eq!(
        outcomes,
        vec![DispatchOutcome::Edited {
            target: -100,
            ids: ids.clone()
        }]
    );
    assert_eq!(h.platform.texts(-100), vec!["hello world"]);

    // Same text again is a no-op at the platform.
    let outcomes = handle(&h, InboundEvent::Edited(edited)).await;
    assert!(matches!(
        outcomes.as_slice(),
        [DispatchOutcome::Skipped {
            reason: SkipReason::NotModified,
            ..
        }]
    ));
}

#[tokio::test]
async fn forward_mode_edit_leaves_one_live_copy() {
    let mut f = forwarder(-1, -100);
    f.forwarding_mode = ForwardingMode::Forward;
    let h = harness(vec![f]).await;

    let msg = h.platform.post(&chat(-1), Content::text("v1"));
    handle(&h, InboundEvent::New(msg.clone())).await;
    let first = h.platform.live(-100);
    assert_eq!(first.len(), 1);

    let edited = h.platform.rewrite(&msg, Content::text("v2"));
    let outcomes = handle(&h, InboundEvent::Edited(edited)).await;
    assert!(matches!(outcomes.as_slice(), [DispatchOutcome::Edited { target: -100, .. }]));

    let after = h.platform.live(-100);
    assert_eq!(after.len(), 1);
    assert_ne!(after[0].0, first[0].0);
    assert_eq!(after[0].1.text_or_caption(), Some("v2"));

    let mapped = h
        .correlations
        .get(CorrelationKey::new(-100, -1, msg.id))
        .await
        .unwrap();
    assert_eq!(mapped, Some(after[0].0));
}

#[tokio::test]
async fn replies_are_anchored_to_the_copy() {
    let h = harness(vec![forwarder(-1, -100)]).await;
    let original = h.platform.post(&chat(-1), Content::text("question"));
    handle(&h, InboundEvent::New(original.clone())).await;
    let copy = h.platform.live(-100)[0].0;

    let mut reply = h.platform.post(&chat(-1), Content::text("answer"));
    reply.reply_to = Some(original.id);
    let outcomes = handle(&h, InboundEvent::New(reply)).await;
    let [DispatchOutcome::Sent { ids, .. }] = outcomes.as_slice() else {
        panic!("unexpected outcomes: {outcomes:?}");
    };

    let replies = h.platform.chats.lock().unwrap().replies.clone();
    assert!(replies.contains(&(-100, ids[0], Some(copy))));

    let mut orphan = h.platform.post(&chat(-1), Content::text("to nowhere"));
    orphan.reply_to = Some(1);
    let outcomes = handle(&h, InboundEvent::New(orphan)).await;
    assert_eq!(
        outcomes,
        vec![DispatchOutcome::Skipped {
            target: Some(-100),
            reason: SkipReason::NotCorrelated
        }]
    );
}

#[tokio::test]
async fn duplicate_text_is_dropped_unless_allowed() {
    let mut allows = forwarder(-1, -200);
    allows.duplicated_text = true;
    let h = harness(vec![forwarder(-1, -100), allows]).await;

    for _ in 0..2 {
        let msg = h.platform.post(&chat(-1), Content::text("same"));
        handle(&h, InboundEvent::New(msg)).await;
    }

    assert_eq!(h.platform.texts(-100), vec!["same"]);
    assert_eq!(h.platform.texts(-200), vec!["same", "same"]);
}

#[tokio::test]
async fn media_group_is_relayed_once() {
    let h = harness(vec![forwarder(-1, -100)]).await;
    let mut items = Vec::new();
    for (i, caption) in [Some("album"), None, None].into_iter().enumerate() {
        let mut item = h.platform.post(&chat(-1), photo(&format!("p{i}"), caption));
        item.media_group_id = Some("g1".into());
        items.push(item);
    }
    h.platform.register_group(&items);

    let results = join_all(
        items
            .iter()
            .map(|item| handle(&h, InboundEvent::New(item.clone()))),
    )
    .await;

    let sent: Vec<_> = results
        .iter()
        .flatten()
        .filter(|o| matches!(o, DispatchOutcome::Sent { .. }))
        .collect();
    assert_eq!(sent.len(), 1);
    let claimed = results
        .iter()
        .flatten()
        .filter(|o| {
            matches!(
                o,
                DispatchOutcome::Skipped {
                    reason: SkipReason::AlreadyClaimed,
                    ..
                }
            )
        })
        .count();
    assert_eq!(claimed, 2);

    assert_eq!(h.platform.live(-100).len(), 3);
    for item in &items {
        assert!(
            h.correlations
                .get(CorrelationKey::new(-100, -1, item.id))
                .await
                .unwrap()
                .is_some()
        );
    }
}

#[tokio::test]
async fn chained_relays_and_deletes() {
    let h = harness(vec![forwarder(-1, -2), forwarder(-2, -3)]).await;
    let msg = h.platform.post(&chat(-1), Content::text("travels"));

    let outcomes = handle(&h, InboundEvent::New(msg.clone())).await;
    let sent = outcomes
        .iter()
        .filter(|o| matches!(o, DispatchOutcome::Sent { .. }))
        .count();
    assert_eq!(sent, 2);
    assert_eq!(h.platform.texts(-2), vec!["travels"]);
    assert_eq!(h.platform.texts(-3), vec!["travels"]);

    let outcomes = handle(
        &h,
        InboundEvent::Deleted {
            chat: Some(-1),
            message_ids: vec![msg.id],
        },
    )
    .await;
    assert_eq!(outcomes, vec![DispatchOutcome::Deleted { count: 2 }]);
    assert!(h.platform.live(-2).is_empty());
    assert!(h.platform.live(-3).is_empty());
    assert!(h.correlations.is_empty().await.unwrap());
}

#[tokio::test]
async fn relay_loops_are_cut() {
    let h = harness(vec![forwarder(-1, -2), forwarder(-2, -1)]).await;
    let msg = h.platform.post(&chat(-1), Content::text("ping"));

    let outcomes = handle(&h, InboundEvent::New(msg)).await;
    assert!(outcomes.contains(&DispatchOutcome::Skipped {
        target: Some(-1),
        reason: SkipReason::Cycle
    }));
    assert_eq!(h.platform.texts(-1), vec!["ping"]);
    assert_eq!(h.platform.texts(-2), vec!["ping"]);
}

#[tokio::test]
async fn direction_gate_records_pass_through() {
    let mut f = forwarder(-1, -100);
    f.incoming = false;
    let h = harness(vec![f]).await;

    let msg = h.platform.post(&chat(-1), Content::text("inbound"));
    let outcomes = handle(&h, InboundEvent::New(msg.clone())).await;
    assert_eq!(
        outcomes,
        vec![DispatchOutcome::Skipped {
            target: Some(-100),
            reason: SkipReason::DirectionGate
        }]
    );
    assert!(h.platform.live(-100).is_empty());
    assert_eq!(
        h.correlations
            .lookup(CorrelationKey::new(-100, -1, msg.id))
            .await
            .unwrap(),
        Some(Correlation::Suppressed)
    );

    let mut outgoing = h.platform.post(&chat(-1), Content::text("outbound"));
    outgoing.outgoing = true;
    handle(&h, InboundEvent::New(outgoing)).await;
    assert_eq!(h.platform.texts(-100), vec!["outbound"]);
}

#[tokio::test]
async fn pins_follow_the_copy() {
    let h = harness(vec![forwarder(-1, -100)]).await;
    let msg = h.platform.post(&chat(-1), Content::text("pin me"));
    handle(&h, InboundEvent::New(msg.clone())).await;
    let copy = h.platform.live(-100)[0].0;

    let outcomes = handle(
        &h,
        InboundEvent::Pinned {
            chat: chat(-1),
            pinned_id: msg.id,
            outgoing: false,
        },
    )
    .await;
    assert_eq!(outcomes, vec![DispatchOutcome::Pinned { target: -100, id: copy }]);
    assert_eq!(h.platform.chats.lock().unwrap().pinned, vec![(-100, copy)]);
}

#[tokio::test]
async fn blocked_words_only_affect_their_forwarder() {
    let mut strict = forwarder(-1, -100);
    strict.blocked_words = vec!["Spam".into()];
    let h = harness(vec![strict, forwarder(-1, -200)]).await;

    let msg = h.platform.post(&chat(-1), Content::text("cheap SPAM here"));
    handle(&h, InboundEvent::New(msg)).await;

    assert!(h.platform.live(-100).is_empty());
    assert_eq!(h.platform.texts(-200), vec!["cheap SPAM here"]);
}

#[tokio::test]
async fn blocked_images_stop_the_event() {
    let h = harness(vec![forwarder(-1, -100)]).await;
    let blocked = h.tmp.path().join("blocked.jpg");
    std::fs::write(&blocked, b"banned-photo").unwrap();
    h.rules
        .add_blocked_image(blocked.display().to_string())
        .await
        .unwrap();

    let msg = h.platform.post(&chat(-1), photo("banned-photo", None));
    let outcomes = handle(&h, InboundEvent::New(msg)).await;
    assert_eq!(
        outcomes,
        vec![DispatchOutcome::Skipped {
            target: None,
            reason: SkipReason::BlockedImage
        }]
    );

    let msg = h.platform.post(&chat(-1), photo("fine-photo", None));
    handle(&h, InboundEvent::New(msg)).await;
    assert_eq!(h.platform.live(-100).len(), 1);
}

#[tokio::test]
async fn protected_sources_are_copied_from_downloads() {
    let mut forward = forwarder(-1, -200);
    forward.forwarding_mode = ForwardingMode::Forward;
    let h = harness(vec![forwarder(-1, -100), forward]).await;

    let protected = Chat {
        protected_content: true,
        ..chat(-1)
    };
    let msg = h.platform.post(&protected, photo("secret", Some("look")));
    let outcomes = handle(&h, InboundEvent::New(msg)).await;

    assert!(outcomes.contains(&DispatchOutcome::Skipped {
        target: Some(-200),
        reason: SkipReason::ProtectedContent
    }));
    let copies = h.platform.live(-100);
    assert_eq!(copies.len(), 1);
    let Content::File { source, caption, .. } = &copies[0].1 else {
        panic!("expected a file copy");
    };
    assert!(matches!(source, MediaSource::Local(path) if !path.exists()));
    assert_eq!(caption.as_deref(), Some("look"));
}

#[tokio::test]
async fn relay_loop_drops_unknown_chats_and_drains() {
    let h = harness(vec![forwarder(-1, -100)]).await;
    let relayed = h.platform.post(&chat(-1), Content::text("in scope"));
    let ignored = h.platform.post(&chat(-9), Content::text("elsewhere"));

    let events = Box::pin(futures::stream::iter(vec![
        InboundEvent::New(relayed),
        InboundEvent::New(ignored),
    ]));
    let relay = Relay::new(h.orchestrator.clone(), TEST_TIMEOUT);
    tokio::time::timeout(TEST_TIMEOUT, relay.run_until(events, std::future::pending()))
        .await
        .expect("relay did not stop when the stream ended");

    assert_eq!(h.platform.texts(-100), vec!["in scope"]);
}

#[tokio::test]
async fn text_only_edits_stay_text() {
    let mut f = forwarder(-1, -100);
    f.send_text_only = true;
    let h = harness(vec![f]).await;

    let msg = h.platform.post(&chat(-1), photo("p", Some("v1")));
    handle(&h, InboundEvent::New(msg.clone())).await;
    let copy = h.platform.live(-100)[0].0;
    assert_eq!(h.platform.live(-100), vec![(copy, Content::text("v1"))]);

    let edited = h.platform.rewrite(&msg, photo("p", Some("v2")));
    let outcomes = handle(&h, InboundEvent::Edited(edited)).await;
    assert_eq!(
        outcomes,
        vec![DispatchOutcome::Edited {
            target: -100,
            ids: vec![copy]
        }]
    );
    assert_eq!(h.platform.live(-100), vec![(copy, Content::text("v2"))]);
}

#[tokio::test]
async fn media_edit_replaces_file_and_caption_together() {
    let h = harness(vec![forwarder(-1, -100)]).await;
    let msg = h.platform.post(&chat(-1), photo("p1", Some("cap")));
    handle(&h, InboundEvent::New(msg.clone())).await;
    let copy = h.platform.live(-100)[0].0;

    let outcomes = handle(&h, InboundEvent::Edited(msg.clone())).await;
    assert_eq!(
        outcomes,
        vec![DispatchOutcome::Skipped {
            target: Some(-100),
            reason: SkipReason::NotModified
        }]
    );

    let edited = h.platform.rewrite(&msg, photo("p2", Some("new")));
    let outcomes = handle(&h, InboundEvent::Edited(edited)).await;
    assert_eq!(
        outcomes,
        vec![DispatchOutcome::Edited {
            target: -100,
            ids: vec![copy]
        }]
    );
    assert_eq!(h.platform.live(-100), vec![(copy, photo("p2", Some("new")))]);
}

#[tokio::test]
async fn hidden_quiz_answer_is_learned_by_voting() {
    let h = harness(vec![forwarder(-1, -100)]).await;
    let msg = h.platform.post(&chat(-1), Content::Poll(quiz(None)));

    let outcomes = handle(&h, InboundEvent::New(msg)).await;
    assert!(matches!(outcomes.as_slice(), [DispatchOutcome::Sent { target: -100, .. }]));

    let copies = h.platform.live(-100);
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].1, Content::Poll(quiz(Some(2))));
}

#[tokio::test]
async fn refused_poll_is_skipped() {
    let h = harness(vec![forwarder(-1, -100)]).await;
    h.platform.chats.lock().unwrap().refuse_polls = true;
    let msg = h.platform.post(&chat(-1), Content::Poll(quiz(Some(2))));

    let outcomes = handle(&h, InboundEvent::New(msg.clone())).await;
    assert_eq!(
        outcomes,
        vec![DispatchOutcome::Skipped {
            target: Some(-100),
            reason: SkipReason::PollRefused
        }]
    );
    assert!(h.platform.live(-100).is_empty());
    assert_eq!(
        h.correlations
            .get(CorrelationKey::new(-100, -1, msg.id))
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn text_only_group_sends_first_caption() {
    let mut f = forwarder(-1, -100);
    f.send_text_only = true;
    let h = harness(vec![f]).await;
    let items = group(
        &h,
        &chat(-1),
        vec![photo("p0", None), photo("p1", Some("first")), photo("p2", Some("second"))],
    );

    let outcomes = handle(&h, InboundEvent::New(items[0].clone())).await;
    let [DispatchOutcome::Sent { target: -100, ids }] = outcomes.as_slice() else {
        panic!("unexpected outcomes: {outcomes:?}");
    };
    assert_eq!(h.platform.live(-100), vec![(ids[0], Content::text("first"))]);
    assert_eq!(
        h.correlations
            .get(CorrelationKey::new(-100, -1, items[0].id))
            .await
            .unwrap(),
        Some(ids[0])
    );
}

#[tokio::test]
async fn group_replies_are_anchored_to_the_copy() {
    let h = harness(vec![forwarder(-1, -100)]).await;
    let original = h.platform.post(&chat(-1), Content::text("question"));
    handle(&h, InboundEvent::New(original.clone())).await;
    let copy = h.platform.live(-100)[0].0;

    let mut first = h.platform.post(&chat(-1), photo("p0", Some("answers")));
    first.media_group_id = Some("g1".into());
    first.reply_to = Some(original.id);
    let mut second = h.platform.post(&chat(-1), photo("p1", None));
    second.media_group_id = Some("g1".into());
    h.platform.register_group(&[first.clone(), second]);

    let outcomes = handle(&h, InboundEvent::New(first)).await;
    let [DispatchOutcome::Sent { target: -100, ids }] = outcomes.as_slice() else {
        panic!("unexpected outcomes: {outcomes:?}");
    };
    assert_eq!(ids.len(), 2);

    let replies = h.platform.chats.lock().unwrap().replies.clone();
    for id in ids {
        assert!(replies.contains(&(-100, *id, Some(copy))));
    }
}

#[tokio::test]
async fn forward_mode_group_edit_reforwards_once() {
    let mut f = forwarder(-1, -100);
    f.forwarding_mode = ForwardingMode::Forward;
    let h = harness(vec![f]).await;
    let items = group(&h, &chat(-1), vec![photo("p0", Some("album")), photo("p1", None)]);

    handle(&h, InboundEvent::New(items[0].clone())).await;
    let first = h.platform.live(-100);
    assert_eq!(first.len(), 2);

    let edited = h.platform.rewrite(&items[0], photo("p0", Some("album v2")));
    let outcomes = handle(&h, InboundEvent::Edited(edited)).await;
    let [DispatchOutcome::Edited { target: -100, ids }] = outcomes.as_slice() else {
        panic!("unexpected outcomes: {outcomes:?}");
    };
    assert_eq!(ids.len(), 2);

    let after = h.platform.live(-100);
    assert_eq!(after.len(), 2);
    assert!(after.iter().all(|(id, _)| ids.contains(id)));
    assert_eq!(h.platform.texts(-100), vec!["album v2"]);

    // The second item of the same album edit is already covered.
    let outcomes = handle(&h, InboundEvent::Edited(items[1].clone())).await;
    assert_eq!(
        outcomes,
        vec![DispatchOutcome::Skipped {
            target: Some(-100),
            reason: SkipReason::AlreadyClaimed
        }]
    );
    assert_eq!(h.platform.live(-100), after);
}

#[tokio::test]
async fn replies_to_suppressed_messages_are_skipped() {
    let mut f = forwarder(-1, -100);
    f.incoming = false;
    let h = harness(vec![f]).await;

    let inbound = h.platform.post(&chat(-1), Content::text("inbound"));
    handle(&h, InboundEvent::New(inbound.clone())).await;

    let mut reply = h.platform.post(&chat(-1), Content::text("outbound reply"));
    reply.outgoing = true;
    reply.reply_to = Some(inbound.id);
    let outcomes = handle(&h, InboundEvent::New(reply)).await;
    assert_eq!(
        outcomes,
        vec![DispatchOutcome::Skipped {
            target: Some(-100),
            reason: SkipReason::Suppressed
        }]
    );
    assert!(h.platform.live(-100).is_empty());
}
