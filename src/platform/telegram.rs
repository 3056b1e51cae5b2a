//! Telegram Bot API client.
//!
//! Native Rust implementation of the `PlatformClient` trait over the Bot API,
//! plus a long-polling update loop that turns updates into `InboundEvent`s.
//!
//! The Bot API has no history or media-group lookup, so the update loop keeps
//! a short-lived cache of recent group items and of the last text seen per
//! chat. `get_grouped_items` waits a settle window before reading the cache
//! so the rest of a burst has time to arrive.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::PlatformError;
use crate::platform::{
    Chat, ChatId, ChatInfo, Content, EventStream, FileKind, InboundEvent, MediaSource, Message,
    MessageId, PlatformClient, Poll, PollKind, QuizAnswer,
};

const TELEGRAM_API: &str = "https://api.telegram.org";

/// How long cached group items and last texts are kept.
const CACHE_TTL: Duration = Duration::from_secs(600);

/// Long-poll timeout passed to getUpdates.
const POLL_TIMEOUT_SECS: u64 = 30;

/// Telegram Bot API client.
///
/// Two Bot API limits shape what this client can report:
///
/// - Bots cannot vote in polls, so `vote_poll` always fails with
///   `Unsupported`. A quiz whose correct option is hidden from the bot is
///   skipped instead of relayed.
/// - The Bot API never delivers message deletions, so the update loop never
///   yields `InboundEvent::Deleted`. Delete propagation runs only for
///   deletions a different client reports, and for edits in forward mode.
pub struct TelegramClient {
    bot_token: SecretString,
    client: reqwest::Client,
    download_dir: PathBuf,
    settle: Duration,
    cache: Arc<UpdateCache>,
}

impl TelegramClient {
    pub fn new(bot_token: SecretString, download_dir: PathBuf, settle: Duration) -> Self {
        Self {
            bot_token,
            client: reqwest::Client::new(),
            download_dir,
            settle,
            cache: Arc::new(UpdateCache::default()),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{TELEGRAM_API}/bot{}/{method}", self.bot_token.expose_secret())
    }

    fn file_url(&self, file_path: &str) -> String {
        format!(
            "{TELEGRAM_API}/file/bot{}/{file_path}",
            self.bot_token.expose_secret()
        )
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: &Value) -> Result<T, PlatformError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| PlatformError::Http(e.to_string()))?;
        parse_response(resp).await
    }

    async fn call_multipart<T: DeserializeOwned>(
        &self,
        method: &str,
        form: Form,
    ) -> Result<T, PlatformError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .multipart(form)
            .send()
            .await
            .map_err(|e| PlatformError::Http(e.to_string()))?;
        parse_response(resp).await
    }

    /// Send `body` as JSON, or as multipart when local files must be uploaded.
    async fn call_with_uploads<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &Value,
        uploads: &[Upload],
    ) -> Result<T, PlatformError> {
        if uploads.is_empty() {
            return self.call(method, body).await;
        }

        let mut form = form_from_json(body);
        for upload in uploads {
            let file_name = upload
                .path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("file")
                .to_string();
            let file_bytes = tokio::fs::read(&upload.path).await?;
            form = form.part(upload.field.clone(), Part::bytes(file_bytes).file_name(file_name));
        }
        self.call_multipart(method, form).await
    }

    /// Identity of the bot, used to tell outgoing messages apart.
    pub async fn get_me(&self) -> Result<ChatInfo, PlatformError> {
        let me: Value = self.call("getMe", &json!({})).await?;
        parse_chat_info(&me)
    }

    /// Start long-polling for updates.
    pub fn start(&self, bot_id: i64) -> EventStream {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let url = self.api_url("getUpdates");
        let client = self.client.clone();
        let cache = Arc::clone(&self.cache);

        tokio::spawn(async move {
            let mut offset: i64 = 0;

            info!("Telegram client listening for updates...");
            info!(
                "Bot API limits: quizzes with hidden answers are skipped, deletions are not delivered"
            );

            loop {
                let body = json!({
                    "offset": offset,
                    "timeout": POLL_TIMEOUT_SECS,
                    "allowed_updates": [
                        "message",
                        "edited_message",
                        "channel_post",
                        "edited_channel_post"
                    ]
                });

                let resp = match client.post(&url).json(&body).send().await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("Telegram poll error: {e}");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let updates: Vec<Value> = match parse_response(resp).await {
                    Ok(u) => u,
                    Err(PlatformError::RateLimited { retry_after }) => {
                        tokio::time::sleep(retry_after.unwrap_or(Duration::from_secs(5))).await;
                        continue;
                    }
                    Err(e) => {
                        warn!("Telegram getUpdates failed: {e}");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                for update in &updates {
                    if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                        offset = uid + 1;
                    }

                    let Some(event) = parse_update(update, bot_id) else {
                        continue;
                    };
                    cache.observe(&event);

                    if tx.send(event).is_err() {
                        info!("Telegram listener channel closed");
                        return;
                    }
                }
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });

        Box::pin(stream)
    }
}

// ── PlatformClient implementation ───────────────────────────────────

#[async_trait]
impl PlatformClient for TelegramClient {
    async fn send(
        &self,
        chat: ChatId,
        content: &Content,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId, PlatformError> {
        let (method, body, uploads) = build_send(chat, content, reply_to);
        let sent: Value = self.call_with_uploads(method, &body, &uploads).await?;
        let id = message_id_of(&sent)?;

        if let Content::Text { text, .. } = content {
            self.cache.record_text(chat, text);
        }
        debug!(chat, id, method, "Telegram message sent");
        Ok(id)
    }

    async fn send_group(
        &self,
        chat: ChatId,
        items: &[Content],
        reply_to: Option<MessageId>,
    ) -> Result<Vec<MessageId>, PlatformError> {
        let mut media = Vec::with_capacity(items.len());
        let mut uploads = Vec::new();
        for (i, item) in items.iter().enumerate() {
            let (input, upload) = input_media(item, &format!("file{i}"))?;
            media.push(input);
            uploads.extend(upload);
        }

        let mut body = json!({ "chat_id": chat, "media": media });
        if let Some(anchor) = reply_to {
            body["reply_parameters"] = json!({ "message_id": anchor });
        }

        let sent: Vec<Value> = self
            .call_with_uploads("sendMediaGroup", &body, &uploads)
            .await?;
        sent.iter().map(message_id_of).collect()
    }

    async fn forward(
        &self,
        chat: ChatId,
        from_chat: ChatId,
        ids: &[MessageId],
    ) -> Result<Vec<MessageId>, PlatformError> {
        let body = json!({
            "chat_id": chat,
            "from_chat_id": from_chat,
            "message_ids": ids,
        });
        let forwarded: Vec<Value> = self.call("forwardMessages", &body).await?;
        forwarded.iter().map(message_id_of).collect()
    }

    async fn edit_text(
        &self,
        chat: ChatId,
        id: MessageId,
        text: &str,
    ) -> Result<(), PlatformError> {
        let body = json!({ "chat_id": chat, "message_id": id, "text": text });
        let _: Value = self.call("editMessageText", &body).await?;
        Ok(())
    }

    async fn edit_caption(
        &self,
        chat: ChatId,
        id: MessageId,
        caption: &str,
    ) -> Result<(), PlatformError> {
        let body = json!({ "chat_id": chat, "message_id": id, "caption": caption });
        let _: Value = self.call("editMessageCaption", &body).await?;
        Ok(())
    }

    async fn edit_media(
        &self,
        chat: ChatId,
        id: MessageId,
        content: &Content,
    ) -> Result<(), PlatformError> {
        let (media, upload) = input_media(content, "file0")?;
        let body = json!({ "chat_id": chat, "message_id": id, "media": media });
        let uploads: Vec<Upload> = upload.into_iter().collect();
        let _: Value = self
            .call_with_uploads("editMessageMedia", &body, &uploads)
            .await?;
        Ok(())
    }

    async fn delete(&self, chat: ChatId, ids: &[MessageId]) -> Result<(), PlatformError> {
        let body = json!({ "chat_id": chat, "message_ids": ids });
        let _: Value = self.call("deleteMessages", &body).await?;
        Ok(())
    }

    async fn pin(&self, chat: ChatId, id: MessageId) -> Result<(), PlatformError> {
        let body = json!({ "chat_id": chat, "message_id": id });
        let _: Value = self.call("pinChatMessage", &body).await?;
        Ok(())
    }

    async fn last_message_text(&self, chat: ChatId) -> Result<Option<String>, PlatformError> {
        Ok(self.cache.last_text(chat))
    }

    async fn get_grouped_items(
        &self,
        chat: ChatId,
        id: MessageId,
    ) -> Result<Vec<Message>, PlatformError> {
        tokio::time::sleep(self.settle).await;
        self.cache
            .group_of(chat, id)
            .ok_or(PlatformError::MessageIdInvalid)
    }

    async fn resolve_chat(&self, reference: &str) -> Result<ChatInfo, PlatformError> {
        let chat_id = match reference.parse::<i64>() {
            Ok(id) => json!(id),
            Err(_) if reference.starts_with('@') => json!(reference),
            Err(_) => json!(format!("@{reference}")),
        };
        let chat: Value = self.call("getChat", &json!({ "chat_id": chat_id })).await?;
        parse_chat_info(&chat)
    }

    async fn download(&self, source: &MediaSource) -> Result<PathBuf, PlatformError> {
        let MediaSource::FileId(file_id) = source else {
            return Err(PlatformError::Unsupported("media is already local".into()));
        };

        let file: Value = self.call("getFile", &json!({ "file_id": file_id })).await?;
        let file_path = file
            .get("file_path")
            .and_then(Value::as_str)
            .ok_or_else(|| PlatformError::InvalidResponse("getFile without file_path".into()))?;

        let bytes = self
            .client
            .get(self.file_url(file_path))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| PlatformError::Http(e.to_string()))?
            .bytes()
            .await
            .map_err(|e| PlatformError::Http(e.to_string()))?;

        let extension = Path::new(file_path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin");
        tokio::fs::create_dir_all(&self.download_dir).await?;
        let local = self
            .download_dir
            .join(format!("{}.{extension}", uuid::Uuid::new_v4()));
        tokio::fs::write(&local, &bytes).await?;

        debug!(path = %local.display(), size = bytes.len(), "Downloaded media");
        Ok(local)
    }

    async fn vote_poll(
        &self,
        _chat: ChatId,
        _id: MessageId,
        _option: usize,
    ) -> Result<QuizAnswer, PlatformError> {
        Err(PlatformError::Unsupported(
            "bot accounts cannot vote in polls".into(),
        ))
    }
}

// ── Update cache ────────────────────────────────────────────────────

#[derive(Default)]
struct UpdateCache {
    groups: Mutex<HashMap<(ChatId, String), GroupBuffer>>,
    texts: Mutex<HashMap<ChatId, (String, Instant)>>,
}

struct GroupBuffer {
    items: Vec<Message>,
    updated: Instant,
}

impl UpdateCache {
    fn observe(&self, event: &InboundEvent) {
        let InboundEvent::New(msg) = event else {
            return;
        };

        if let Content::Text { text, .. } = &msg.content {
            self.record_text(msg.chat.id, text);
        }

        let Some(group_id) = &msg.media_group_id else {
            return;
        };
        let now = Instant::now();
        let mut groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner);
        groups.retain(|_, g| now.duration_since(g.updated) < CACHE_TTL);

        let buffer = groups
            .entry((msg.chat.id, group_id.clone()))
            .or_insert_with(|| GroupBuffer {
                items: Vec::new(),
                updated: now,
            });
        if !buffer.items.iter().any(|m| m.id == msg.id) {
            buffer.items.push(msg.clone());
            buffer.items.sort_by_key(|m| m.id);
        }
        buffer.updated = now;
    }

    fn record_text(&self, chat: ChatId, text: &str) {
        let now = Instant::now();
        let mut texts = self.texts.lock().unwrap_or_else(PoisonError::into_inner);
        texts.retain(|_, (_, at)| now.duration_since(*at) < CACHE_TTL);
        texts.insert(chat, (text.to_string(), now));
    }

    fn last_text(&self, chat: ChatId) -> Option<String> {
        let texts = self.texts.lock().unwrap_or_else(PoisonError::into_inner);
        texts.get(&chat).map(|(text, _)| text.clone())
    }

    fn group_of(&self, chat: ChatId, id: MessageId) -> Option<Vec<Message>> {
        let groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner);
        groups
            .iter()
            .find(|((c, _), g)| *c == chat && g.items.iter().any(|m| m.id == id))
            .map(|(_, g)| g.items.clone())
    }
}

// ── Request building ────────────────────────────────────────────────

/// A local file attached to a multipart request.
#[derive(Debug, Clone, PartialEq)]
struct Upload {
    field: String,
    path: PathBuf,
}

/// Bot API method and form field for each file kind.
fn file_method(kind: FileKind) -> (&'static str, &'static str) {
    match kind {
        FileKind::Photo => ("sendPhoto", "photo"),
        FileKind::Video => ("sendVideo", "video"),
        FileKind::Audio => ("sendAudio", "audio"),
        FileKind::Voice => ("sendVoice", "voice"),
        FileKind::Document => ("sendDocument", "document"),
        FileKind::Animation => ("sendAnimation", "animation"),
        FileKind::Sticker => ("sendSticker", "sticker"),
        FileKind::VideoNote => ("sendVideoNote", "video_note"),
    }
}

/// Build the method, JSON body and uploads for sending `content`.
fn build_send(
    chat: ChatId,
    content: &Content,
    reply_to: Option<MessageId>,
) -> (&'static str, Value, Vec<Upload>) {
    let mut uploads = Vec::new();
    let (method, mut body) = match content {
        Content::Text { text, .. } => ("sendMessage", json!({ "chat_id": chat, "text": text })),
        Content::File {
            kind,
            source,
            caption,
        } => {
            let (method, field) = file_method(*kind);
            let mut body = json!({ "chat_id": chat });
            match source {
                MediaSource::FileId(id) => body[field] = json!(id),
                MediaSource::Local(path) => uploads.push(Upload {
                    field: field.to_string(),
                    path: path.clone(),
                }),
            }
            if let Some(cap) = caption.as_deref().filter(|_| kind.accepts_caption()) {
                body["caption"] = json!(cap);
            }
            (method, body)
        }
        Content::Location {
            latitude,
            longitude,
        } => (
            "sendLocation",
            json!({ "chat_id": chat, "latitude": latitude, "longitude": longitude }),
        ),
        Content::Venue {
            latitude,
            longitude,
            title,
            address,
        } => (
            "sendVenue",
            json!({
                "chat_id": chat,
                "latitude": latitude,
                "longitude": longitude,
                "title": title,
                "address": address,
            }),
        ),
        Content::Contact {
            phone_number,
            first_name,
            last_name,
        } => {
            let mut body = json!({
                "chat_id": chat,
                "phone_number": phone_number,
                "first_name": first_name,
            });
            if let Some(last) = last_name {
                body["last_name"] = json!(last);
            }
            ("sendContact", body)
        }
        Content::Dice { emoji } => ("sendDice", json!({ "chat_id": chat, "emoji": emoji })),
        Content::Poll(poll) => ("sendPoll", poll_body(chat, poll)),
    };

    if let Some(anchor) = reply_to {
        body["reply_parameters"] = json!({ "message_id": anchor });
    }
    (method, body, uploads)
}

fn poll_body(chat: ChatId, poll: &Poll) -> Value {
    let options: Vec<Value> = poll.options.iter().map(|o| json!({ "text": o })).collect();
    let mut body = json!({
        "chat_id": chat,
        "question": poll.question,
        "options": options,
        "is_anonymous": poll.is_anonymous,
        "type": match poll.kind {
            PollKind::Regular => "regular",
            PollKind::Quiz => "quiz",
        },
        "allows_multiple_answers": poll.allows_multiple_answers,
    });
    if poll.kind == PollKind::Quiz {
        if let Some(correct) = poll.correct_option {
            body["correct_option_id"] = json!(correct);
        }
        if let Some(explanation) = &poll.explanation {
            body["explanation"] = json!(explanation);
        }
    }
    body
}

/// Build an InputMedia object. Local files are referenced as `attach://name`.
fn input_media(content: &Content, attach_name: &str) -> Result<(Value, Option<Upload>), PlatformError> {
    let Content::File {
        kind,
        source,
        caption,
    } = content
    else {
        return Err(PlatformError::Unsupported(
            "only file attachments can be sent as input media".into(),
        ));
    };

    let media_type = match kind {
        FileKind::Photo => "photo",
        FileKind::Video => "video",
        FileKind::Audio => "audio",
        FileKind::Document => "document",
        FileKind::Animation => "animation",
        other => {
            return Err(PlatformError::Unsupported(format!(
                "{other:?} cannot be used as input media"
            )));
        }
    };

    let (media, upload) = match source {
        MediaSource::FileId(id) => (json!(id), None),
        MediaSource::Local(path) => (
            json!(format!("attach://{attach_name}")),
            Some(Upload {
                field: attach_name.to_string(),
                path: path.clone(),
            }),
        ),
    };

    let mut input = json!({ "type": media_type, "media": media });
    if let Some(cap) = caption {
        input["caption"] = json!(cap);
    }
    Ok((input, upload))
}

/// Flatten a JSON body into multipart text fields.
fn form_from_json(body: &Value) -> Form {
    let mut form = Form::new();
    if let Some(map) = body.as_object() {
        for (key, value) in map {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            form = form.text(key.clone(), text);
        }
    }
    form
}

// ── Response handling ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

async fn parse_response<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, PlatformError> {
    let data: ApiResponse = resp
        .json()
        .await
        .map_err(|e| PlatformError::InvalidResponse(e.to_string()))?;
    into_result(data)
}

fn into_result<T: DeserializeOwned>(data: ApiResponse) -> Result<T, PlatformError> {
    if data.ok {
        return serde_json::from_value(data.result.unwrap_or(Value::Null))
            .map_err(|e| PlatformError::InvalidResponse(e.to_string()));
    }

    let retry_after = data.parameters.and_then(|p| p.retry_after);
    Err(classify_error(
        data.error_code.unwrap_or(0),
        data.description.as_deref().unwrap_or_default(),
        retry_after,
    ))
}

/// Map a Bot API error onto the platform error the relay reacts to.
fn classify_error(code: i64, description: &str, retry_after: Option<u64>) -> PlatformError {
    let lower = description.to_lowercase();
    if code == 429 {
        PlatformError::RateLimited {
            retry_after: retry_after.map(Duration::from_secs),
        }
    } else if lower.contains("message is not modified") {
        PlatformError::MessageNotModified
    } else if lower.contains("chat not found") {
        PlatformError::ChatNotFound(description.to_string())
    } else if lower.contains("message_id_invalid")
        || (lower.contains("message") && lower.contains("not found"))
    {
        PlatformError::MessageIdInvalid
    } else if code == 403 {
        PlatformError::Forbidden(description.to_string())
    } else {
        PlatformError::Api {
            code,
            description: description.to_string(),
        }
    }
}

fn message_id_of(message: &Value) -> Result<MessageId, PlatformError> {
    message
        .get("message_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| PlatformError::InvalidResponse("missing message_id".into()))
}

// ── Update parsing ──────────────────────────────────────────────────

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(String::from)
}

fn display_name(value: &Value) -> String {
    if let Some(title) = str_field(value, "title") {
        return title;
    }
    let first = str_field(value, "first_name").unwrap_or_default();
    match str_field(value, "last_name") {
        Some(last) => format!("{first} {last}"),
        None => first,
    }
}

fn parse_chat_info(value: &Value) -> Result<ChatInfo, PlatformError> {
    let id = value
        .get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| PlatformError::InvalidResponse("chat without id".into()))?;
    Ok(ChatInfo {
        id,
        title: display_name(value),
        username: str_field(value, "username"),
    })
}

/// Convert one getUpdates entry into an event.
fn parse_update(update: &Value, bot_id: i64) -> Option<InboundEvent> {
    if let Some(msg) = update.get("message").or_else(|| update.get("channel_post")) {
        if let Some(pinned) = msg.get("pinned_message") {
            let message = parse_message(msg, bot_id);
            let chat = match &message {
                Some(m) => m.chat.clone(),
                None => parse_chat(msg)?,
            };
            return Some(InboundEvent::Pinned {
                chat,
                pinned_id: pinned.get("message_id").and_then(Value::as_i64)?,
                outgoing: is_outgoing(msg, bot_id),
            });
        }
        return parse_message(msg, bot_id).map(InboundEvent::New);
    }

    update
        .get("edited_message")
        .or_else(|| update.get("edited_channel_post"))
        .and_then(|msg| parse_message(msg, bot_id))
        .map(InboundEvent::Edited)
}

fn parse_chat(msg: &Value) -> Option<Chat> {
    let chat = msg.get("chat")?;
    Some(Chat {
        id: chat.get("id").and_then(Value::as_i64)?,
        title: display_name(chat),
        protected_content: msg
            .get("has_protected_content")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

fn is_outgoing(msg: &Value, bot_id: i64) -> bool {
    msg.get("from")
        .and_then(|f| f.get("id"))
        .and_then(Value::as_i64)
        .is_some_and(|id| id == bot_id)
}

fn parse_message(msg: &Value, bot_id: i64) -> Option<Message> {
    Some(Message {
        id: msg.get("message_id").and_then(Value::as_i64)?,
        chat: parse_chat(msg)?,
        content: parse_content(msg)?,
        outgoing: is_outgoing(msg, bot_id),
        media_group_id: str_field(msg, "media_group_id"),
        reply_to: msg
            .get("reply_to_message")
            .and_then(|r| r.get("message_id"))
            .and_then(Value::as_i64),
    })
}

fn parse_content(msg: &Value) -> Option<Content> {
    if let Some(text) = str_field(msg, "text") {
        let web_preview = msg
            .get("entities")
            .and_then(Value::as_array)
            .is_some_and(|entities| {
                entities.iter().any(|e| {
                    matches!(
                        e.get("type").and_then(Value::as_str),
                        Some("url") | Some("text_link")
                    )
                })
            });
        return Some(Content::Text { text, web_preview });
    }

    let caption = str_field(msg, "caption");

    // Photos arrive as a list of sizes, largest last.
    if let Some(sizes) = msg.get("photo").and_then(Value::as_array) {
        let file_id = sizes.last().and_then(|s| str_field(s, "file_id"))?;
        return Some(Content::File {
            kind: FileKind::Photo,
            source: MediaSource::FileId(file_id),
            caption,
        });
    }

    // Animation messages also carry a `document`, so check them first.
    const FILE_FIELDS: &[(&str, FileKind)] = &[
        ("animation", FileKind::Animation),
        ("video", FileKind::Video),
        ("audio", FileKind::Audio),
        ("voice", FileKind::Voice),
        ("document", FileKind::Document),
        ("sticker", FileKind::Sticker),
        ("video_note", FileKind::VideoNote),
    ];
    for (field, kind) in FILE_FIELDS {
        if let Some(file_id) = msg.get(*field).and_then(|f| str_field(f, "file_id")) {
            return Some(Content::File {
                kind: *kind,
                source: MediaSource::FileId(file_id),
                caption,
            });
        }
    }

    // Venue messages also carry a `location`.
    if let Some(venue) = msg.get("venue") {
        let location = venue.get("location")?;
        return Some(Content::Venue {
            latitude: location.get("latitude").and_then(Value::as_f64)?,
            longitude: location.get("longitude").and_then(Value::as_f64)?,
            title: str_field(venue, "title").unwrap_or_default(),
            address: str_field(venue, "address").unwrap_or_default(),
        });
    }
    if let Some(location) = msg.get("location") {
        return Some(Content::Location {
            latitude: location.get("latitude").and_then(Value::as_f64)?,
            longitude: location.get("longitude").and_then(Value::as_f64)?,
        });
    }
    if let Some(contact) = msg.get("contact") {
        return Some(Content::Contact {
            phone_number: str_field(contact, "phone_number")?,
            first_name: str_field(contact, "first_name").unwrap_or_default(),
            last_name: str_field(contact, "last_name"),
        });
    }
    if let Some(dice) = msg.get("dice") {
        return Some(Content::Dice {
            emoji: str_field(dice, "emoji").unwrap_or_else(|| "🎲".into()),
        });
    }
    if let Some(poll) = msg.get("poll") {
        return Some(Content::Poll(Poll {
            question: str_field(poll, "question")?,
            options: poll
                .get("options")
                .and_then(Value::as_array)
                .map(|opts| opts.iter().filter_map(|o| str_field(o, "text")).collect())
                .unwrap_or_default(),
            kind: match poll.get("type").and_then(Value::as_str) {
                Some("quiz") => PollKind::Quiz,
                _ => PollKind::Regular,
            },
            is_anonymous: poll.get("is_anonymous").and_then(Value::as_bool).unwrap_or(true),
            allows_multiple_answers: poll
                .get("allows_multiple_answers")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            correct_option: poll
                .get("correct_option_id")
                .and_then(Value::as_u64)
                .map(|v| v as usize),
            explanation: str_field(poll, "explanation"),
        }));
    }

    None
}

// ── Tests ───────────────────────────────────────────────────────────
