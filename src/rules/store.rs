//! Durable forwarder registry backed by `forwarding.json`.
//!
//! Readers take a snapshot clone per event, so admin edits never block
//! dispatch. Every mutation is applied to a copy, written to disk through a
//! temp file + rename, and only then swapped in.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::RuleError;
use crate::platform::ChatId;
use crate::rules::model::{Forwarder, ForwardingMode, RuleFile};

pub struct RuleStore {
    path: PathBuf,
    state: RwLock<RuleFile>,
}

impl RuleStore {
    /// Load the rule file, creating it with an empty registry when missing.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, RuleError> {
        let path = path.into();

        let file = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<RuleFile>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Rule file not found, creating an empty one");
                let file = RuleFile::default();
                persist(&path, &file).await?;
                file
            }
            Err(e) => return Err(e.into()),
        };

        check_unique_targets(&file)?;
        info!(
            path = %path.display(),
            forwarders = file.forwarders.len(),
            "Rule file loaded"
        );

        Ok(Self {
            path,
            state: RwLock::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Consistent copy of the whole registry.
    pub async fn snapshot(&self) -> RuleFile {
        self.state.read().await.clone()
    }

    /// Whether any forwarder lists `chat` as a source.
    pub async fn is_source(&self, chat: ChatId) -> bool {
        self.state
            .read()
            .await
            .forwarders
            .iter()
            .any(|f| f.has_source(chat))
    }

    pub async fn list(&self) -> Vec<Forwarder> {
        self.state.read().await.forwarders.clone()
    }

    pub async fn get(&self, target: ChatId) -> Result<Forwarder, RuleError> {
        self.state
            .read()
            .await
            .forwarders
            .iter()
            .find(|f| f.target == target)
            .cloned()
            .ok_or(RuleError::NotFound { target })
    }

    pub async fn create(&self, forwarder: Forwarder) -> Result<(), RuleError> {
        let target = forwarder.target;
        self.mutate(|file| {
            if file.forwarders.iter().any(|f| f.target == target) {
                return Err(RuleError::DuplicateTarget { target });
            }
            file.forwarders.push(forwarder);
            Ok(())
        })
        .await?;
        info!(target_chat = target, "Forwarder created");
        Ok(())
    }

    /// Replace the forwarder with the same target.
    pub async fn update(&self, forwarder: Forwarder) -> Result<(), RuleError> {
        let target = forwarder.target;
        self.mutate_forwarder(target, move |f| *f = forwarder).await
    }

    pub async fn remove(&self, target: ChatId) -> Result<Forwarder, RuleError> {
        let removed = self
            .mutate(|file| {
                let idx = file
                    .forwarders
                    .iter()
                    .position(|f| f.target == target)
                    .ok_or(RuleError::NotFound { target })?;
                Ok(file.forwarders.remove(idx))
            })
            .await?;
        info!(target_chat = target, "Forwarder removed");
        Ok(removed)
    }

    /// Flip `enabled`, returning the new value.
    pub async fn toggle_enabled(&self, target: ChatId) -> Result<bool, RuleError> {
        self.mutate_forwarder(target, |f| {
            f.enabled = !f.enabled;
            f.enabled
        })
        .await
    }

    /// Switch between copy and forward mode, returning the new mode.
    pub async fn toggle_mode(&self, target: ChatId) -> Result<ForwardingMode, RuleError> {
        self.mutate_forwarder(target, |f| {
            f.forwarding_mode = f.forwarding_mode.toggled();
            f.forwarding_mode
        })
        .await
    }

    pub async fn add_replacements(
        &self,
        target: ChatId,
        pairs: Vec<(String, String)>,
    ) -> Result<(), RuleError> {
        self.mutate_forwarder(target, |f| {
            for (word, replacement) in pairs {
                f.replace_words.insert(word, replacement);
            }
        })
        .await
    }

    pub async fn remove_replacement(&self, target: ChatId, word: &str) -> Result<bool, RuleError> {
        self.mutate_forwarder(target, |f| f.replace_words.remove(word))
            .await
    }

    /// Returns false when the word was already blocked.
    pub async fn add_blocked_word(&self, target: ChatId, word: &str) -> Result<bool, RuleError> {
        let word = word.trim();
        if word.is_empty() {
            return Err(RuleError::InvalidInput("blocked word is empty".into()));
        }
        self.mutate_forwarder(target, |f| {
            if f.blocked_words.iter().any(|w| w.eq_ignore_ascii_case(word)) {
                return false;
            }
            f.blocked_words.push(word.to_string());
            true
        })
        .await
    }

    pub async fn remove_blocked_word(&self, target: ChatId, word: &str) -> Result<bool, RuleError> {
        self.mutate_forwarder(target, |f| {
            let before = f.blocked_words.len();
            f.blocked_words.retain(|w| w != word);
            f.blocked_words.len() != before
        })
        .await
    }

    pub async fn add_sources(
        &self,
        target: ChatId,
        sources: BTreeMap<ChatId, String>,
    ) -> Result<(), RuleError> {
        if sources.contains_key(&target) {
            return Err(RuleError::InvalidInput(format!(
                "chat {target} cannot be a source of itself"
            )));
        }
        self.mutate_forwarder(target, |f| f.source.extend(sources))
            .await
    }

    pub async fn remove_source(&self, target: ChatId, source: ChatId) -> Result<bool, RuleError> {
        self.mutate_forwarder(target, |f| f.source.remove(&source).is_some())
            .await
    }

    pub async fn rename(&self, target: ChatId, name: &str) -> Result<(), RuleError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RuleError::InvalidInput("name is empty".into()));
        }
        self.mutate_forwarder(target, |f| f.name = name.to_string())
            .await
    }

    pub async fn blocked_images(&self) -> Vec<String> {
        self.state.read().await.blocked_images.clone()
    }

    pub async fn add_blocked_image(&self, image: impl Into<String>) -> Result<(), RuleError> {
        let image = image.into();
        self.mutate(|file| {
            if !file.blocked_images.contains(&image) {
                file.blocked_images.push(image);
            }
            Ok(())
        })
        .await
    }

    /// Apply `f` to a copy of the registry, persist it, then publish it.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut RuleFile) -> Result<T, RuleError>,
    ) -> Result<T, RuleError> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let out = f(&mut next)?;
        persist(&self.path, &next).await?;
        *state = next;
        Ok(out)
    }

    async fn mutate_forwarder<T>(
        &self,
        target: ChatId,
        f: impl FnOnce(&mut Forwarder) -> T,
    ) -> Result<T, RuleError> {
        let out = self
            .mutate(|file| {
                let forwarder = file
                    .forwarders
                    .iter_mut()
                    .find(|fw| fw.target == target)
                    .ok_or(RuleError::NotFound { target })?;
                Ok(f(forwarder))
            })
            .await?;
        debug!(target_chat = target, "Forwarder updated");
        Ok(out)
    }
}

fn check_unique_targets(file: &RuleFile) -> Result<(), RuleError> {
    let mut seen = HashSet::new();
    for f in &file.forwarders {
        if !seen.insert(f.target) {
            return Err(RuleError::DuplicateTarget { target: f.target });
        }
    }
    Ok(())
}

async fn persist(path: &Path, file: &RuleFile) -> Result<(), RuleError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(file)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
