use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use fws_protocol::ConversationMeta;
use fws_protocol::ConversationSettings;
use fws_protocol::ConversationStatus;
use fws_protocol::FwsErr;
use fws_protocol::Result;
use fws_protocol::TranscriptEntry;
use fws_protocol::TranscriptItem;

use crate::config::AppServerConfig;
use crate::paths;
use crate::transcript;
use crate::transcript::TranscriptRange;

/// Per-conversation serialization state: one lock for meta writes, one for
/// transcript appends (with the cached next sequence number).
#[derive(Default)]
struct ConversationLocks {
    meta: Mutex<()>,
    transcript: Mutex<Option<u64>>,
}

pub struct ConversationStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<ConversationLocks>>>,
    config: Mutex<()>,
}

impl ConversationStore {
    /// `cache_root` is the XDG-style cache directory; everything lives under
    /// `<cache_root>/app_server/`.
    pub fn new(cache_root: &Path) -> Result<Self> {
        let root = cache_root.join(paths::APP_SERVER_SUBDIR);
        std::fs::create_dir_all(root.join(paths::CONVERSATIONS_SUBDIR))?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
            config: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn conversation_dir(&self, id: &str) -> PathBuf {
        self.root.join(paths::CONVERSATIONS_SUBDIR).join(id)
    }

    /// Directory owned by the PTY core for this conversation.
    pub fn agent_pty_dir(&self, id: &str) -> PathBuf {
        self.conversation_dir(id).join(paths::AGENT_PTY_SUBDIR)
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.conversation_dir(id).join(paths::META_FILENAME)
    }

    fn transcript_path(&self, id: &str) -> PathBuf {
        self.conversation_dir(id).join(paths::TRANSCRIPT_FILENAME)
    }

    fn config_path(&self) -> PathBuf {
        self.root.join(paths::CONFIG_FILENAME)
    }

    async fn locks_for(&self, id: &str) -> Arc<ConversationLocks> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(ConversationLocks::default()))
            .clone()
    }

    // ------------------------------------------------------------------
    // Conversation lifecycle
    // ------------------------------------------------------------------

    pub async fn create_conversation(&self) -> Result<ConversationMeta> {
        let id = Uuid::new_v4().to_string();
        let dir = self.conversation_dir(&id);
        tokio::fs::create_dir_all(&dir).await?;
        let meta = ConversationMeta::new(id);
        paths::write_json_atomic(&self.meta_path(&meta.conversation_id), &meta).await?;
        Ok(meta)
    }

    /// Directory scan ordered by `created_at` descending.
    pub async fn list_conversations(&self) -> Result<Vec<ConversationMeta>> {
        let mut out = Vec::new();
        let conversations = self.root.join(paths::CONVERSATIONS_SUBDIR);
        let mut dir = tokio::fs::read_dir(&conversations).await?;
        while let Some(entry) = dir.next_entry().await? {
            let meta_path = entry.path().join(paths::META_FILENAME);
            match tokio::fs::read(&meta_path).await {
                Ok(bytes) => match serde_json::from_slice::<ConversationMeta>(&bytes) {
                    Ok(meta) => out.push(meta),
                    Err(e) => {
                        tracing::warn!("skipping unreadable meta {}: {e}", meta_path.display());
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    /// Deletion clears the active pointer first so no reader can observe a
    /// dangling active conversation.
    pub async fn delete_conversation(&self, id: &str) -> Result<()> {
        let config = self.load_config().await?;
        if config.active_conversation_id.as_deref() == Some(id) {
            self.select(None, config.active_view.clone()).await?;
        }
        let dir = self.conversation_dir(id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FwsErr::NotFound(format!("conversation {id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    // ------------------------------------------------------------------
    // Active pointer
    // ------------------------------------------------------------------

    pub async fn load_config(&self) -> Result<AppServerConfig> {
        match tokio::fs::read(self.config_path()).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppServerConfig::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Update the process-wide active pointer (single writer, many readers).
    pub async fn select(&self, id: Option<String>, view: Option<String>) -> Result<AppServerConfig> {
        let _guard = self.config.lock().await;
        if let Some(id) = &id
            && !tokio::fs::try_exists(self.meta_path(id)).await.unwrap_or(false)
        {
            return Err(FwsErr::NotFound(format!("conversation {id}")));
        }
        let config = AppServerConfig {
            active_conversation_id: id,
            active_view: view,
        };
        paths::write_json_atomic(&self.config_path(), &config).await?;
        Ok(config)
    }

    // ------------------------------------------------------------------
    // Meta (SSOT)
    // ------------------------------------------------------------------

    pub async fn load_meta(&self, id: &str) -> Result<ConversationMeta> {
        match tokio::fs::read(self.meta_path(id)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FwsErr::NotFound(format!("conversation {id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Crash-safe save. `conversation_id` is immutable and `thread_id` is
    /// write-once: overwriting a bound thread id with a different value (or
    /// clearing it) fails with `immutable_thread_id`.
    pub async fn save_meta(&self, id: &str, meta: ConversationMeta) -> Result<ConversationMeta> {
        let locks = self.locks_for(id).await;
        let _guard = locks.meta.lock().await;

        let current = self.load_meta(id).await?;
        if meta.conversation_id != current.conversation_id {
            return Err(FwsErr::Validation(
                "conversation_id cannot change".to_string(),
            ));
        }
        if let Some(bound) = &current.thread_id
            && meta.thread_id.as_ref() != Some(bound)
        {
            return Err(FwsErr::ImmutableThreadId);
        }

        paths::write_json_atomic(&self.meta_path(id), &meta).await?;
        Ok(meta)
    }

    /// Bind the upstream thread id and mark the conversation active.
    pub async fn bind_thread(&self, id: &str, thread_id: &str) -> Result<ConversationMeta> {
        let mut meta = self.load_meta(id).await?;
        match &meta.thread_id {
            Some(existing) if existing == thread_id => return Ok(meta),
            Some(_) => return Err(FwsErr::ImmutableThreadId),
            None => {}
        }
        meta.thread_id = Some(thread_id.to_string());
        meta.status = ConversationStatus::Active;
        self.save_meta(id, meta).await
    }

    /// Merge non-empty settings fields into the SSOT.
    pub async fn update_settings(
        &self,
        id: &str,
        patch: ConversationSettings,
    ) -> Result<ConversationMeta> {
        let mut meta = self.load_meta(id).await?;
        let settings = &mut meta.settings;
        if patch.cwd.is_some() {
            settings.cwd = patch.cwd;
        }
        if patch.model.is_some() {
            settings.model = patch.model;
        }
        if patch.approval_policy.is_some() {
            settings.approval_policy = patch.approval_policy;
        }
        if patch.sandbox_policy.is_some() {
            settings.sandbox_policy = patch.sandbox_policy;
        }
        if patch.effort.is_some() {
            settings.effort = patch.effort;
        }
        if patch.summary.is_some() {
            settings.summary = patch.summary;
        }
        if patch.agent.is_some() {
            settings.agent = patch.agent;
        }
        if patch.markdown.is_some() {
            settings.markdown = patch.markdown;
        }
        self.save_meta(id, meta).await
    }

    // ------------------------------------------------------------------
    // Transcript
    // ------------------------------------------------------------------

    /// Append under the conversation's append lock, assigning the next dense
    /// sequence number. Returns the assigned `msg_num`.
    pub async fn append_transcript(&self, id: &str, item: TranscriptItem) -> Result<u64> {
        let path = self.transcript_path(id);
        if !tokio::fs::try_exists(self.meta_path(id)).await.unwrap_or(false) {
            return Err(FwsErr::NotFound(format!("conversation {id}")));
        }

        let locks = self.locks_for(id).await;
        let mut next = locks.transcript.lock().await;
        let msg_num = match *next {
            Some(n) => n,
            None => transcript::count_entries(&path).await?,
        };

        let entry = TranscriptEntry {
            msg_num,
            ts: Utc::now(),
            item,
        };
        transcript::append_line(&path, &entry).await?;
        *next = Some(msg_num + 1);
        Ok(msg_num)
    }

    /// Entries with `from <= msg_num < to`.
    pub async fn range(&self, id: &str, from: u64, to: u64) -> Result<TranscriptRange> {
        transcript::read_range(&self.transcript_path(id), from, to).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn store() -> (tempfile::TempDir, ConversationStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let (_dir, store) = store().await;
        let mut meta = store.create_conversation().await.unwrap();
        meta.label = Some("demo".into());
        meta.settings.model = Some("gpt-5".into());
        let saved = store
            .save_meta(&meta.conversation_id.clone(), meta)
            .await
            .unwrap();
        let loaded = store.load_meta(&saved.conversation_id).await.unwrap();
        assert_eq!(loaded.label.as_deref(), Some("demo"));
        assert_eq!(loaded.settings.model.as_deref(), Some("gpt-5"));
    }

    #[tokio::test]
    async fn thread_id_is_write_once() {
        let (_dir, store) = store().await;
        let meta = store.create_conversation().await.unwrap();
        let id = meta.conversation_id.clone();

        store.bind_thread(&id, "T1").await.unwrap();

        // Same value is fine, new value is rejected.
        store.bind_thread(&id, "T1").await.unwrap();
        let err = store.bind_thread(&id, "T2").await.unwrap_err();
        assert!(matches!(err, FwsErr::ImmutableThreadId));

        // A full save attempting to clear it is rejected too.
        let mut cleared = store.load_meta(&id).await.unwrap();
        cleared.thread_id = None;
        let err = store.save_meta(&id, cleared).await.unwrap_err();
        assert!(matches!(err, FwsErr::ImmutableThreadId));

        // Disk still holds the original binding.
        let on_disk = store.load_meta(&id).await.unwrap();
        assert_eq!(on_disk.thread_id.as_deref(), Some("T1"));
    }

    #[tokio::test]
    async fn transcript_sequence_is_dense_and_survives_reload() {
        let (_dir, store) = store().await;
        let meta = store.create_conversation().await.unwrap();
        let id = meta.conversation_id.clone();

        for i in 0..3u64 {
            let n = store
                .append_transcript(&id, TranscriptItem::User {
                    text: format!("m{i}"),
                })
                .await
                .unwrap();
            assert_eq!(n, i);
        }

        // A fresh store over the same directory continues the sequence.
        let store2 = ConversationStore::new(_dir.path()).unwrap();
        let n = store2
            .append_transcript(&id, TranscriptItem::User { text: "m3".into() })
            .await
            .unwrap();
        assert_eq!(n, 3);

        let range = store2.range(&id, 1, 3).await.unwrap();
        assert_eq!(range.total, 4);
        let nums: Vec<u64> = range.entries.iter().map(|e| e.msg_num).collect();
        assert_eq!(nums, vec![1, 2]);
    }

    #[tokio::test]
    async fn delete_clears_active_pointer_first() {
        let (_dir, store) = store().await;
        let meta = store.create_conversation().await.unwrap();
        let id = meta.conversation_id.clone();
        store
            .select(Some(id.clone()), Some("chat".into()))
            .await
            .unwrap();

        store.delete_conversation(&id).await.unwrap();

        let config = store.load_config().await.unwrap();
        assert_eq!(config.active_conversation_id, None);
        assert_eq!(config.active_view.as_deref(), Some("chat"));
        assert!(matches!(
            store.load_meta(&id).await.unwrap_err(),
            FwsErr::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn list_orders_newest_first() {
        let (_dir, store) = store().await;
        let first = store.create_conversation().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = store.create_conversation().await.unwrap();

        let listed = store.list_conversations().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].conversation_id, second.conversation_id);
        assert_eq!(listed[1].conversation_id, first.conversation_id);
    }
}
