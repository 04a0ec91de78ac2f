use std::path::Path;
use std::path::PathBuf;

pub(crate) const APP_SERVER_SUBDIR: &str = "app_server";
pub(crate) const CONVERSATIONS_SUBDIR: &str = "conversations";
pub(crate) const CONFIG_FILENAME: &str = "app_server_config.json";
pub(crate) const META_FILENAME: &str = "conversation_meta.json";
pub(crate) const TRANSCRIPT_FILENAME: &str = "transcript.jsonl";
pub(crate) const AGENT_PTY_SUBDIR: &str = "agent_pty";

/// `$XDG_CACHE_HOME` when set, else `~/.cache`, else the cwd as a last
/// resort so the service can still come up in stripped-down containers.
pub fn default_cache_root() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CACHE_HOME")
        && !xdg.is_empty()
    {
        return PathBuf::from(xdg);
    }
    dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Crash-safe JSON write: serialize to a sibling temp file, then rename over
/// the destination.
pub(crate) async fn write_json_atomic<T: serde::Serialize>(
    path: &Path,
    value: &T,
) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| std::io::Error::other(format!("serialize {}: {e}", path.display())))?;
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, &json).await?;
    match tokio::fs::rename(&tmp, path).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(e)
        }
    }
}
