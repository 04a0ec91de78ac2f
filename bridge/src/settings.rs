//! SSOT settings injection.
//!
//! For `thread/resume`, `thread/start` and `turn/start` the bridge overlays
//! the conversation's meta onto the outbound params using a per-method
//! whitelist. Empty values are omitted so the child's own defaults apply;
//! the SSOT is re-read on every call, so a model change takes effect on the
//! next resume/turn.

use serde_json::Value;

use fws_protocol::ConversationSettings;

pub(crate) const INJECTED_METHODS: [&str; 3] = ["thread/resume", "thread/start", "turn/start"];

pub(crate) fn inject_settings(method: &str, params: &mut Value, settings: &ConversationSettings) {
    if !INJECTED_METHODS.contains(&method) {
        return;
    }
    if !params.is_object() {
        *params = Value::Object(serde_json::Map::new());
    }
    let Some(object) = params.as_object_mut() else {
        return;
    };

    let mut set = |key: &str, value: Option<Value>| {
        if let Some(value) = value
            && object.get(key).is_none_or(Value::is_null)
        {
            object.insert(key.to_string(), value);
        }
    };

    set("model", non_empty(settings.model.as_deref()));
    set(
        "cwd",
        settings
            .cwd
            .as_ref()
            .map(|p| Value::String(p.to_string_lossy().into_owned())),
    );
    set(
        "approvalPolicy",
        non_empty(settings.approval_policy.as_deref()),
    );
    set(
        "sandboxPolicy",
        non_empty(settings.sandbox_policy.as_deref()),
    );

    match method {
        "thread/start" => {
            set("reasoningEffort", non_empty(settings.effort.as_deref()));
        }
        "turn/start" => {
            set("effort", non_empty(settings.effort.as_deref()));
            set("summary", non_empty(settings.summary.as_deref()));
        }
        _ => {}
    }
}

fn non_empty(value: Option<&str>) -> Option<Value> {
    match value {
        Some(s) if !s.is_empty() => Some(Value::String(s.to_string())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn settings() -> ConversationSettings {
        ConversationSettings {
            cwd: Some(PathBuf::from("/work")),
            model: Some("gpt-5-codex".into()),
            approval_policy: Some("on-failure".into()),
            sandbox_policy: Some("workspace-write".into()),
            effort: Some("high".into()),
            summary: Some("concise".into()),
            agent: None,
            markdown: None,
        }
    }

    #[test]
    fn turn_start_gets_effort_and_summary() {
        let mut params = serde_json::json!({"input": [{"type": "text", "text": "hi"}]});
        inject_settings("turn/start", &mut params, &settings());
        assert_eq!(params["model"], "gpt-5-codex");
        assert_eq!(params["cwd"], "/work");
        assert_eq!(params["approvalPolicy"], "on-failure");
        assert_eq!(params["sandboxPolicy"], "workspace-write");
        assert_eq!(params["effort"], "high");
        assert_eq!(params["summary"], "concise");
        assert!(params.get("reasoningEffort").is_none());
    }

    #[test]
    fn thread_start_spells_effort_differently_and_skips_summary() {
        let mut params = Value::Null;
        inject_settings("thread/start", &mut params, &settings());
        assert_eq!(params["reasoningEffort"], "high");
        assert!(params.get("effort").is_none());
        assert!(params.get("summary").is_none());
    }

    #[test]
    fn thread_resume_gets_neither_effort_nor_summary() {
        let mut params = serde_json::json!({"threadId": "T1"});
        inject_settings("thread/resume", &mut params, &settings());
        assert_eq!(params["threadId"], "T1");
        assert_eq!(params["model"], "gpt-5-codex");
        assert!(params.get("reasoningEffort").is_none());
        assert!(params.get("effort").is_none());
    }

    #[test]
    fn empty_values_are_omitted_and_existing_params_win() {
        let mut empty = ConversationSettings::default();
        empty.model = Some(String::new());
        let mut params = serde_json::json!({"model": "explicit"});
        inject_settings("turn/start", &mut params, &empty);
        assert_eq!(params["model"], "explicit");
        assert!(params.get("cwd").is_none());
    }

    #[test]
    fn other_methods_are_untouched() {
        let mut params = serde_json::json!({});
        inject_settings("thread/list", &mut params, &settings());
        assert_eq!(params, serde_json::json!({}));
    }
}
