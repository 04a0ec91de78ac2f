//! PTY block records.
//!
//! A block is a bounded interval of PTY output from a single command,
//! delimited by BEGIN/END markers. `events.jsonl` holds the raw lifecycle
//! records; `blocks.jsonl` holds one metadata line per finalized block and is
//! derivable from `events.jsonl` bit-for-bit.

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    Interactive,
}

/// One line of `blocks.jsonl`. Field order is load-bearing: replaying
/// `events.jsonl` must reproduce the file byte-for-byte.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub block_id: String,
    pub cmd: String,
    pub cwd: String,
    /// Milliseconds since the Unix epoch.
    pub ts_begin: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_end: Option<i64>,
    pub status: BlockStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub output_path: String,
}

impl BlockMeta {
    /// Derive finalized metadata from a BEGIN/END pair. Used both on the live
    /// path and when replaying `events.jsonl`, so the two stay identical.
    pub fn finalize(begin: &BlockEvent, end: &BlockEvent) -> Option<BlockMeta> {
        let BlockEvent::Begin {
            block_id, ts, cwd, cmd, ..
        } = begin
        else {
            return None;
        };
        let BlockEvent::End {
            block_id: end_id,
            ts: ts_end,
            exit_code,
            cancelled,
            ..
        } = end
        else {
            return None;
        };
        if block_id != end_id {
            return None;
        }
        let status = if *cancelled {
            BlockStatus::Cancelled
        } else {
            match exit_code {
                Some(0) => BlockStatus::Completed,
                Some(_) => BlockStatus::Failed,
                None => BlockStatus::Completed,
            }
        };
        Some(BlockMeta {
            block_id: block_id.clone(),
            cmd: cmd.clone(),
            cwd: cwd.clone(),
            ts_begin: *ts,
            ts_end: Some(*ts_end),
            status,
            exit_code: *exit_code,
            output_path: format!("blocks/{block_id}.out"),
        })
    }
}

/// One line of `events.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockEvent {
    Begin {
        block_id: String,
        conversation_id: String,
        seq: u64,
        ts: i64,
        cwd: String,
        cmd: String,
    },
    Delta {
        block_id: String,
        conversation_id: String,
        bytes: usize,
    },
    End {
        block_id: String,
        conversation_id: String,
        seq: u64,
        ts: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default)]
        cancelled: bool,
    },
}

impl BlockEvent {
    pub fn block_id(&self) -> &str {
        match self {
            BlockEvent::Begin { block_id, .. }
            | BlockEvent::Delta { block_id, .. }
            | BlockEvent::End { block_id, .. } => block_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn begin(id: &str) -> BlockEvent {
        BlockEvent::Begin {
            block_id: id.into(),
            conversation_id: "c1".into(),
            seq: 1,
            ts: 1_000,
            cwd: "/tmp".into(),
            cmd: "./guess".into(),
        }
    }

    #[test]
    fn finalize_derives_status_from_exit_code() {
        let end = BlockEvent::End {
            block_id: "b1".into(),
            conversation_id: "c1".into(),
            seq: 1,
            ts: 2_000,
            exit_code: Some(3),
            cancelled: false,
        };
        let meta = BlockMeta::finalize(&begin("b1"), &end).unwrap();
        assert_eq!(meta.status, BlockStatus::Failed);
        assert_eq!(meta.exit_code, Some(3));
        assert_eq!(meta.output_path, "blocks/b1.out");
        assert_eq!(meta.ts_begin, 1_000);
        assert_eq!(meta.ts_end, Some(2_000));
    }

    #[test]
    fn finalize_rejects_mismatched_ids() {
        let end = BlockEvent::End {
            block_id: "b2".into(),
            conversation_id: "c1".into(),
            seq: 1,
            ts: 2_000,
            exit_code: Some(0),
            cancelled: false,
        };
        assert!(BlockMeta::finalize(&begin("b1"), &end).is_none());
    }
}
