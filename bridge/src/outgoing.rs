//! Outbound request correlation.
//!
//! Ids come from a process-global monotone counter so two bridge variants
//! never collide. Each outstanding request holds a single-shot response slot;
//! the slot either resolves from a matching inbound frame or times out.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use tokio::sync::oneshot;
use tokio::time::Duration;

use fws_protocol::FwsErr;
use fws_protocol::JsonRpcErrorDetail;
use fws_protocol::Result;

/// Default single-shot response timeout.
pub(crate) const RPC_TIMEOUT: Duration = Duration::from_secs(15);

static NEXT_REQUEST_ID: AtomicI64 = AtomicI64::new(1);

type ResponseSlot = oneshot::Sender<Result<serde_json::Value>>;

#[derive(Default)]
pub(crate) struct RequestMap {
    pending: StdMutex<HashMap<i64, ResponseSlot>>,
}

impl RequestMap {
    pub(crate) fn allocate(&self) -> (i64, oneshot::Receiver<Result<serde_json::Value>>) {
        let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        (id, rx)
    }

    pub(crate) fn resolve(&self, id: i64, result: serde_json::Value) -> bool {
        match self.lock().remove(&id) {
            Some(slot) => {
                let _ = slot.send(Ok(result));
                true
            }
            None => false,
        }
    }

    pub(crate) fn reject(&self, id: i64, error: &JsonRpcErrorDetail) -> bool {
        match self.lock().remove(&id) {
            Some(slot) => {
                let _ = slot.send(Err(FwsErr::Rpc {
                    code: error.code,
                    message: error.message.clone(),
                }));
                true
            }
            None => false,
        }
    }

    pub(crate) fn forget(&self, id: i64) {
        self.lock().remove(&id);
    }

    /// Fail every in-flight request, e.g. when the child crashes.
    pub(crate) fn fail_all(&self, make_err: impl Fn() -> FwsErr) {
        let slots: Vec<ResponseSlot> = {
            let mut pending = self.lock();
            pending.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            let _ = slot.send(Err(make_err()));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, ResponseSlot>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
