//! Remote engine proxy.
//!
//! Turns an operation plus arguments into a [`RemoteCall`] for the worker
//! thread and blocks the caller until the matching [`CallReply`] arrives.
//! Calls are delivered to the worker in order over one channel; replies
//! come back on another channel keyed by uid and are matched against the
//! pending-call table by a small router thread.
//!
//! Play-state transitions and engine console output do not travel on the
//! reply channel: the worker posts them as [`WorkerEvent`]s on the event
//! receiver returned by [`EngineProxy::spawn`].

use crate::engine::worker::EngineWorker;
use crate::engine::{EngineFactory, InitializeConfig, PerformanceIo};
use crate::error::{Error, Result};
use crate::ops::EngineOp;
use crate::play_state::PlayState;
use crate::value::Value;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Opaque handle of the engine instance created by `initialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceHandle(pub i64);

/// Work for the engine worker.
#[derive(Debug)]
pub enum Request {
    Initialize(InitializeConfig),
    Start {
        instance: InstanceHandle,
        io: PerformanceIo,
    },
    Reset {
        instance: InstanceHandle,
    },
    Call {
        instance: InstanceHandle,
        op: EngineOp,
        args: Vec<Value>,
    },
    /// End any live performance and exit. Not answered.
    Shutdown,
}

/// A request tagged with the uid its reply will carry.
#[derive(Debug)]
pub struct RemoteCall {
    pub uid: u64,
    pub request: Request,
}

/// Result of a remote call.
#[derive(Debug, Clone)]
pub struct CallReply {
    pub uid: u64,
    pub value: std::result::Result<Value, String>,
}

/// Asynchronous notification from the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    PlayState(PlayState),
    Message(String),
}

type PendingCalls = Arc<Mutex<HashMap<u64, Sender<std::result::Result<Value, String>>>>>;

/// Control-side stub of the worker-hosted engine.
pub struct EngineProxy {
    calls: Sender<RemoteCall>,
    pending: PendingCalls,
    next_uid: AtomicU64,
    worker: Option<JoinHandle<()>>,
    router: Option<JoinHandle<()>>,
}

impl EngineProxy {
    /// Start the worker thread and the reply router.
    ///
    /// The engine itself is built later, inside the worker, by
    /// [`EngineProxy::initialize`].
    pub fn spawn(factory: EngineFactory) -> Result<(Self, Receiver<WorkerEvent>)> {
        let (call_tx, call_rx) = unbounded();
        let (reply_tx, reply_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();

        let worker = thread::Builder::new()
            .name("rtperf-engine".to_string())
            .spawn(move || EngineWorker::new(factory, call_rx, reply_tx, event_tx).run())?;

        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let router_pending = pending.clone();
        let router = thread::Builder::new()
            .name("rtperf-replies".to_string())
            .spawn(move || route_replies(reply_rx, router_pending))?;

        Ok((
            Self {
                calls: call_tx,
                pending,
                next_uid: AtomicU64::new(1),
                worker: Some(worker),
                router: Some(router),
            },
            event_rx,
        ))
    }

    /// Create the engine instance. `None` when the engine could not be built.
    pub fn initialize(&self, config: InitializeConfig) -> Result<Option<InstanceHandle>> {
        let value = self.request("initialize", Request::Initialize(config))?;
        Ok(value.as_i64().map(InstanceHandle))
    }

    /// Start a performance over the given shared buffers.
    pub fn start(&self, instance: InstanceHandle, io: PerformanceIo) -> Result<Value> {
        self.request("start", Request::Start { instance, io })
    }

    pub fn reset(&self, instance: InstanceHandle) -> Result<Value> {
        self.request("reset", Request::Reset { instance })
    }

    /// Invoke a generic operation.
    pub fn call(&self, instance: InstanceHandle, op: EngineOp, args: Vec<Value>) -> Result<Value> {
        self.request(op.name(), Request::Call { instance, op, args })
    }

    fn request(&self, label: &str, request: Request) -> Result<Value> {
        let uid = self.next_uid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(1);
        self.pending.lock().insert(uid, tx);

        if self.calls.send(RemoteCall { uid, request }).is_err() {
            self.pending.lock().remove(&uid);
            return Err(Error::Disconnected);
        }

        match rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(Error::Remote {
                op: label.to_string(),
                message,
            }),
            Err(_) => Err(Error::Disconnected),
        }
    }

    /// Number of calls awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().len()
    }

    /// Stop the worker (ending any live performance) and join both threads.
    pub fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.calls.send(RemoteCall {
                uid: 0,
                request: Request::Shutdown,
            });
            if worker.join().is_err() {
                log::error!("Engine worker panicked");
            }
        }
        if let Some(router) = self.router.take() {
            let _ = router.join();
        }
    }
}

impl Drop for EngineProxy {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for EngineProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineProxy")
            .field("pending_calls", &self.pending_calls())
            .field("running", &self.worker.is_some())
            .finish_non_exhaustive()
    }
}

/// Complete pending calls as replies arrive. Exits once the worker is gone,
/// failing whatever is still pending.
fn route_replies(replies: Receiver<CallReply>, pending: PendingCalls) {
    for CallReply { uid, value } in replies.iter() {
        match pending.lock().remove(&uid) {
            Some(tx) => {
                let _ = tx.send(value);
            }
            None => log::warn!("Reply for unknown call uid {}", uid),
        }
    }
    pending.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{BlockStatus, Engine, RenderMode};
    use anyhow::anyhow;

    struct EchoEngine;

    impl Engine for EchoEngine {
        fn start(&mut self, _io: &PerformanceIo) -> anyhow::Result<i32> {
            Ok(0)
        }
        fn mode(&self) -> RenderMode {
            RenderMode::Realtime
        }
        fn perform_block(&mut self, _io: &PerformanceIo) -> anyhow::Result<BlockStatus> {
            Ok(BlockStatus::Finished)
        }
        fn cleanup(&mut self, _io: &PerformanceIo) -> anyhow::Result<()> {
            Ok(())
        }
        fn reset(&mut self) -> anyhow::Result<i32> {
            Ok(0)
        }
        fn call(&mut self, op: EngineOp, args: &[Value]) -> anyhow::Result<Value> {
            match op {
                EngineOp::EvalCode => Ok(Value::List(args.to_vec())),
                _ => Err(anyhow!("unsupported")),
            }
        }
    }

    fn echo_proxy() -> (EngineProxy, Receiver<WorkerEvent>) {
        EngineProxy::spawn(Box::new(|_| Ok(Box::new(EchoEngine) as Box<dyn Engine>))).unwrap()
    }

    #[test]
    fn test_call_round_trip() {
        let (proxy, _events) = echo_proxy();
        let instance = proxy.initialize(InitializeConfig::default()).unwrap().unwrap();
        let value = proxy
            .call(instance, EngineOp::EvalCode, vec![Value::from("1 + 1")])
            .unwrap();
        assert_eq!(value, Value::List(vec![Value::from("1 + 1")]));
        assert_eq!(proxy.pending_calls(), 0);
    }

    #[test]
    fn test_engine_error_becomes_remote_error() {
        let (proxy, _events) = echo_proxy();
        let instance = proxy.initialize(InitializeConfig::default()).unwrap().unwrap();
        let err = proxy.call(instance, EngineOp::GetSr, vec![]).unwrap_err();
        assert!(matches!(err, Error::Remote { ref op, .. } if op == "getSr"));
    }

    #[test]
    fn test_failed_factory_yields_no_instance() {
        let (proxy, _events) = EngineProxy::spawn(Box::new(|_| Err(anyhow!("no engine")))).unwrap();
        assert_eq!(proxy.initialize(InitializeConfig::default()).unwrap(), None);
    }

    #[test]
    fn test_wrong_instance_is_rejected() {
        let (proxy, _events) = echo_proxy();
        proxy.initialize(InitializeConfig::default()).unwrap();
        let err = proxy.reset(InstanceHandle(99)).unwrap_err();
        assert!(matches!(err, Error::Remote { .. }));
    }

    #[test]
    fn test_calls_after_shutdown_fail() {
        let (mut proxy, _events) = echo_proxy();
        proxy.shutdown();
        let err = proxy.initialize(InitializeConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Disconnected));
    }
}
