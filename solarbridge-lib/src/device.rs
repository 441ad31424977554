//! Single owner of the serial port.
//!
//! Every transaction goes through one worker task, so a request's reply is
//! fully consumed before the next request is written, no matter how many
//! clients ask at once.

use json::{object::Object, JsonValue};
use log::{debug, info, warn};
use std::{collections::BTreeMap, time::Duration};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::port::Transport;
use crate::protocol::{make_protocol, Protocol, ProtocolKind};
use crate::regs::{Reg, Value};

const QUEUE_DEPTH: usize = 32;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DeviceError {
    #[error("device worker is gone")]
    Gone,
}

/// Per-protocol response timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Inter-byte silence that ends a binary telegram reply
    pub telegram_silence: Duration,
    /// Overall deadline for a VE.Direct reply
    pub vedirect_deadline: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            telegram_silence: ProtocolKind::Telegram.default_timeout(),
            vedirect_deadline: ProtocolKind::VeDirect.default_timeout(),
        }
    }
}

impl Timing {
    pub fn for_kind(&self, kind: ProtocolKind) -> Duration {
        match kind {
            ProtocolKind::Telegram => self.telegram_silence,
            ProtocolKind::VeDirect => self.vedirect_deadline,
        }
    }

    /// Same timeout for whichever protocol ends up in use.
    pub fn uniform(timeout: Duration) -> Self {
        Timing {
            telegram_silence: timeout,
            vedirect_deadline: timeout,
        }
    }
}

/// Register name to decoded value, one entry per requested register.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollResult(BTreeMap<&'static str, Value>);

impl PollResult {
    pub fn insert(&mut self, name: &'static str, value: Value) {
        self.0.insert(name, value);
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.0.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn failures(&self) -> usize {
        self.0.values().filter(|v| v.is_failed()).count()
    }

    pub fn to_json(&self) -> JsonValue {
        let mut object = Object::with_capacity(self.0.len());
        for (name, value) in &self.0 {
            object.insert(name, (*value).into());
        }
        JsonValue::Object(object)
    }
}

/// Reads `regs` one transaction at a time. A register that cannot be read is
/// logged and comes back as [`Value::Failed`]; the rest are still read.
pub async fn poll_registers<P: Protocol + ?Sized>(proto: &mut P, regs: &[Reg]) -> PollResult {
    proto.start_cycle();
    let mut result = PollResult::default();
    for reg in regs {
        let value = match proto.read_raw(reg).await {
            Ok(raw) => reg.decode(raw),
            Err(e) => {
                warn!("{}: {:#}", reg.name, e);
                Value::Failed
            }
        };
        result.insert(reg.name, value);
    }
    result
}

struct Job {
    regs: Vec<Reg>,
    reply: oneshot::Sender<PollResult>,
}

/// Cloneable handle to the worker owning the port.
#[derive(Debug, Clone)]
pub struct Device {
    kind: ProtocolKind,
    jobs: mpsc::Sender<Job>,
}

impl Device {
    /// Moves `port` into a new worker task. The worker exits once every
    /// `Device` clone has been dropped.
    pub fn spawn<T: Transport + 'static>(
        kind: ProtocolKind,
        port: T,
        timeout: Duration,
    ) -> (Device, JoinHandle<()>) {
        let (jobs, queue) = mpsc::channel(QUEUE_DEPTH);
        let worker = tokio::spawn(run_worker(kind, port, timeout, queue));
        (Device { kind, jobs }, worker)
    }

    pub fn kind(&self) -> ProtocolKind {
        self.kind
    }

    pub async fn poll(&self, regs: &[Reg]) -> Result<PollResult, DeviceError> {
        let (reply, result) = oneshot::channel();
        let job = Job {
            regs: regs.to_vec(),
            reply,
        };
        self.jobs.send(job).await.map_err(|_| DeviceError::Gone)?;
        result.await.map_err(|_| DeviceError::Gone)
    }
}

async fn run_worker<T: Transport>(
    kind: ProtocolKind,
    mut port: T,
    timeout: Duration,
    mut queue: mpsc::Receiver<Job>,
) {
    info!("{} worker started, timeout {:?}", kind, timeout);
    let mut proto = make_protocol(kind, &mut port, timeout);
    while let Some(job) = queue.recv().await {
        let result = poll_registers(&mut *proto, &job.regs).await;
        debug!(
            "polled {} registers, {} failed",
            result.len(),
            result.failures()
        );
        if job.reply.send(result).is_err() {
            debug!("requester left before the poll finished");
        }
    }
    info!("{} worker stopped", kind);
}
