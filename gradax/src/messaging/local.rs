//! In-process loopback transport: every rank lives in the same process as a
//! tokio task, exchanging messages through shared state.
//!
//! This is the reference `Messaging` implementation and the backbone of the
//! integration tests. `LoopbackCollective` plays the device collective
//! library's role the same way, so all four reduction backends are
//! exercisable without accelerator hardware.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use tokio::sync::Notify;

use crate::collective::{DeviceCollective, DeviceSpan};
use crate::error::{AggError, Result};
use crate::messaging::Messaging;
use crate::reduce::reduce_slice;
use crate::types::{DataType, Rank, ReduceOp};

/// Factory for the per-rank handles of an in-process cluster.
pub struct LoopbackCluster;

impl LoopbackCluster {
    /// One messaging handle per rank, with GDR reported off.
    pub fn spawn(world: usize) -> Vec<LoopbackMessaging> {
        Self::spawn_inner(world, false)
    }

    /// One messaging handle per rank, with GDR reported on (in-process,
    /// every pointer is reachable, so the transport reads it directly).
    pub fn spawn_with_gdr(world: usize) -> Vec<LoopbackMessaging> {
        Self::spawn_inner(world, true)
    }

    fn spawn_inner(world: usize, gpu_direct: bool) -> Vec<LoopbackMessaging> {
        assert!(world > 0, "world size must be at least 1");
        let shared = Arc::new(Shared::new(world));
        (0..world)
            .map(|rank| LoopbackMessaging {
                shared: Arc::clone(&shared),
                rank: rank as Rank,
                gpu_direct,
                seq: SeqCounters::default(),
            })
            .collect()
    }
}

/// One rank's handle onto the loopback cluster.
pub struct LoopbackMessaging {
    shared: Arc<Shared>,
    rank: Rank,
    gpu_direct: bool,
    seq: SeqCounters,
}

impl Messaging for LoopbackMessaging {
    fn world_size(&self) -> usize {
        self.shared.world
    }

    fn rank(&self) -> Rank {
        self.rank
    }

    fn gpu_direct(&self) -> bool {
        self.gpu_direct
    }

    fn send(&self, dest: Rank, tag: u64, payload: Vec<u8>) -> impl Future<Output = Result<()>> + Send {
        async move {
            let mailbox = self
                .shared
                .mailboxes
                .get(dest as usize)
                .ok_or(AggError::InvalidRank {
                    rank: dest,
                    world_size: self.shared.world,
                })?;
            {
                let mut queue = mailbox
                    .queue
                    .lock()
                    .map_err(|_| AggError::LockPoisoned("loopback mailbox"))?;
                queue.push(Message {
                    src: self.rank,
                    tag,
                    payload,
                });
            }
            mailbox.notify.notify_waiters();
            Ok(())
        }
    }

    fn recv(&self, src: Rank, tag: u64) -> impl Future<Output = Result<Vec<u8>>> + Send {
        async move {
            if src as usize >= self.shared.world {
                return Err(AggError::InvalidRank {
                    rank: src,
                    world_size: self.shared.world,
                });
            }
            let mailbox = &self.shared.mailboxes[self.rank as usize];
            loop {
                // notify_waiters wakes only registered waiters; register
                // before scanning.
                let notified = mailbox.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                {
                    let mut queue = mailbox
                        .queue
                        .lock()
                        .map_err(|_| AggError::LockPoisoned("loopback mailbox"))?;
                    if let Some(pos) = queue.iter().position(|m| m.src == src && m.tag == tag) {
                        return Ok(queue.remove(pos).payload);
                    }
                }
                notified.await;
            }
        }
    }

    fn broadcast(&self, root: Rank, buf: &mut [u8]) -> impl Future<Output = Result<()>> + Send {
        let ticket = self.seq.broadcast.fetch_add(1, Ordering::Relaxed);
        async move {
            if root as usize >= self.shared.world {
                return Err(AggError::InvalidRank {
                    rank: root,
                    world_size: self.shared.world,
                });
            }
            let contribution = if self.rank == root {
                buf.to_vec()
            } else {
                Vec::new()
            };
            let spec = OpSpec::Broadcast {
                root,
                bytes: buf.len(),
            };
            let result = rendezvous(
                &self.shared,
                RoundId::Broadcast(ticket),
                spec,
                self.rank,
                contribution,
            )
            .await?;
            if result.len() != buf.len() {
                return Err(AggError::BufferSizeMismatch {
                    expected: buf.len(),
                    actual: result.len(),
                });
            }
            buf.copy_from_slice(&result);
            Ok(())
        }
    }

    unsafe fn all_reduce(
        &self,
        ptr: u64,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
    ) -> impl Future<Output = Result<()>> + Send {
        let ticket = self.seq.all_reduce.fetch_add(1, Ordering::Relaxed);
        async move {
            let bytes = count * dtype.size_in_bytes();
            let contribution =
                unsafe { std::slice::from_raw_parts(ptr as *const u8, bytes) }.to_vec();
            let spec = OpSpec::AllReduce { count, dtype, op };
            let result = rendezvous(
                &self.shared,
                RoundId::AllReduce(ticket),
                spec,
                self.rank,
                contribution,
            )
            .await?;
            unsafe {
                std::ptr::copy_nonoverlapping(result.as_ptr(), ptr as *mut u8, bytes);
            }
            Ok(())
        }
    }

    unsafe fn all_gather(
        &self,
        send_ptr: u64,
        recv_ptr: u64,
        count: usize,
        elem_bytes: usize,
    ) -> impl Future<Output = Result<()>> + Send {
        let ticket = self.seq.all_gather.fetch_add(1, Ordering::Relaxed);
        async move {
            let chunk_bytes = count * elem_bytes;
            let contribution =
                unsafe { std::slice::from_raw_parts(send_ptr as *const u8, chunk_bytes) }.to_vec();
            let spec = OpSpec::AllGather { chunk_bytes };
            let result = rendezvous(
                &self.shared,
                RoundId::AllGather(ticket),
                spec,
                self.rank,
                contribution,
            )
            .await?;
            unsafe {
                std::ptr::copy_nonoverlapping(result.as_ptr(), recv_ptr as *mut u8, result.len());
            }
            Ok(())
        }
    }

    fn barrier(&self) -> impl Future<Output = Result<()>> + Send {
        let ticket = self.seq.barrier.fetch_add(1, Ordering::Relaxed);
        async move {
            rendezvous(
                &self.shared,
                RoundId::Barrier(ticket),
                OpSpec::Barrier,
                self.rank,
                Vec::new(),
            )
            .await?;
            Ok(())
        }
    }
}

/// Loopback stand-in for a device collective library. Always supported;
/// operations rendezvous through shared state like the messaging handles.
pub struct LoopbackCollective {
    shared: Arc<Shared>,
    rank: Rank,
    seq: SeqCounters,
}

impl LoopbackCollective {
    /// One collective handle per rank. Rank order matches the index order of
    /// the returned vector, and must line up with the messaging handles.
    pub fn spawn(world: usize) -> Vec<LoopbackCollective> {
        assert!(world > 0, "world size must be at least 1");
        let shared = Arc::new(Shared::new(world));
        (0..world)
            .map(|rank| LoopbackCollective {
                shared: Arc::clone(&shared),
                rank: rank as Rank,
                seq: SeqCounters::default(),
            })
            .collect()
    }
}

impl DeviceCollective for LoopbackCollective {
    fn is_supported(&self) -> bool {
        true
    }

    unsafe fn all_reduce_batch<'a>(&'a self, spans: &'a [DeviceSpan]) -> BoxFuture<'a, Result<()>> {
        let tickets: Vec<u64> = spans
            .iter()
            .map(|_| self.seq.all_reduce.fetch_add(1, Ordering::Relaxed))
            .collect();
        Box::pin(async move {
            for (span, ticket) in spans.iter().zip(tickets) {
                let bytes = span.count * span.dtype.size_in_bytes();
                let contribution =
                    unsafe { std::slice::from_raw_parts(span.ptr as *const u8, bytes) }.to_vec();
                let spec = OpSpec::AllReduce {
                    count: span.count,
                    dtype: span.dtype,
                    op: ReduceOp::Sum,
                };
                let result = rendezvous(
                    &self.shared,
                    RoundId::AllReduce(ticket),
                    spec,
                    self.rank,
                    contribution,
                )
                .await?;
                unsafe {
                    std::ptr::copy_nonoverlapping(result.as_ptr(), span.ptr as *mut u8, bytes);
                }
            }
            Ok(())
        })
    }

    unsafe fn all_reduce<'a>(
        &'a self,
        send: u64,
        recv: u64,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
    ) -> BoxFuture<'a, Result<()>> {
        let ticket = self.seq.all_reduce.fetch_add(1, Ordering::Relaxed);
        Box::pin(async move {
            let bytes = count * dtype.size_in_bytes();
            let contribution =
                unsafe { std::slice::from_raw_parts(send as *const u8, bytes) }.to_vec();
            let spec = OpSpec::AllReduce { count, dtype, op };
            let result = rendezvous(
                &self.shared,
                RoundId::AllReduce(ticket),
                spec,
                self.rank,
                contribution,
            )
            .await?;
            unsafe {
                std::ptr::copy_nonoverlapping(result.as_ptr(), recv as *mut u8, bytes);
            }
            Ok(())
        })
    }

    unsafe fn all_gather<'a>(
        &'a self,
        send: u64,
        recv: u64,
        count: usize,
        dtype: DataType,
    ) -> BoxFuture<'a, Result<()>> {
        let ticket = self.seq.all_gather.fetch_add(1, Ordering::Relaxed);
        Box::pin(async move {
            let chunk_bytes = count * dtype.size_in_bytes();
            let contribution =
                unsafe { std::slice::from_raw_parts(send as *const u8, chunk_bytes) }.to_vec();
            let spec = OpSpec::AllGather { chunk_bytes };
            let result = rendezvous(
                &self.shared,
                RoundId::AllGather(ticket),
                spec,
                self.rank,
                contribution,
            )
            .await?;
            unsafe {
                std::ptr::copy_nonoverlapping(result.as_ptr(), recv as *mut u8, result.len());
            }
            Ok(())
        })
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct SeqCounters {
    all_reduce: AtomicU64,
    all_gather: AtomicU64,
    broadcast: AtomicU64,
    barrier: AtomicU64,
}

struct Shared {
    world: usize,
    mailboxes: Vec<Mailbox>,
    rounds: Mutex<HashMap<RoundId, Round>>,
    rounds_notify: Notify,
}

impl Shared {
    fn new(world: usize) -> Self {
        Self {
            world,
            mailboxes: (0..world).map(|_| Mailbox::default()).collect(),
            rounds: Mutex::new(HashMap::new()),
            rounds_notify: Notify::new(),
        }
    }
}

#[derive(Default)]
struct Mailbox {
    queue: Mutex<Vec<Message>>,
    notify: Notify,
}

struct Message {
    src: Rank,
    tag: u64,
    payload: Vec<u8>,
}

/// Collectives match across ranks by per-kind issue order, the same rule MPI
/// applies to collectives on one communicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RoundId {
    AllReduce(u64),
    AllGather(u64),
    Broadcast(u64),
    Barrier(u64),
}

#[derive(Debug, Clone, PartialEq)]
enum OpSpec {
    AllReduce {
        count: usize,
        dtype: DataType,
        op: ReduceOp,
    },
    AllGather {
        chunk_bytes: usize,
    },
    Broadcast {
        root: Rank,
        bytes: usize,
    },
    Barrier,
}

struct Round {
    spec: OpSpec,
    contributions: Vec<Option<Vec<u8>>>,
    arrived: usize,
    outcome: Option<std::result::Result<Arc<Vec<u8>>, String>>,
    taken: usize,
}

impl Round {
    fn new(spec: OpSpec, world: usize) -> Self {
        Self {
            spec,
            contributions: vec![None; world],
            arrived: 0,
            outcome: None,
            taken: 0,
        }
    }
}

/// Contribute to a round and wait for its combined result.
async fn rendezvous(
    shared: &Arc<Shared>,
    id: RoundId,
    spec: OpSpec,
    rank: Rank,
    contribution: Vec<u8>,
) -> Result<Arc<Vec<u8>>> {
    let world = shared.world;
    {
        let mut rounds = shared
            .rounds
            .lock()
            .map_err(|_| AggError::LockPoisoned("loopback rounds"))?;
        let round = rounds
            .entry(id)
            .or_insert_with(|| Round::new(spec.clone(), world));
        if round.spec != spec {
            let reason = format!(
                "collective sequence mismatch at {id:?}: {:?} vs {spec:?}",
                round.spec
            );
            round.outcome = Some(Err(reason.clone()));
            shared.rounds_notify.notify_waiters();
            return Err(AggError::collective("loopback collective", rank, reason));
        }
        if round.contributions[rank as usize].replace(contribution).is_some() {
            return Err(AggError::collective(
                "loopback collective",
                rank,
                format!("duplicate contribution at {id:?}"),
            ));
        }
        round.arrived += 1;
        if round.arrived == world {
            round.outcome = Some(combine(&round.spec, &mut round.contributions).map(Arc::new));
            shared.rounds_notify.notify_waiters();
        }
    }

    loop {
        // notify_waiters wakes only registered waiters; register before
        // inspecting the round.
        let notified = shared.rounds_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        {
            let mut rounds = shared
                .rounds
                .lock()
                .map_err(|_| AggError::LockPoisoned("loopback rounds"))?;
            if let Some(round) = rounds.get_mut(&id) {
                if let Some(outcome) = round.outcome.clone() {
                    round.taken += 1;
                    if round.taken == world {
                        rounds.remove(&id);
                    }
                    return outcome
                        .map_err(|reason| AggError::collective("loopback collective", rank, reason));
                }
            }
        }
        notified.await;
    }
}

fn combine(
    spec: &OpSpec,
    contributions: &mut [Option<Vec<u8>>],
) -> std::result::Result<Vec<u8>, String> {
    match spec {
        OpSpec::AllReduce { count, dtype, op } => {
            let mut iter = contributions.iter_mut();
            let mut acc = iter
                .next()
                .and_then(|c| c.take())
                .ok_or("missing contribution")?;
            for c in iter {
                let c = c.take().ok_or("missing contribution")?;
                if c.len() != acc.len() {
                    return Err(format!(
                        "contribution length mismatch: {} vs {}",
                        c.len(),
                        acc.len()
                    ));
                }
                reduce_slice(&mut acc, &c, *count, *dtype, *op);
            }
            Ok(acc)
        }
        OpSpec::AllGather { chunk_bytes } => {
            let mut out = Vec::with_capacity(chunk_bytes * contributions.len());
            for c in contributions.iter_mut() {
                let c = c.take().ok_or("missing contribution")?;
                if c.len() != *chunk_bytes {
                    return Err(format!(
                        "contribution length mismatch: {} vs {chunk_bytes}",
                        c.len()
                    ));
                }
                out.extend_from_slice(&c);
            }
            Ok(out)
        }
        OpSpec::Broadcast { root, bytes } => {
            let c = contributions[*root as usize]
                .take()
                .ok_or("missing root contribution")?;
            if c.len() != *bytes {
                return Err(format!("root length mismatch: {} vs {bytes}", c.len()));
            }
            Ok(c)
        }
        OpSpec::Barrier => Ok(Vec::new()),
    }
}
