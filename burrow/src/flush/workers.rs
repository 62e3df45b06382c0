//! Multi-threaded flush execution.
//!
//! A fixed pool of workers drains a bounded work queue; each item names one
//! pool instance and the workers independently run the single-threaded
//! batch logic for it, posting per-item results to a reply queue. The
//! coordinator submits one item per instance and blocks collecting one
//! reply per item before returning the aggregate.
//!
//! Shutdown is an explicit two-phase handshake: one poison item per worker
//! is posted, and the coordinator waits for a matching acknowledgement per
//! worker before the queues may be dropped. Without the acknowledgement a
//! worker could still be about to post into a queue being destroyed.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use threadpool::ThreadPool;

use crate::flush::{flush_batch, FlushClass, FlushOutcome};
use crate::pool::PoolInstance;

pub enum WorkItem {
    Flush {
        instance: usize,
        class: FlushClass,
        min_count: usize,
        lsn_limit: u64,
        /// Background requests do not want a reply; nobody is waiting.
        want_reply: bool,
    },
    Shutdown,
}

pub enum WorkReply {
    Flushed(usize),
    ShutdownAck,
}

pub struct FlushWorkers {
    work_tx: Sender<WorkItem>,
    reply_rx: Receiver<WorkReply>,
    n_workers: usize,
    /// Serializes coordinators so replies cannot be interleaved between two
    /// concurrent aggregate requests.
    coordinator: Mutex<bool>,
}

impl FlushWorkers {
    pub fn spawn(n_workers: usize, instances: Vec<Arc<PoolInstance>>) -> FlushWorkers {
        assert!(n_workers > 0);
        let queue_cap = (instances.len() + n_workers) * 2;
        let (work_tx, work_rx) = crossbeam_channel::bounded::<WorkItem>(queue_cap);
        let (reply_tx, reply_rx) = crossbeam_channel::bounded::<WorkReply>(queue_cap);

        let tp = ThreadPool::with_name("buf-flush".into(), n_workers);
        for _ in 0..n_workers {
            let work_rx = work_rx.clone();
            let reply_tx = reply_tx.clone();
            let instances = instances.clone();
            tp.execute(move || loop {
                match work_rx.recv() {
                    Ok(WorkItem::Flush {
                        instance,
                        class,
                        min_count,
                        lsn_limit,
                        want_reply,
                    }) => {
                        let flushed = match flush_batch(
                            &instances[instance],
                            class,
                            min_count,
                            lsn_limit,
                        ) {
                            FlushOutcome::Flushed(n) => n,
                            FlushOutcome::AlreadyRunning => 0,
                        };
                        if want_reply {
                            let _ = reply_tx.send(WorkReply::Flushed(flushed));
                        }
                    }
                    Ok(WorkItem::Shutdown) => {
                        let _ = reply_tx.send(WorkReply::ShutdownAck);
                        return;
                    }
                    Err(_) => return,
                }
            });
        }

        FlushWorkers {
            work_tx,
            reply_rx,
            n_workers,
            coordinator: Mutex::new(false),
        }
    }

    /// Flush every instance in parallel; returns the total page count once
    /// each instance has reported.
    pub fn flush_all(
        &self,
        n_instances: usize,
        class: FlushClass,
        min_count_per_instance: usize,
        lsn_limit: u64,
    ) -> usize {
        let shut = self.coordinator.lock();
        if *shut {
            return 0;
        }
        for instance in 0..n_instances {
            // unwrap: workers only exit after the shutdown handshake, which
            // cannot run concurrently (coordinator mutex).
            self.work_tx
                .send(WorkItem::Flush {
                    instance,
                    class,
                    min_count: min_count_per_instance,
                    lsn_limit,
                    want_reply: true,
                })
                .unwrap();
        }
        let mut total = 0;
        for _ in 0..n_instances {
            match self.reply_rx.recv().unwrap() {
                WorkReply::Flushed(n) => total += n,
                WorkReply::ShutdownAck => unreachable!("ack outside shutdown handshake"),
            }
        }
        total
    }

    /// Fire-and-forget request, used when the free list runs low. Dropped
    /// on the floor if the queue is full — the next starved caller will ask
    /// again.
    pub fn request_background(&self, instance: usize, class: FlushClass, min_count: usize) {
        let _ = self.work_tx.try_send(WorkItem::Flush {
            instance,
            class,
            min_count,
            lsn_limit: u64::MAX,
            want_reply: false,
        });
    }

    /// Two-phase shutdown: one poison item per worker, then one ack per
    /// worker. Idempotent.
    pub fn shutdown(&self) {
        let mut shut = self.coordinator.lock();
        if *shut {
            return;
        }
        for _ in 0..self.n_workers {
            // unwrap: workers are still alive until they ack.
            self.work_tx.send(WorkItem::Shutdown).unwrap();
        }
        let mut acks = 0;
        while acks < self.n_workers {
            match self.reply_rx.recv().unwrap() {
                WorkReply::ShutdownAck => acks += 1,
                // the coordinator mutex keeps aggregate replies out of this
                // window; tolerate one anyway rather than wedge shutdown.
                WorkReply::Flushed(_) => {}
            }
        }
        *shut = true;
    }
}
