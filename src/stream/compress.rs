//! Grain compression
//!
//! Grains are compressed either inline on the appending thread or by a pool
//! of worker threads. The pool is fed through a bounded channel and tags
//! every job with a sequence number; results are handed back strictly in
//! submission order, so the single appender always emits grains in LBA order.
//!
//! ```text
//!   submit ──► [jobs: bounded] ──► worker 0..N ──► [results] ──► reorder ──► emit
//! ```

use std::collections::BTreeMap;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};

use crate::error::{Result, VmdkError};
use crate::grain::record::compress_grain;

/// Compressed payload of one grain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedGrain {
    pub lba: u64,
    pub data: Vec<u8>,
}

struct Job {
    seq: u64,
    lba: u64,
    data: Vec<u8>,
}

struct Done {
    seq: u64,
    lba: u64,
    result: std::io::Result<Vec<u8>>,
}

/// Compresses grains and returns them in submission order
pub enum Compressor {
    Inline { level: u32 },
    Pool(CompressionPool),
}

impl Compressor {
    /// `workers == 0` compresses on the calling thread
    pub fn new(level: u32, workers: usize, queue_depth: usize) -> Result<Self> {
        if workers == 0 {
            return Ok(Compressor::Inline { level });
        }
        Ok(Compressor::Pool(CompressionPool::spawn(
            level,
            workers,
            queue_depth.max(1),
        )?))
    }

    /// Queue a grain; returns the grains whose turn to be emitted has come
    pub fn submit(&mut self, lba: u64, data: Vec<u8>) -> Result<Vec<CompressedGrain>> {
        match self {
            Compressor::Inline { level } => Ok(vec![CompressedGrain {
                lba,
                data: compress_grain(&data, *level)?,
            }]),
            Compressor::Pool(pool) => pool.submit(lba, data),
        }
    }

    /// Wait for every queued grain
    pub fn finish(&mut self) -> Result<Vec<CompressedGrain>> {
        match self {
            Compressor::Inline { .. } => Ok(Vec::new()),
            Compressor::Pool(pool) => pool.finish(),
        }
    }

    /// Stop the workers; queued grains are dropped
    pub fn shutdown(&mut self) {
        if let Compressor::Pool(pool) = self {
            pool.shutdown();
        }
    }
}

/// Worker threads behind a bounded job queue
pub struct CompressionPool {
    jobs: Option<Sender<Job>>,
    results: Receiver<Done>,
    workers: Vec<JoinHandle<()>>,
    /// Sequence number of the next submitted grain
    next_seq: u64,
    /// Sequence number of the next grain to hand out
    next_emit: u64,
    /// Results that arrived ahead of their turn
    pending: BTreeMap<u64, Done>,
    queue_depth: usize,
}

impl CompressionPool {
    fn spawn(level: u32, workers: usize, queue_depth: usize) -> Result<Self> {
        let (job_tx, job_rx) = channel::bounded::<Job>(queue_depth);
        let (done_tx, done_rx) = channel::unbounded::<Done>();

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let job_rx = job_rx.clone();
            let done_tx = done_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("vmdk-compress-{}", i))
                .spawn(move || {
                    for job in job_rx.iter() {
                        let result = compress_grain(&job.data, level);
                        let done = Done {
                            seq: job.seq,
                            lba: job.lba,
                            result,
                        };
                        if done_tx.send(done).is_err() {
                            break;
                        }
                    }
                })?;
            handles.push(handle);
        }
        tracing::debug!(
            "Started {} compression workers (queue depth {})",
            workers,
            queue_depth
        );

        Ok(Self {
            jobs: Some(job_tx),
            results: done_rx,
            workers: handles,
            next_seq: 0,
            next_emit: 0,
            pending: BTreeMap::new(),
            queue_depth,
        })
    }

    fn in_flight(&self) -> usize {
        (self.next_seq - self.next_emit) as usize
    }

    fn submit(&mut self, lba: u64, data: Vec<u8>) -> Result<Vec<CompressedGrain>> {
        let mut ready = Vec::new();
        while self.in_flight() >= self.queue_depth {
            self.wait_one()?;
            self.take_ready(&mut ready)?;
        }

        let jobs = self.jobs.as_ref().ok_or_else(pool_stopped)?;
        jobs.send(Job {
            seq: self.next_seq,
            lba,
            data,
        })
        .map_err(|_| pool_stopped())?;
        self.next_seq += 1;

        while let Ok(done) = self.results.try_recv() {
            self.pending.insert(done.seq, done);
        }
        self.take_ready(&mut ready)?;
        Ok(ready)
    }

    fn finish(&mut self) -> Result<Vec<CompressedGrain>> {
        let mut ready = Vec::new();
        while self.in_flight() > 0 {
            self.wait_one()?;
            self.take_ready(&mut ready)?;
        }
        Ok(ready)
    }

    fn wait_one(&mut self) -> Result<()> {
        let done = self.results.recv().map_err(|_| pool_stopped())?;
        self.pending.insert(done.seq, done);
        Ok(())
    }

    fn take_ready(&mut self, ready: &mut Vec<CompressedGrain>) -> Result<()> {
        while let Some(done) = self.pending.remove(&self.next_emit) {
            self.next_emit += 1;
            ready.push(CompressedGrain {
                lba: done.lba,
                data: done.result?,
            });
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        // Closing the job queue ends the workers' loops
        self.jobs = None;
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("Compression worker panicked");
            }
        }
        self.pending.clear();
        self.next_emit = self.next_seq;
    }
}

impl Drop for CompressionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn pool_stopped() -> VmdkError {
    VmdkError::ProtocolViolation("compression pool has stopped".to_string())
}
