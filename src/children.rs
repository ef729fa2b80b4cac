//! Blocking helper jobs, run on worker threads so the loop never waits on them.
//!
//! A job streams its result into a byte sink and finishes with one status.
//! Workers bump a counter after each finish; the loop only looks at the
//! channel once the counter says something died.

use crate::prelude::*;
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use std::collections::BTreeMap;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Output buffered per job. Streamed jobs only count what has not been handed out yet.
pub const MAX_OUTPUT: usize = 64 * 1024;

pub type JobFn = Box<dyn FnOnce(&mut dyn Write) -> io::Result<()> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);
impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    /// Reverse lookup; the context is the address.
    DnsResolver,
    /// Streamed report; the context is the player who asked.
    Lister,
    SwapFinish,
    /// Whole-output report; the context is the player who asked.
    Print,
}

#[derive(Debug)]
pub struct ChildRecord {
    pub id: JobId,
    pub kind: ChildKind,
    pub context: String,
    /// Output not yet handed out by [`Children::process_children`].
    pub output: Vec<u8>,
    /// Some output was dropped because the buffer was full.
    pub truncated: bool,
}

#[derive(Debug)]
pub struct Finished {
    pub record: ChildRecord,
    pub result: Result<(), String>,
}

/// New complete lines from a running streamed job.
#[derive(Debug, PartialEq, Eq)]
pub struct Progress {
    pub id: JobId,
    pub context: String,
    pub lines: Vec<String>,
}

enum Message {
    Output(JobId, Vec<u8>),
    Finished(JobId, Result<(), String>),
}

struct Job {
    id: JobId,
    run: JobFn,
}

struct ChunkWriter<'a> {
    id: JobId,
    messages: &'a Sender<Message>,
}
impl Write for ChunkWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.messages
            .send(Message::Output(self.id, buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "server stopped listening"))?;
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn work(jobs: Receiver<Job>, messages: Sender<Message>, dead: Arc<AtomicUsize>) {
    for job in jobs.iter() {
        let mut sink = ChunkWriter {
            id: job.id,
            messages: &messages,
        };
        let result = match catch_unwind(AssertUnwindSafe(|| (job.run)(&mut sink))) {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err("helper panicked".to_owned()),
        };
        if messages.send(Message::Finished(job.id, result)).is_err() {
            return;
        }
        dead.fetch_add(1, Ordering::Release);
    }
}

pub struct Children {
    jobs: Sender<Job>,
    messages: Receiver<Message>,
    dead: Arc<AtomicUsize>,
    records: BTreeMap<JobId, ChildRecord>,
    finished: BTreeMap<JobId, Result<(), String>>,
    next_id: u64,
    workers: usize,
}
impl Children {
    pub fn new(workers: usize) -> io::Result<Self> {
        let workers = workers.max(1);
        let (jobs, job_queue) = unbounded();
        let (message_sink, messages) = unbounded();
        let dead = Arc::new(AtomicUsize::new(0));
        for i in 0..workers {
            let (job_queue, message_sink, dead) = (job_queue.clone(), message_sink.clone(), Arc::clone(&dead));
            std::thread::Builder::new()
                .name(format!("helper-{i}"))
                .spawn(move || work(job_queue, message_sink, dead))?;
        }
        Ok(Self {
            jobs,
            messages,
            dead,
            records: BTreeMap::new(),
            finished: BTreeMap::new(),
            next_id: 0,
            workers,
        })
    }

    pub fn spawn(&mut self, kind: ChildKind, context: impl Into<String>, run: JobFn) -> JobId {
        let id = JobId(self.next_id);
        self.next_id += 1;
        let context = context.into();
        log::debug!("starting {kind:?} {id} for {context}");
        self.records.insert(
            id,
            ChildRecord {
                id,
                kind,
                context,
                output: vec![],
                truncated: false,
            },
        );
        if self.jobs.send(Job { id, run }).is_err() {
            log::warn!("no helper threads left to run {id}");
            self.finished.insert(id, Err("no helper threads".to_owned()));
            self.child_died();
        }
        id
    }
    /// Notes that some job finished. Extra notes are harmless.
    pub fn child_died(&self) {
        self.dead.fetch_add(1, Ordering::Release);
    }
    pub fn dead_children(&self) -> usize {
        self.dead.load(Ordering::Acquire)
    }
    pub fn pending(&self) -> usize {
        self.records.len()
    }
    pub fn workers(&self) -> usize {
        self.workers
    }

    fn pump(&mut self) {
        loop {
            match self.messages.try_recv() {
                Ok(Message::Output(id, bytes)) => match self.records.get_mut(&id) {
                    Some(record) => {
                        let room = MAX_OUTPUT.saturating_sub(record.output.len());
                        if bytes.len() > room && !record.truncated {
                            log::warn!("{id} for {} overflowed its output buffer", record.context);
                            record.truncated = true;
                        }
                        record.output.extend_from_slice(&bytes[..bytes.len().min(room)]);
                    }
                    None => log::trace!("output for unknown {id}"),
                },
                Ok(Message::Finished(id, result)) => {
                    self.finished.insert(id, result);
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return,
            }
        }
    }

    /// Complete lines written by streamed jobs since the last call.
    pub fn process_children(&mut self) -> Vec<Progress> {
        self.pump();
        let mut progress = vec![];
        for record in self.records.values_mut() {
            if record.kind != ChildKind::Lister {
                continue;
            }
            let Some(end) = record.output.iter().rposition(|b| *b == b'\n') else { continue };
            let lines = String::from_utf8_lossy(&record.output[..end]).lines().map(str::to_owned).collect();
            record.output.drain(..end + 1);
            progress.push(Progress {
                id: record.id,
                context: record.context.clone(),
                lines,
            });
        }
        progress
    }

    /// Collects finished jobs. Each record comes back exactly once; unknown ids are ignored.
    pub fn reap(&mut self) -> Vec<Finished> {
        let mut reaped = vec![];
        while self.dead.load(Ordering::Acquire) > 0 {
            self.dead.fetch_sub(1, Ordering::AcqRel);
            self.pump();
            let Some((id, result)) = self.finished.pop_first() else { continue };
            reaped.extend(self.take(id, result));
        }
        // finishes whose count has not landed yet
        while let Some((id, result)) = self.finished.pop_first() {
            reaped.extend(self.take(id, result));
        }
        reaped
    }
    fn take(&mut self, id: JobId, result: Result<(), String>) -> Option<Finished> {
        match self.records.remove(&id) {
            Some(record) => {
                log::info!("{:?} {id} finished: {result:?}", record.kind);
                Some(Finished { record, result })
            }
            None => {
                log::warn!("reaped {id}, which has no record");
                None
            }
        }
    }
}
impl std::fmt::Debug for Children {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Children")
            .field("workers", &self.workers)
            .field("pending", &self.records.len())
            .field("dead", &self.dead_children())
            .finish()
    }
}
