//! Fan a large name list out over a fixed pool of worker threads.
//!
//! ```text
//!             ┌────────────── input cursor (Mutex) ──────────────┐
//!             │  claim `chunk_size` names, release, resolve      │
//!  worker 0 ──┤                                                  ├── sinks (Mutex)
//!  worker 1 ──┤  each worker owns its linker; the cache behind   │   linked.csv
//!     …       │  the linkers is shared                           │   not_found
//!  worker W ──┘                                                  └── unprocessed
//! ```
//!
//! A chunk whose resolution fails is logged with its names and written to the
//! `unprocessed` sink; the remaining workers carry on.

use crate::error::{DispatchError, LinkError};
use crate::linker::EntityLinker;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{error, info, warn};

pub const LINKED_HEADER: [&str; 2] = ["embedding_label", "knowledgebase_id"];

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub workers: usize,
    pub chunk_size: usize,
    /// Field delimiter of the input; the name is the first field.
    pub delimiter: u8,
    /// Honour `"` quoting in the input.
    pub quoting: bool,
    /// Names containing any of these are skipped.
    pub reserved_chars: Vec<char>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            workers: crate::config::DEFAULT_WORKERS,
            chunk_size: crate::config::DEFAULT_ENTITIES_PER_REQUEST,
            delimiter: b',',
            quoting: true,
            reserved_chars: vec!['|', '&'],
        }
    }
}

impl DispatchOptions {
    pub fn from_config(config: &crate::config::LinkerConfig) -> Self {
        Self {
            workers: config.workers,
            chunk_size: config.chunk_size,
            ..Self::default()
        }
    }
}

/// The three output streams of a run.
pub struct OutputSinks<W: Write> {
    linked: csv::Writer<W>,
    not_found: W,
    unprocessed: W,
}

impl<W: Write> OutputSinks<W> {
    /// Wrap the writers and emit the linked-pairs header.
    pub fn new(linked: W, not_found: W, unprocessed: W) -> Result<Self, DispatchError> {
        let mut linked = csv::Writer::from_writer(linked);
        linked.write_record(LINKED_HEADER)?;
        Ok(Self {
            linked,
            not_found,
            unprocessed,
        })
    }

    fn write_linked(&mut self, label: &str, id: &str) -> Result<(), DispatchError> {
        self.linked.write_record([label, id])?;
        Ok(())
    }

    fn write_not_found(&mut self, name: &str) -> Result<(), DispatchError> {
        writeln!(self.not_found, "{name}")?;
        Ok(())
    }

    fn write_unprocessed(&mut self, name: &str) -> Result<(), DispatchError> {
        writeln!(self.unprocessed, "{name}")?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), DispatchError> {
        self.linked.flush()?;
        self.not_found.flush()?;
        self.unprocessed.flush()?;
        Ok(())
    }

    /// Flush and hand back `(linked, not_found, unprocessed)`.
    pub fn into_inner(mut self) -> Result<(W, W, W), DispatchError> {
        self.flush()?;
        let linked = self
            .linked
            .into_inner()
            .map_err(|e| DispatchError::Output(e.into_error()))?;
        Ok((linked, self.not_found, self.unprocessed))
    }
}

/// Counters for one run, read after all workers have joined.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub names_read: usize,
    pub names_skipped: usize,
    pub chunks_processed: usize,
    pub chunks_failed: usize,
    pub linked: usize,
    pub not_found: usize,
    pub unprocessed: usize,
    pub remote_requests: usize,
}

#[derive(Default)]
struct Counters {
    names_read: AtomicUsize,
    names_skipped: AtomicUsize,
    chunks_processed: AtomicUsize,
    chunks_failed: AtomicUsize,
    linked: AtomicUsize,
    not_found: AtomicUsize,
    unprocessed: AtomicUsize,
    remote_requests: AtomicUsize,
}

impl Counters {
    fn add(counter: &AtomicUsize, n: usize) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn report(&self) -> DispatchReport {
        DispatchReport {
            names_read: self.names_read.load(Ordering::Relaxed),
            names_skipped: self.names_skipped.load(Ordering::Relaxed),
            chunks_processed: self.chunks_processed.load(Ordering::Relaxed),
            chunks_failed: self.chunks_failed.load(Ordering::Relaxed),
            linked: self.linked.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            unprocessed: self.unprocessed.load(Ordering::Relaxed),
            remote_requests: self.remote_requests.load(Ordering::Relaxed),
        }
    }
}

struct InputCursor<R: Read> {
    reader: csv::Reader<R>,
    exhausted: bool,
}

impl<R: Read> InputCursor<R> {
    /// Next chunk of up to `size` usable names, or `None` once input is drained.
    fn claim(
        &mut self,
        size: usize,
        reserved: &[char],
        counters: &Counters,
    ) -> Option<Vec<String>> {
        let mut chunk = Vec::with_capacity(size);
        let mut record = csv::StringRecord::new();

        while chunk.len() < size && !self.exhausted {
            match self.reader.read_record(&mut record) {
                Ok(true) => {
                    Counters::add(&counters.names_read, 1);
                    let name = record.get(0).unwrap_or_default();
                    // Line breaks would split the name in the one-per-line sinks.
                    if name.trim().is_empty()
                        || name.contains(reserved)
                        || name.contains(['\n', '\r'])
                    {
                        Counters::add(&counters.names_skipped, 1);
                        continue;
                    }
                    chunk.push(name.to_string());
                }
                Ok(false) => self.exhausted = true,
                Err(e) if e.is_io_error() => {
                    error!(error = %e, "input read failed, no further chunks will be claimed");
                    self.exhausted = true;
                }
                Err(e) => {
                    warn!(error = %e, "skipping unreadable input record");
                    Counters::add(&counters.names_skipped, 1);
                }
            }
        }

        (!chunk.is_empty()).then_some(chunk)
    }
}

pub struct BatchDispatcher {
    options: DispatchOptions,
}

impl BatchDispatcher {
    pub fn new(options: DispatchOptions) -> Result<Self, DispatchError> {
        if options.workers == 0 {
            return Err(DispatchError::Options("workers must be > 0".to_string()));
        }
        if options.chunk_size == 0 {
            return Err(DispatchError::Options("chunk_size must be > 0".to_string()));
        }
        Ok(Self { options })
    }

    /// Resolve every name in `input` and write outcomes to `sinks`.
    ///
    /// `make_linker` is called once per worker, on the worker's thread.
    pub fn run<R, W, L, F>(
        &self,
        input: R,
        sinks: &mut OutputSinks<W>,
        make_linker: F,
    ) -> Result<DispatchReport, DispatchError>
    where
        R: Read + Send,
        W: Write + Send,
        L: EntityLinker,
        F: Fn(usize) -> Result<L, LinkError> + Sync,
    {
        let reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .delimiter(self.options.delimiter)
            .quoting(self.options.quoting)
            .from_reader(input);

        let cursor = Mutex::new(InputCursor {
            reader,
            exhausted: false,
        });
        let sinks = Mutex::new(sinks);
        let counters = Counters::default();

        info!(
            workers = self.options.workers,
            chunk_size = self.options.chunk_size,
            "starting dispatch"
        );

        let results: Vec<Result<(), DispatchError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..self.options.workers)
                .map(|worker| {
                    let cursor = &cursor;
                    let sinks = &sinks;
                    let counters = &counters;
                    let make_linker = &make_linker;
                    scope.spawn(move || {
                        self.worker_loop(worker, cursor, sinks, counters, make_linker)
                    })
                })
                .collect();

            handles
                .into_iter()
                .enumerate()
                .map(|(worker, handle)| {
                    handle
                        .join()
                        .unwrap_or(Err(DispatchError::WorkerPanicked(worker)))
                })
                .collect()
        });

        sinks.into_inner().flush()?;
        for result in results {
            result?;
        }

        let report = counters.report();
        info!(
            linked = report.linked,
            not_found = report.not_found,
            unprocessed = report.unprocessed,
            chunks_failed = report.chunks_failed,
            remote_requests = report.remote_requests,
            "dispatch finished"
        );
        Ok(report)
    }

    fn worker_loop<R, W, L, F>(
        &self,
        worker: usize,
        cursor: &Mutex<InputCursor<R>>,
        sinks: &Mutex<&mut OutputSinks<W>>,
        counters: &Counters,
        make_linker: &F,
    ) -> Result<(), DispatchError>
    where
        R: Read,
        W: Write,
        L: EntityLinker,
        F: Fn(usize) -> Result<L, LinkError>,
    {
        let linker =
            make_linker(worker).map_err(|source| DispatchError::Linker { worker, source })?;

        loop {
            let chunk = cursor
                .lock()
                .claim(self.options.chunk_size, &self.options.reserved_chars, counters);
            let Some(chunk) = chunk else {
                break;
            };

            let mut not_found = BTreeSet::new();
            match linker.resolve(&chunk, &mut not_found) {
                Ok(found) => {
                    let mut sinks = sinks.lock();
                    let mut linked = 0;
                    for name in &chunk {
                        if let Some(entity) = found.get(name) {
                            sinks.write_linked(name, &entity.knowledge_base_id)?;
                            linked += 1;
                        }
                    }
                    for name in &not_found {
                        sinks.write_not_found(name)?;
                    }
                    sinks.flush()?;
                    drop(sinks);

                    Counters::add(&counters.linked, linked);
                    Counters::add(&counters.not_found, not_found.len());
                    let done = counters.chunks_processed.fetch_add(1, Ordering::Relaxed) + 1;
                    if done % 100 == 0 {
                        info!(chunks = done, "dispatch progress");
                    }
                }
                Err(err) => {
                    warn!(
                        worker,
                        error = %err,
                        names = %chunk.join("|"),
                        "dropping chunk after resolution failure"
                    );
                    let mut sinks = sinks.lock();
                    for name in &chunk {
                        sinks.write_unprocessed(name)?;
                    }
                    sinks.flush()?;
                    drop(sinks);

                    Counters::add(&counters.chunks_failed, 1);
                    Counters::add(&counters.unprocessed, chunk.len());
                }
            }
        }

        Counters::add(&counters.remote_requests, linker.remote_requests());
        Ok(())
    }
}
