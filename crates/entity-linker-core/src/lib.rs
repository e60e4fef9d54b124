//! Entity linking against a knowledge base
//!
//! Links free-text names (words, titles) to knowledge-base ids such as
//! Wikidata QIDs:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  BatchDispatcher   input → chunks → W worker threads → sinks      │
//! ├───────────────────────────────────────────────────────────────────┤
//! │  ResolutionProxy   (one per worker)                               │
//! │     1. PersistentCache   hit → done, known-unlinkable → not found │
//! │     2. RemoteLinker      batch lookup, then single-name fallback  │
//! │     3. write every remote outcome back to the cache               │
//! ├───────────────────────────────────────────────────────────────────┤
//! │  PersistentCache   shared, append-only CSV log + in-memory index  │
//! │  RemoteLookupClient  per worker, capped batches, linear backoff   │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A name is sent to the remote service at most once over the lifetime of a
//! cache log: negative outcomes are cached as well.

pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod linker;
pub mod model;
pub mod remote;

pub use cache::PersistentCache;
pub use config::LinkerConfig;
pub use dispatcher::{BatchDispatcher, DispatchOptions, DispatchReport, OutputSinks};
pub use error::{CacheError, DispatchError, LinkError, TransportError};
pub use linker::{CacheLinker, EntityLinker, RemoteLinker, ResolutionProxy};
pub use model::{CacheLookup, LinkedEntity, LookupOutcome};
pub use remote::{BatchLookup, HttpTransport, LookupTransport, MockTransport, RemoteLookupClient};
