//! A client for shipping tagged time-series data points to an OpenTSDB-style
//! metrics backend.
//!
//! The crate sits between a metrics collector (anything that can produce a
//! batch of [`DataPoint`]s per reporting cycle) and a remote backend, and
//! covers three concerns:
//!
//! - **Naming**: [`TagEncodedName`] parses and renders the canonical
//!   `name[key:value,...]` text form, with deterministic tag ordering and
//!   minimal quoting, so a metric plus its tag set can live in a single
//!   string.
//! - **Sanitization**: [`Sanitizer`] rewrites metric names and tag keys to
//!   satisfy a backend's character-set rules, selectable per backend via
//!   [`Policy`] and optionally memoized with a bounded LRU cache.
//! - **Delivery**: [`UdpForwarder`] packs line-protocol text into
//!   size-bounded datagrams for a local collector daemon (fire-and-forget),
//!   and [`PutClient`] ships gzip-compressed JSON batches to a bulk HTTP
//!   ingest API with structured error reporting. [`Sender`] selects between
//!   them (or a console/no-op mode) at configuration time.
//!
//! Everything is synchronous and blocking at the transport boundary: there is
//! no background thread or queue, and a send either completes or fails before
//! the call returns. Callers own scheduling and retry policy.
//!
//! # Usage
//!
//! ```no_run
//! use tsdb_client::{DataPoint, PutClient, Sanitizer, TagMap, UdpForwarder};
//!
//! let mut tags = TagMap::new();
//! tags.insert("host".to_string(), "web-1".to_string());
//! let points = vec![DataPoint::new("proc.stat.cpu", 1515021070, 1515i64, tags)];
//!
//! // Fire-and-forget UDP to a local collector daemon.
//! let mut forwarder = UdpForwarder::new(TagMap::new());
//! forwarder.forward(&points, &Sanitizer::default());
//!
//! // Or a bulk HTTP PUT to the ingest API, with errors surfaced.
//! let client = PutClient::new("my-token", TagMap::new());
//! client.send(&points, &Sanitizer::default()).expect("failed to send datapoints");
//! ```

#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod client;
pub use self::client::{PutClient, SendError};

mod forwarder;
pub use self::forwarder::UdpForwarder;

mod name;
pub use self::name::{ParseError, TagEncodedName};

mod point;
pub use self::point::{DataPoint, TagMap, Value};

mod sanitize;
pub use self::sanitize::{Policy, Sanitizer};

mod sender;
pub use self::sender::Sender;
