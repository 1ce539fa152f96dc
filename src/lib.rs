//! A persistent, multi-map key/value store backed by an append-only chunk
//! log of copy-on-write pages.
//!
//! A [`Store`] holds any number of named byte-string maps ([`MapHandle`]).
//! Writes accumulate in memory and become durable only on [`Store::commit`]
//! (or the background auto-commit thread, see [`StoreConfig::auto_commit_delay_ms`]);
//! every commit is a new store version, and old versions stay readable until
//! nothing references them and [`Store::compact`]/the reachability GC reclaim
//! their chunks.
//!
//! ```no_run
//! use chunkstore::{Store, StoreConfig};
//!
//! let store = Store::open(StoreConfig::default().file_name("data.chunkstore"))?;
//! let widgets = store.open_map("widgets")?;
//! widgets.put(b"a".to_vec(), b"1".to_vec())?;
//! store.commit()?;
//! # Ok::<(), chunkstore::StoreError>(())
//! ```

mod background;
mod chunk;
mod compact;
mod config;
mod error;
mod file_store;
mod frame;
mod gc;
mod header;
mod meta;
mod mvmap;
mod page;
mod store;
mod version;

pub use config::{BackgroundExceptionHandler, Compression, StoreConfig};
pub use error::StoreError;
pub use page::PagePosition;
pub use store::{MapHandle, Store};
pub use version::TxCounter;
