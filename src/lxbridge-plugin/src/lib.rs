//! LX Music source script support for lxbridge.
//!
//! This crate provides:
//! - An embedded QuickJS host that loads a source script and exposes the
//!   `lx` object (`on`, `send`, `request`, `utils.buffer`) it expects
//! - A one-shot HTTP client behind `lx.request`
//! - A query orchestrator turning command-line arguments into one result
//!
//! # Script contract
//!
//! A source script registers a `request` handler at load time and answers
//! `musicUrl` actions with a stream URL (or a promise of one):
//!
//! ```text
//! lx.on(lx.EVENT_NAMES.request, ({ action, source, info }) => {
//!     if (action !== 'musicUrl') throw new Error('unsupported action');
//!     return new Promise((resolve, reject) => {
//!         lx.request(api + info.musicInfo.songmid, { method: 'GET' }, (err, resp) => {
//!             if (err) return reject(err);
//!             resolve(resp.body.url);
//!         });
//!     });
//! });
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use lxbridge_plugin::{run_query, RunOptions, ScriptHost};
//!
//! let result = run_query(&args, &RunOptions::default(), ScriptHost::new).await;
//! println!("{}", result.to_line());
//! ```

mod buffer;
mod bus;
mod host;
mod orchestrator;
pub mod protocol;
mod resolve;
pub mod transport;

pub use buffer::{BufferError, Encoding};
pub use bus::EventBus;
pub use host::ScriptHost;
pub use orchestrator::{parse_args, run_query, PluginHost, RunOptions, NO_RESULT};
pub use protocol::{BridgeError, ErrorKind, TaskState, ENVIRONMENT_NAME, RUNTIME_VERSION};
pub use resolve::ResolveError;
pub use transport::{TransportError, TransportRequest, TransportResponse};
