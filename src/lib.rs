//! A transparent TCP interception proxy.
//!
//! This crate accepts connections redirected to it by the kernel's own
//! routing (an `iptables`/`nft` `TPROXY` or `REDIRECT` rule), recovers each
//! connection's original destination with `getsockname()`, opens a second,
//! non-blocking connection to that destination, and splices bytes between
//! the two sockets until either side closes.
//!
//! # Usage
//!
//! The crate is driven almost entirely through [`Engine`], built from a
//! [`Config`] parsed on the command line:
//!
//! ```no_run
//! use tcp_intercept::{Config, Engine, TimestampSink};
//!
//! let config = Config::parse(std::env::args()).unwrap();
//! let log_sink = TimestampSink::install(config.log_file.as_deref(), config.log_level).unwrap();
//! let mut engine = Engine::new(&config, log_sink).unwrap();
//! engine.run().unwrap();
//! ```
//!
//! Everything below [`Engine`] — address parsing, the owning socket handle,
//! the readiness reactor, the log sink — is exposed as a public module so it
//! can be exercised independently in tests, but [`Engine`] is the crate's
//! real entry point.

pub mod addr;
pub mod config;
pub mod engine;
pub mod error;
pub mod logsink;
pub mod reactor;
pub mod socket;

pub use addr::Address;
pub use config::{BindMode, Config};
pub use engine::Engine;
pub use error::{ProxyError, Result};
pub use logsink::TimestampSink;
