//! # modemlink
//!
//! AT command and OBEX file transfer engine for serial-attached modem
//! modules.
//!
//! One serial link is shared by two protocols. In AT mode the module speaks
//! line-oriented text commands and unsolicited result codes; after
//! `AT^SQWE=3` it switches to transparent mode and exchanges binary OBEX
//! frames with its flash filesystem service until the `+++` escape.
//!
//! ## Architecture
//!
//! - **Link** ([`link`]): reader task, link buffer, mode-aware dispatcher,
//!   single-slot response correlation
//! - **AT** ([`at`]): command/reply correlation, echo stripping, error
//!   terminals, unsolicited events
//! - **OBEX** ([`obex`]): frame and header codec, session (CONNECT,
//!   DISCONNECT, one exchange at a time)
//! - **Filesystem** ([`fs`]): navigation, listing, multi-part GET/PUT with
//!   progress and cancellation
//!
//! ## Example
//!
//! ```ignore
//! use modemlink::{transport::connect_bridge, FileContent, ModemBuilder};
//!
//! #[tokio::main]
//! async fn main() -> modemlink::Result<()> {
//!     let modem = ModemBuilder::new()
//!         .start(connect_bridge("/tmp/modem.sock").await?)
//!         .await?;
//!
//!     let files = modem.file_manager().await?;
//!     files.put_file(&FileContent::new("hello.txt", "hi"), true).await?;
//!     files.close().await?;
//!     Ok(())
//! }
//! ```

pub mod at;
pub mod config;
pub mod error;
pub mod events;
pub mod fs;
pub mod link;
pub mod obex;
pub mod transport;

mod client;
pub mod writer;

pub use at::{AtEngine, AtEvent};
pub use client::{Modem, ModemBuilder};
pub use config::ModemConfig;
pub use error::{AtErrorKind, ModemError, Result};
pub use events::{EventHub, ListenerId};
pub use fs::{FileContent, FileManager, FileMeta, Operation, ProgressEvent};
pub use link::Mode;
pub use obex::ObexSession;
