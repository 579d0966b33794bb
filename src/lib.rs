//! ferry core library
//!
//! This library provides the client side of an editor-to-eval-server
//! bridge:
//!
//! - `net` - framed TCP transport (length-prefixed JSON) and connection
//!   lifecycle
//! - `protocol` - the tagged wire message envelope
//! - `correlate` - request id issuance and pending-request bookkeeping
//! - `session` - the session protocol layered on top: handshake, dispatch,
//!   and the busy probe
//!
//! # Session Module
//!
//! The `session` module is the recommended entry point:
//!
//! ```ignore
//! use ferry::session::{Session, SessionEvent};
//!
//! let mut session: Session<MyOrigin> = Session::new("127.0.0.1:6666");
//! session.start().await?;
//! let id = session.send_code("1+1", Some(origin)).await?;
//! while let Some(event) = session.next_event().await {
//!     match event {
//!         SessionEvent::Result { contents, context, is_error } => { /* render */ }
//!         _ => {}
//!     }
//! }
//! ```

pub mod correlate;
pub mod net;
pub mod protocol;
pub mod session;
