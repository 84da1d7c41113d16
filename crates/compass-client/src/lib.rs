//! Compass Client crate - consuming the chat event stream.
//!
//! Provides:
//! - SSE frame decoding from arbitrary byte chunks
//! - A token buffer pacing display updates
//! - An HTTP transport for the Compass API
//! - A conversation session with cancellation and retry

pub mod buffer;
pub mod error;
pub mod frame;
pub mod session;
pub mod transport;

pub use buffer::TokenBuffer;
pub use error::ClientError;
pub use frame::{ClientEvent, FrameDecoder};
pub use session::{ChatSession, SessionState, SessionUpdate};
pub use transport::{ByteStream, ChatTransport, HttpTransport, OutgoingMessage};
