//! P2P subsystem: RLPx sessions speaking the `eth` subprotocol.

pub mod codec;
pub mod counters;
pub mod handler;
pub mod manager;
pub mod rlpx;
pub mod session;

pub use codec::{Codec, CodecError, EthMessage, MessageKind, Status};
pub use counters::{CounterSnapshot, PeerCounters};
pub use handler::{HandlerContext, HandlerOptions};
pub use manager::{AdmitOutcome, BlockRef, PeerManager, PeerSlot, Registry, SharedState};
pub use rlpx::{Hello, LocalNode, DEFAULT_CLIENT_NAME};
pub use session::{
    CloseReason, PeerSnapshot, Session, SessionConfig, SessionError, SessionHandle, SessionState,
    StatusConfig,
};
