//! One-to-one calls.
//!
//! # Architecture
//!
//! - [`CallSession`]: one call, driven by a single actor task that owns the
//!   state machine, the peer connection and every timer
//! - [`SessionMachine`]: the session lifecycle and role assignment
//! - [`CandidateQueue`]: ordered ICE candidate buffering in both directions
//! - [`CallManager`]: registry of sessions sharing one relay connection
//!
//! # Call flow
//!
//! Both participants publish themselves in the room. The initiator offers as
//! soon as it sees the other side; the other side answers. If both offer at
//! once, the side with the lexically greater relay identity keeps its offer
//! and the other rolls back and answers. Deleting the room ends the call for
//! everyone.

pub mod candidates;
mod error;
mod manager;
mod session;
pub mod state;

pub use candidates::CandidateQueue;
pub use error::CallError;
pub use manager::{CallHandle, CallManager};
pub use session::{CallDependencies, CallSession, CallSetup, SessionSnapshot};
pub use state::{
    CallRole, CallSessionState, CallTransition, GlareOutcome, InvalidTransition, SessionMachine,
    resolve_glare,
};
