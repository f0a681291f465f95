//! Connection lifecycle: the public [`Engine`] handle and the task it runs.
//!
//! ## Lifecycle
//!
//! 1. **Connecting** - the transport is opening the socket
//! 2. **Handshaking** - the upgrade request is out, waiting for `101`
//! 3. **Open** - frames flow both ways
//! 4. **Closing** - a close frame was sent, waiting for the reply
//! 5. **Closed**, **Failed** or **Cancelled** - exactly one terminal event was emitted

mod engine;
mod fragmenter;
mod role;
mod session;
mod state;

pub use engine::{Completion, Engine};
pub use fragmenter::MessageFragmenter;
pub use role::Role;
pub use state::ConnectionState;
