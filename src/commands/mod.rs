// Command pattern for softphone operations.
// Commands travel from the UI to the orchestrator task; each one carries a
// oneshot for its reply.

pub mod handle;
pub mod sip_commands;

pub use handle::SoftphoneHandle;
pub use sip_commands::SipCommand;
