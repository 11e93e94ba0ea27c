pub mod connection;
pub mod decoder;
pub mod slot;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

pub use connection::{connect, ReplicationConnection};
pub use decoder::{is_framing_message, ChangeEventParser, ParseIssue, ParsedChange};
pub use slot::{ReplicationSlotManager, SlotInfo, SlotStatus};
pub use types::*;
