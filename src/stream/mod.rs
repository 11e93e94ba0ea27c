pub mod consumer;
pub mod shutdown;

pub use consumer::{ChangeSource, ConsumerState, StreamConsumer, StreamStats};
pub use shutdown::{install_signal_handlers, ShutdownSignal};
