mod config_cmd;
mod offline_cmd;
mod sync_cmd;

pub use config_cmd::ConfigCommand;
pub use offline_cmd::{ClearCommand, OfflineCommand, StatusCommand};
pub use sync_cmd::SyncCommand;
