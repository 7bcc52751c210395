mod checkout;
mod commit;
mod init;
mod pull;
mod rebuild_index;
mod remove;
mod verify;

pub use checkout::cmd_checkout;
pub use commit::cmd_commit;
pub use init::cmd_init;
pub use pull::cmd_pull;
pub use rebuild_index::cmd_rebuild_index;
pub use remove::cmd_remove;
pub use verify::cmd_verify;
