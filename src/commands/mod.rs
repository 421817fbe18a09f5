pub mod config_cmd;
pub mod status;
pub mod track;

pub use config_cmd::ConfigCommand;
pub use status::StatusCommand;
pub use track::TrackCommand;
