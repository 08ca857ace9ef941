//! 命令定义和实现

pub mod calibrate;
pub mod config;
pub mod record;
pub mod replay;
pub mod teleop;

pub use calibrate::CalibrateCommand;
pub use config::ConfigCommand;
pub use record::RecordCommand;
pub use replay::ReplayCommand;
pub use teleop::TeleopCommand;
