//! MQTT connectivity to Bambu Lab printers

pub mod bambu_api;
pub mod dispatcher;
pub mod session;

pub use dispatcher::{CommandDispatcher, CommandReply, PrinterCommand};
pub use session::{
    PrinterConfig, PrinterSession, SessionChannels, SessionHandle, SessionSettings, SessionStatus,
};
