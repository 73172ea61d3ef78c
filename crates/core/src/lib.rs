pub mod command;
pub mod decode;
pub mod event;
pub mod fair;
pub mod types;
