//! Control socket streaming for Setu

pub mod command_receiver;
pub mod wire;

pub use command_receiver::CommandReceiver;
pub use wire::{decode, encode, write_frame};
