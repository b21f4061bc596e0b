//! Operator channel: chat commands, the settings menu and its Telegram transport.

mod console;
mod menu;
mod telegram;

pub use console::{status_report, OperatorConsole};
pub use telegram::TelegramChannel;
