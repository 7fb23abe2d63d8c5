pub mod alert;
pub mod buttons;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod hotkeys;
pub mod input;
pub mod journal;
pub mod matcher;
pub mod monitor;
pub mod ocr;
pub mod rules;
pub mod scanner;
pub mod sources;
pub mod utils;
