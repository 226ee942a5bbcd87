pub mod command;
pub use self::command::command;

pub mod health;
pub use self::health::health;
