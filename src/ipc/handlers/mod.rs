pub mod backup_exchange;
pub mod core;
pub mod credits;
pub mod reports;
pub mod roster;
pub mod sessions;
