pub mod broadcast;
pub mod history;
