pub mod admin;
pub mod completions;
pub mod messages;
pub mod relay;
