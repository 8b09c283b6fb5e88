pub mod completion;
pub mod errors;
pub mod events;
pub mod history;
pub mod ids;
pub mod messages;
pub mod plan;
pub mod tools;
