pub mod artifact;
pub mod backend;
pub mod chat;
pub mod errors;
pub mod events;
pub mod ids;
pub mod planner;
pub mod tools;
pub mod usage;
