pub mod backend;
pub mod subscriber;
