pub mod commitment;
pub mod decision;
pub mod follow_up;
pub mod job;
pub mod message;
pub mod policy;
pub mod scenario;
pub mod thread;
