pub mod election;
pub mod maintenance;
pub mod quota;
pub mod ratio;
pub mod redis;
pub mod sync;
