pub mod map;
pub mod serve;
pub mod status;
