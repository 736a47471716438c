pub mod device;
pub mod jobs;
pub mod system;
