//! Queues and worker primitives shared by the scheduler and stream backends.

pub mod channel;
pub mod device_queue;

pub use channel::MpmcQueue;
pub use device_queue::DeviceQueue;
