pub mod tokio_scheduler;
pub mod virtual_clock;

pub use tokio_scheduler::TokioTimerScheduler;
pub use virtual_clock::VirtualTimerScheduler;
