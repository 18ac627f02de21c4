pub mod clock;
pub mod dispatch;
pub mod error;
pub mod interval;
pub mod timer;

pub use crate::clock::Clock;
pub use crate::dispatch::{Dispatcher, Inline, RunQueue, WorkerThread};
pub use crate::error::{IntervalError, PostError, TimerError};
pub use crate::interval::{Expire, Interval, WeakInterval};
pub use crate::timer::{ManualTimer, TaskHandle, ThreadTimer, TimerHost, TimerSource};
