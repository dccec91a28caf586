pub use crate::cancel::{CancelToken, Cancelable};
pub use crate::config::RxConfig;
pub use crate::error::{ErrorKind, RxError, ScheduleError, TimeoutError};
pub use crate::event::Event;
pub use crate::rx::{
    Callback, CachedRx, NodeInfo, NodeKind, RunCtx, Rx, RxQueue, RxVar, Subscription,
    SubscriptionId, Value,
};
pub use crate::scheduler::{
    BlockingScheduler, PeriodicTask, Scheduler, SingleThreadScheduler, Task,
    WorkStealingScheduler, blocking_scheduler, default_scheduler,
};
pub use crate::utils::logger::LoggerConfig;
