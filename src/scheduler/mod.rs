mod cron;
mod engine;
mod presets;
mod runlog;
mod store;

pub use cron::CronExpr;
pub use engine::Scheduler;
pub use engine::SchedulerEvent;
pub use presets::Preset;
pub use presets::find_preset;
pub use presets::presets;
pub use runlog::RunInfo;
pub use store::LastRun;
pub use store::Schedule;
pub use store::ScheduleError;
