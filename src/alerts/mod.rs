/// Alert delivery with per-key cooldowns
pub mod channels;
pub mod cooldown;
pub mod dispatcher;

pub use channels::{MockChannel, NotificationChannel};
pub use cooldown::{AlertKey, CooldownTracker};
pub use dispatcher::{AlertDispatcher, DispatchOutcome, DispatcherSettings, FailedAlert, PendingAlert};
