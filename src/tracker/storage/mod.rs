//!  Everything the tracker keeps on disk lives under the application directory:
//!   - `queue/journal.jsonl` - heartbeats waiting for delivery, see [queue::HeartbeatQueue].
//!   - `totals.json` - active seconds per local day and project, see [totals::DailyTotals].
//!   - `timeline/YYYY-MM-DD.log` - readable activity log, see [timeline::TimelineLogger].

pub mod entities;
pub mod queue;
pub mod timeline;
pub mod totals;

pub const QUEUE_DIR: &str = "queue";
pub const TIMELINE_DIR: &str = "timeline";
