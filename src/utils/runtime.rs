use std::time::Duration;

use anyhow::Result;

/// How long blocking work (a pending stdin read for instance) may delay process exit.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

pub fn multi_thread_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .thread_name("beatkeeper-worker")
        .enable_all()
        .build()?)
}
