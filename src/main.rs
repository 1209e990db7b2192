use anyhow::Result;
use beatkeeper::{
    cli::run_cli,
    utils::runtime::{multi_thread_runtime, SHUTDOWN_GRACE},
};
use tracing::error;

fn main() -> Result<()> {
    let runtime = multi_thread_runtime()?;
    let result = runtime.block_on(run_cli()).inspect_err(|e| {
        error!("Error running cli {e:?}");
    });
    // Reading stdin occupies a blocking thread that never notices shutdown.
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}
