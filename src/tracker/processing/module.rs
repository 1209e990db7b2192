use anyhow::Result;

use crate::tracker::collection::ActivitySignal;

/// Consumer of activity signals. The recorder is the only implementation today, a second one
/// (forwarding signals to another process for instance) would plug in here.
pub trait EventProcessor {
    fn process_next(
        &mut self,
        signal: ActivitySignal,
    ) -> impl std::future::Future<Output = Result<()>>;

    fn finalize(&mut self) -> impl std::future::Future<Output = Result<()>>;
}
