use anyhow::Result;
use module::EventProcessor;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error};

use super::collection::ActivitySignal;

pub mod debounce;
pub mod module;
pub mod recorder;

/// Receives signals from the host adapter and hands them to the processor one at a time. Runs
/// until every [ActivityNotifier](super::collection::ActivityNotifier) is dropped.
pub struct ProcessingModule<Processor> {
    receiver: UnboundedReceiver<ActivitySignal>,
    processor: Processor,
}

impl<P: EventProcessor> ProcessingModule<P> {
    pub fn new(receiver: UnboundedReceiver<ActivitySignal>, processor: P) -> Self {
        Self {
            receiver,
            processor,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        while let Some(signal) = self.receiver.recv().await {
            debug!("Processing signal {:?}", signal);
            if let Err(e) = self.processor.process_next(signal.clone()).await {
                error!("Error processing signal {:?}: {e:?}", signal)
            }
        }

        self.receiver.close();
        self.processor.finalize().await
    }
}
