use futures::Stream;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::watcher;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{event::Event, source::EventSource, strategy::RoutingStrategy};

pub const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Applies node events to a routing strategy, one at a time and in the
/// order they were observed.
pub struct Reconciler<S> {
    stream: S,
    source: EventSource,
    strategy: Box<dyn RoutingStrategy>,
}

impl<S> Reconciler<S>
where
    S: Stream<Item = Result<watcher::Event<Node>, watcher::Error>> + Send + 'static,
{
    pub fn new(stream: S, strategy: Box<dyn RoutingStrategy>) -> Self {
        Self {
            stream,
            source: EventSource::new(),
            strategy,
        }
    }

    /// Runs until `token` is cancelled or the watch ends.
    pub async fn run(mut self, token: CancellationToken) {
        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let producer = tokio::spawn(self.source.forward(self.stream, tx));

        info!("reconciler started");
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("reconciler cancelled");
                    break;
                }
                event = rx.recv() => match event {
                    Some(event) => dispatch(self.strategy.as_mut(), &event),
                    None => {
                        info!("event source finished");
                        break;
                    }
                },
            }
        }

        producer.abort();
    }
}

fn dispatch(strategy: &mut dyn RoutingStrategy, event: &Event) {
    if let Err(err) = strategy.handle(event) {
        error!(
            node = %event.node.name,
            kind = ?event.kind,
            %err,
            "failed to apply node event"
        );
    }
}
