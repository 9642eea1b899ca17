use crate::{
    config::{
        EngineConfig,
        RetryPolicy,
    },
    error::GatewayError,
    events::{
        EventFilter,
        EventName,
        RawEvent,
    },
    gateway::{
        LogSource,
        retry::retry_delay,
    },
};
use futures::Stream;
use std::{
    pin::Pin,
    sync::Arc,
    task::{
        Context,
        Poll,
    },
    time::Duration,
};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    Instrument,
    debug,
    info,
    info_span,
    warn,
};

/// Live feed of one contract event.
///
/// Cancelling stops the producer, then hands back whatever it had already
/// pulled off the chain so nothing received is lost. Dropping cancels
/// without draining.
pub struct Subscription {
    name: EventName,
    events: mpsc::Receiver<RawEvent>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Spawns `producer` with the sending half of the feed and the token it
    /// must watch for cancellation.
    pub fn spawn<F, Fut>(name: EventName, buffer: usize, producer: F) -> Self
    where
        F: FnOnce(mpsc::Sender<RawEvent>, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (sender, events) = mpsc::channel(buffer.max(1));
        let cancel = CancellationToken::new();
        let span = info_span!("subscription", event = %name);
        let task = tokio::spawn(producer(sender, cancel.clone()).instrument(span));
        Self {
            name,
            events,
            cancel,
            task: Some(task),
        }
    }

    pub fn name(&self) -> EventName {
        self.name
    }

    pub async fn next(&mut self) -> Option<RawEvent> {
        self.events.recv().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stops the producer and returns the events it delivered but nobody
    /// consumed yet. Calling it again returns nothing.
    pub async fn cancel(&mut self) -> Vec<RawEvent> {
        self.cancel.cancel();
        let mut drained = Vec::new();
        while let Some(event) = self.events.recv().await {
            drained.push(event);
        }
        if let Some(task) = self.task.take()
            && let Err(err) = task.await
        {
            warn!(event = %self.name, %err, "subscription task ended abnormally");
        }
        debug!(event = %self.name, drained = drained.len(), "subscription cancelled");
        drained
    }
}

impl Stream for Subscription {
    type Item = RawEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<RawEvent>> {
        self.get_mut().events.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollSettings {
    pub poll_interval: Duration,
    pub confirmations: u64,
    pub max_block_range: u64,
    pub buffer: usize,
    pub retry: RetryPolicy,
}

impl PollSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            confirmations: config.confirmations,
            max_block_range: config.max_block_range,
            buffer: config.subscription_buffer,
            retry: config.retry,
        }
    }

    /// Highest block whose logs are considered final at head `latest`.
    fn finalized(&self, latest: u64) -> Option<u64> {
        latest.saturating_add(1).checked_sub(self.confirmations.max(1))
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Spawns a subscription that polls `source` for `name` logs.
pub fn poll_subscription<L: LogSource>(
    source: Arc<L>,
    name: EventName,
    filter: EventFilter,
    settings: PollSettings,
) -> Subscription {
    Subscription::spawn(name, settings.buffer, move |sender, cancel| {
        poll_logs(source, name, filter, settings, sender, cancel)
    })
}

struct Batch {
    events: Vec<RawEvent>,
    to_block: u64,
    caught_up: bool,
}

async fn next_batch<L: LogSource>(
    source: &L,
    name: EventName,
    filter: &EventFilter,
    cursor: u64,
    settings: &PollSettings,
) -> Result<Option<Batch>, GatewayError> {
    let latest = source.latest_block().await?;
    let Some(finalized) = settings.finalized(latest) else {
        return Ok(None);
    };
    if finalized < cursor {
        return Ok(None);
    }
    let range_end =
        cursor.saturating_add(settings.max_block_range.saturating_sub(1));
    let to_block = finalized.min(range_end);
    let mut events = source.logs(name, filter, cursor, to_block).await?;
    events.retain(|event| event.name() == name && filter.matches(event));
    events.sort_by_key(|event| (event.block_number, event.log_index));
    Ok(Some(Batch {
        events,
        to_block,
        caught_up: to_block == finalized,
    }))
}

/// Producer loop behind every polling subscription.
///
/// The cursor only advances past a block range once all of its logs were
/// handed to the channel; after a transport failure the range is fetched
/// again, so consumers see at-least-once delivery.
async fn poll_logs<L: LogSource>(
    source: Arc<L>,
    name: EventName,
    filter: EventFilter,
    settings: PollSettings,
    sender: mpsc::Sender<RawEvent>,
    cancel: CancellationToken,
) {
    let mut cursor = filter.from_block;
    let mut failures: u32 = 0;
    info!(cursor, "subscription started");
    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => break,
            batch = next_batch(&*source, name, &filter, cursor, &settings) => batch,
        };

        let wait = match batch {
            Ok(batch) => {
                if failures > 0 {
                    info!(cursor, failures, "subscription recovered; replaying from cursor");
                    failures = 0;
                }
                match batch {
                    Some(batch) => {
                        for event in batch.events {
                            if sender.send(event).await.is_err() {
                                debug!("subscriber dropped the feed");
                                return;
                            }
                        }
                        cursor = batch.to_block + 1;
                        if batch.caught_up {
                            settings.poll_interval
                        } else {
                            Duration::ZERO
                        }
                    }
                    None => settings.poll_interval,
                }
            }
            Err(err) => {
                failures = failures.saturating_add(1);
                let delay = retry_delay(&settings.retry, failures);
                warn!(%err, failures, cursor, ?delay, "log poll failed; resubscribing");
                delay
            }
        };

        if wait.is_zero() {
            if cancel.is_cancelled() {
                break;
            }
            continue;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
    debug!(cursor, "subscription stopped");
}
