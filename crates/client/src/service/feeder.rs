use std::sync::Arc;
use std::time::Duration;

use switchyard_messaging::{Connection, Feeder, Translator};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// A recurring publisher: a schedule task ticking into a feeder task that
/// produces and publishes one envelope per tick.
#[derive(Debug)]
pub(crate) struct FeederHandle {
    name: String,
    schedule_token: CancellationToken,
    feeder_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl FeederHandle {
    /// Starts publishing to `exchange` with `routing_key`. The first tick
    /// fires immediately.
    pub(crate) fn start<C: Connection>(
        connection: C,
        exchange: String,
        routing_key: String,
        interval: Duration,
        feeder: Arc<dyn Feeder>,
    ) -> Self {
        let name = format!("{exchange}/{routing_key}");
        let schedule_token = CancellationToken::new();
        let feeder_token = CancellationToken::new();
        let task_tracker = TaskTracker::new();
        let (ticks, mut tick_receiver) = mpsc::channel::<()>(1);

        let token = schedule_token.clone();
        task_tracker.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if ticks.send(()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let token = feeder_token.clone();
        let feeder_name = name.clone();
        task_tracker.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    tick = tick_receiver.recv() => {
                        if tick.is_none() {
                            break;
                        }

                        let envelope = feeder.apply().await;
                        let outcome = match connection.translator().encode(&envelope) {
                            Ok(message) => connection
                                .publish(&exchange, &routing_key, message)
                                .await
                                .map_err(|e| e.to_string()),
                            Err(e) => Err(e.to_string()),
                        };
                        if let Err(e) = outcome {
                            warn!(feeder = %feeder_name, "failed to publish feed: {e}");
                        }
                    }
                }
            }
        });
        task_tracker.close();

        debug!(feeder = %name, ?interval, "started feeder");

        Self {
            name,
            schedule_token,
            feeder_token,
            task_tracker,
        }
    }

    pub(crate) fn cancel_schedule(&self) {
        self.schedule_token.cancel();
    }

    pub(crate) async fn terminate(&self) {
        self.schedule_token.cancel();
        self.feeder_token.cancel();
        self.task_tracker.wait().await;
        debug!(feeder = %self.name, "terminated feeder");
    }
}
