use std::time::Duration;

use async_stream::stream;
use futures::Stream;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{FileSystemEvent, FsMonitorError, WatchSession};

impl WatchSession {
    /// Drives the session from a tokio task: one pump per `period`, every
    /// queued event yielded in order. A sticky error is yielded once and
    /// ends the stream, as does cancelling `cancel`. The session is closed
    /// when the stream is dropped.
    pub fn into_stream(
        self,
        period: Duration,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<FileSystemEvent, FsMonitorError>> + Send {
        stream! {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        break;
                    }
                    _ = ticker.tick() => {
                        let pumped = self.pump();
                        while let Some(event) = self.pop() {
                            yield Ok(event);
                        }
                        if let Err(e) = pumped {
                            yield Err(e);
                            break;
                        }
                    }
                }
            }
        }
    }
}
