use std::time::Duration;

use tokio::{sync::mpsc, time::MissedTickBehavior};
use tracing::{debug, warn};

use super::actor::{self, Request};

/// Periodically asks the actor to ping every socket.
///
/// Holds only a weak sender; exits once the broker has been dropped.
pub(crate) async fn run(
    requests: mpsc::WeakSender<Request>,
    interval: Duration,
    request_timeout: Option<Duration>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.reset();

    loop {
        ticker.tick().await;
        let Some(sender) = requests.upgrade() else {
            debug!("broker dropped; heartbeat loop exiting");
            return;
        };

        match actor::call(&sender, |reply| Request::Heartbeat { reply }, request_timeout).await {
            Ok(alive) => debug!(alive, "heartbeat sweep completed"),
            Err(error) => warn!(error = %error, "heartbeat sweep failed"),
        }
    }
}
