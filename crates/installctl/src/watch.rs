//! Follow the event stream across dropped connections and daemon restarts.
//!
//! The view never keeps state of its own: after every (re)connect the
//! Welcome snapshot replaces it, and only events newer than the snapshot
//! are passed on.

use installer_common::{Event, EventEnvelope, InstallError, SessionSnapshot};
use std::time::Duration;

use crate::client::{ClientError, InstallClient};

#[derive(Debug, Clone, PartialEq)]
pub enum WatchUpdate {
    /// Connected; the snapshot is the whole truth as of now.
    Synced(SessionSnapshot),
    Event(EventEnvelope),
    /// Connection lost, next attempt after `retry_in`.
    Lost { error: String, retry_in: Duration },
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Return once the session reaches a terminal state
    pub until_finished: bool,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            until_finished: false,
        }
    }
}

/// Stream updates for the daemon at `path` into `on_update`. Transport
/// failures reconnect with backoff; anything else ends the watch.
pub async fn follow<F>(path: &str, options: &WatchOptions, mut on_update: F) -> Result<(), ClientError>
where
    F: FnMut(WatchUpdate),
{
    let mut backoff = options.initial_backoff;
    loop {
        let error = match InstallClient::connect(path).await {
            Ok(mut client) => {
                backoff = options.initial_backoff;
                match stream(&mut client, options, &mut on_update).await {
                    Ok(()) => return Ok(()),
                    Err(e) if e.is_transport() => e,
                    Err(e) => return Err(e),
                }
            }
            Err(e) if e.is_transport() => e,
            Err(e) => return Err(e),
        };

        on_update(WatchUpdate::Lost {
            error: error.to_string(),
            retry_in: backoff,
        });
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(options.max_backoff);
    }
}

async fn stream<F>(
    client: &mut InstallClient,
    options: &WatchOptions,
    on_update: &mut F,
) -> Result<(), ClientError>
where
    F: FnMut(WatchUpdate),
{
    let Some(snapshot) = client.welcome().snapshot.clone() else {
        return Err(ClientError::Remote(InstallError::Forbidden {
            reason: client.welcome().reason.clone(),
        }));
    };

    let mut last_seq = snapshot.last_event_seq;
    let finished = snapshot.state.is_terminal();
    on_update(WatchUpdate::Synced(snapshot));
    if finished && options.until_finished {
        return Ok(());
    }

    loop {
        let envelope = client.next_event().await?;
        if envelope.seq <= last_seq {
            continue;
        }
        last_seq = envelope.seq;
        let done = matches!(envelope.event, Event::InstallFinished { .. });
        on_update(WatchUpdate::Event(envelope));
        if done && options.until_finished {
            return Ok(());
        }
    }
}
