//! Polling watcher for removable key media.
//!
//! Presence transitions become scheduler triggers; the watcher holds no state
//! the engine depends on.

use lockchain_core::{LockchainConfig, Trigger};
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};

const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Presence {
    Absent,
    /// The block device is attached but the key file has not appeared yet.
    DeviceOnly,
    KeyReady,
}

#[derive(Debug, Clone)]
pub struct MediaWatch {
    key_path: PathBuf,
    device_paths: Vec<PathBuf>,
    mount_timeout: Duration,
    poll: Duration,
}

impl MediaWatch {
    pub fn from_config(config: &LockchainConfig) -> Self {
        let mut device_paths = Vec::new();
        if let Some(label) = config.usb.device_label.as_deref() {
            device_paths.push(Path::new("/dev/disk/by-label").join(label));
        }
        if let Some(uuid) = config.usb.device_uuid.as_deref() {
            device_paths.push(Path::new("/dev/disk/by-uuid").join(uuid));
        }
        Self {
            key_path: config.key_hex_path(),
            device_paths,
            mount_timeout: Duration::from_secs(config.usb.mount_timeout_secs),
            poll: POLL_INTERVAL,
        }
    }

    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    fn presence(&self) -> Presence {
        let key_ready = fs::metadata(&self.key_path)
            .map(|meta| meta.is_file() && meta.len() > 0)
            .unwrap_or(false);
        if key_ready {
            Presence::KeyReady
        } else if self.device_paths.iter().any(|path| path.exists()) {
            Presence::DeviceOnly
        } else {
            Presence::Absent
        }
    }
}

/// Poll until `shutdown` flips or the scheduler side of `triggers` closes.
pub async fn watch_media(
    media: MediaWatch,
    triggers: mpsc::Sender<Trigger>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(media.poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last: Option<Presence> = None;
    let mut device_seen: Option<Instant> = None;
    let mut mount_warned = false;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let now = media.presence();
        if now == Presence::DeviceOnly {
            let since = *device_seen.get_or_insert_with(Instant::now);
            if !mount_warned && since.elapsed() >= media.mount_timeout {
                warn!(
                    "key device attached but {} did not appear within {:?}",
                    media.key_path.display(),
                    media.mount_timeout
                );
                mount_warned = true;
            }
        } else {
            device_seen = None;
            mount_warned = false;
        }

        let previous = last.replace(now);
        let trigger = match (previous, now) {
            // first observation only seeds state; the scheduler ticks at start-up
            (None, _) => None,
            (Some(before), Presence::KeyReady) if before != Presence::KeyReady => {
                info!("key material present at {}", media.key_path.display());
                Some(Trigger::MediaInserted)
            }
            (Some(Presence::KeyReady), after) if after != Presence::KeyReady => {
                warn!("key material at {} went away", media.key_path.display());
                Some(Trigger::MediaRemoved)
            }
            _ => None,
        };

        if let Some(trigger) = trigger {
            if triggers.send(trigger).await.is_err() {
                debug!("scheduler gone; stopping media watcher");
                break;
            }
        }
    }
}
