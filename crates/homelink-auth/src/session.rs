//! Pairing session management: PIN issuance, expiry, periodic sweep

use crate::error::{AuthError, AuthResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use homelink_store::Store;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default PIN validity duration in seconds
pub const PIN_VALIDITY_SECONDS: i64 = 300;

/// Default interval between sweeps in seconds
pub const SWEEP_INTERVAL_SECONDS: u64 = 60;

/// Bounded retry count for PIN collisions. A collision needs an unexpired
/// unused session holding the same value out of a million, so more than a
/// couple of iterations never happens in practice.
const MAX_PIN_ATTEMPTS: u32 = 16;

/// Response when a pairing PIN is issued
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinIssued {
    /// The 6-digit PIN to show the user, leading zeros preserved
    pub pin: String,
    /// Absolute expiry timestamp
    pub expires_at: DateTime<Utc>,
    /// Seconds until this PIN expires
    pub expires_in: i64,
}

/// Issues PINs and owns the background sweep of dead sessions.
///
/// The sweeper is an explicitly owned task: started with [`start_sweeper`]
/// and shut down deterministically with [`stop`], so tests and the service
/// lifecycle control it directly.
///
/// [`start_sweeper`]: PairingSessionManager::start_sweeper
/// [`stop`]: PairingSessionManager::stop
pub struct PairingSessionManager {
    store: Arc<Store>,
    pin_ttl: ChronoDuration,
    sweep_interval: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl PairingSessionManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self::with_intervals(
            store,
            ChronoDuration::seconds(PIN_VALIDITY_SECONDS),
            Duration::from_secs(SWEEP_INTERVAL_SECONDS),
        )
    }

    pub fn with_intervals(
        store: Arc<Store>,
        pin_ttl: ChronoDuration,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            store,
            pin_ttl,
            sweep_interval,
            sweeper: Mutex::new(None),
        }
    }

    /// Issue a new pairing PIN.
    ///
    /// The PIN is uniformly random over 000000-999999. A value currently held
    /// by a live (unused, unexpired) session is rejected and redrawn; an
    /// expired-but-unswept session does not block reuse.
    pub async fn generate_pin(&self) -> AuthResult<PinIssued> {
        let now = Utc::now();
        for _ in 0..MAX_PIN_ATTEMPTS {
            let pin = random_pin();
            if self.store.has_live_pairing_session(&pin, now).await? {
                debug!("PIN collision, redrawing");
                continue;
            }
            let expires_at = now + self.pin_ttl;
            let session = self.store.create_pairing_session(&pin, expires_at).await?;
            info!("Issued pairing PIN, expires {}", session.expires_at);
            return Ok(PinIssued {
                pin: session.pin,
                expires_at: session.expires_at,
                expires_in: self.pin_ttl.num_seconds(),
            });
        }
        Err(AuthError::Conflict(
            "could not allocate an unused PIN".to_string(),
        ))
    }

    /// Delete expired and consumed sessions; returns how many were removed
    pub async fn sweep(&self) -> AuthResult<usize> {
        Ok(self
            .store
            .clean_expired_pairing_sessions(Utc::now())
            .await?)
    }

    /// Start the periodic sweep task. Idempotent; a second call replaces the
    /// previous task.
    pub fn start_sweeper(&self) {
        let store = self.store.clone();
        let interval = self.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval's first tick is immediate; skip it so a fresh start
            // does not sweep before anything can expire
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.clean_expired_pairing_sessions(Utc::now()).await {
                    Ok(removed) if removed > 0 => {
                        debug!("Sweeper removed {} pairing session(s)", removed);
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Pairing session sweep failed: {}", e),
                }
            }
        });
        let mut slot = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    /// Stop the sweep task if running
    pub fn stop(&self) {
        let mut slot = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }
}

impl Drop for PairingSessionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn random_pin() -> String {
    let n: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{:06}", n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn manager() -> PairingSessionManager {
        let store = Arc::new(Store::open_in_memory().unwrap());
        PairingSessionManager::new(store)
    }

    #[test]
    fn test_pin_format() {
        for _ in 0..500 {
            let pin = random_pin();
            assert_eq!(pin.len(), 6);
            assert!(pin.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_pin_digit_spread() {
        // Uniform draws over 000000-999999: across a few hundred samples
        // every digit position must show real variety. A skewed or
        // zero-stripped generator fails this immediately.
        let pins: Vec<String> = (0..400).map(|_| random_pin()).collect();
        for position in 0..6 {
            let distinct: std::collections::HashSet<char> = pins
                .iter()
                .map(|p| p.chars().nth(position).unwrap())
                .collect();
            assert!(
                distinct.len() >= 5,
                "position {} saw only {} distinct digits",
                position,
                distinct.len()
            );
        }
    }

    #[tokio::test]
    async fn test_generate_pin_persists_session() {
        let manager = manager();
        let issued = manager.generate_pin().await.unwrap();
        assert_eq!(issued.pin.len(), 6);
        assert_eq!(issued.expires_in, PIN_VALIDITY_SECONDS);

        let session = manager
            .store
            .get_pairing_session(&issued.pin)
            .await
            .unwrap()
            .unwrap();
        assert!(!session.used);
        assert_eq!(
            session.expires_at.timestamp_millis(),
            issued.expires_at.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_sweeper_removes_expired_sessions() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let manager = PairingSessionManager::with_intervals(
            store.clone(),
            ChronoDuration::seconds(300),
            Duration::from_millis(20),
        );

        store
            .create_pairing_session("987654", Utc::now() - ChronoDuration::seconds(1))
            .await
            .unwrap();

        manager.start_sweeper();
        tokio::time::sleep(Duration::from_millis(120)).await;
        manager.stop();

        assert!(store.get_pairing_session("987654").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_manual_sweep() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let manager = PairingSessionManager::new(store.clone());

        store
            .create_pairing_session("111222", Utc::now() - ChronoDuration::seconds(5))
            .await
            .unwrap();
        store
            .create_pairing_session("333444", Utc::now() + ChronoDuration::seconds(300))
            .await
            .unwrap();

        assert_eq!(manager.sweep().await.unwrap(), 1);
        assert!(store.get_pairing_session("333444").await.unwrap().is_some());
    }
}
