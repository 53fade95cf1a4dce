use thiserror::Error;

use crate::backoff::Backoff;
use crate::types::WifiStatus;

pub const WIFI_BACKOFF_BASE_MS: u64 = 2_000;
pub const WIFI_BACKOFF_MAX_MS: u64 = 60_000;
pub const WIFI_ASSOC_TIMEOUT_MS: u64 = 15_000;

#[derive(Debug, Error)]
#[error("wifi driver error: {0}")]
pub struct WifiDriverError(pub String);

// The single radio handle, owned by whoever implements this.
pub trait WifiDriver {
    fn link_up(&mut self) -> bool;
    fn begin_connect(&mut self, ssid: &str, password: &str) -> Result<(), WifiDriverError>;
    fn abandon(&mut self);
}

#[derive(Debug)]
pub struct WifiManager {
    ssid: String,
    password: String,
    status: WifiStatus,
    backoff: Backoff,
    attempt_started_ms: Option<u64>,
    retry_at_ms: Option<u64>,
}

impl WifiManager {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
            status: WifiStatus::Disconnected,
            backoff: Backoff::new(WIFI_BACKOFF_BASE_MS, WIFI_BACKOFF_MAX_MS),
            attempt_started_ms: None,
            retry_at_ms: None,
        }
    }

    pub fn status(&self) -> WifiStatus {
        self.status
    }

    // Non-blocking, called once per scheduler tick. An already-up link is
    // adopted as-is: the manager never tears down a healthy connection to
    // apply its own credentials.
    pub fn poll<D: WifiDriver>(&mut self, driver: &mut D, now_ms: u64) -> WifiStatus {
        if driver.link_up() {
            if self.status != WifiStatus::Connected {
                self.status = WifiStatus::Connected;
                self.backoff.reset();
                self.attempt_started_ms = None;
                self.retry_at_ms = None;
            }
            return self.status;
        }

        match self.status {
            WifiStatus::Connected => {
                // Link dropped; retry on the next pass.
                self.status = WifiStatus::Disconnected;
                self.retry_at_ms = None;
            }
            WifiStatus::Connecting => {
                let started = self.attempt_started_ms.unwrap_or(now_ms);
                if now_ms.saturating_sub(started) >= WIFI_ASSOC_TIMEOUT_MS {
                    driver.abandon();
                    self.fail(now_ms);
                }
            }
            WifiStatus::Disconnected | WifiStatus::Failed => {
                if self.retry_at_ms.is_none_or(|at| now_ms >= at) {
                    match driver.begin_connect(&self.ssid, &self.password) {
                        Ok(()) => {
                            self.status = WifiStatus::Connecting;
                            self.attempt_started_ms = Some(now_ms);
                        }
                        Err(_) => self.fail(now_ms),
                    }
                }
            }
        }

        self.status
    }

    fn fail(&mut self, now_ms: u64) {
        self.status = WifiStatus::Failed;
        self.attempt_started_ms = None;
        self.retry_at_ms = Some(now_ms.saturating_add(self.backoff.next_delay_ms()));
    }
}
