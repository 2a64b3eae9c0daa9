//! Pluggable OTP verification.
//!
//! The authority never computes codes itself; it hands the stored secret, the
//! user's known clock drift and the submitted code(s) to an [`OtpPolicy`].
//! [`TotpPolicy`] implements RFC 6238 codes with `totp-rs`.

use super::store::OtpSecret;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use totp_rs::{Algorithm, TOTP};

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("system clock is before the unix epoch")]
    Clock,
    #[error("otp backend failure: {0}")]
    Backend(String),
}

pub trait OtpPolicy: Send + Sync {
    /// Check one code against the secret, honoring the known drift.
    ///
    /// # Errors
    /// Returns [`PolicyError`] if the check itself could not run.
    fn verify(&self, secret: &OtpSecret, drift: i64, otp: &str) -> Result<bool, PolicyError>;

    /// Find the drift at which `first` and `second` are consecutive codes.
    ///
    /// Returns the new drift, or `None` if no offset in the search window matches.
    ///
    /// # Errors
    /// Returns [`PolicyError`] if the search itself could not run.
    fn resync(
        &self,
        secret: &OtpSecret,
        drift: i64,
        first: &str,
        second: &str,
    ) -> Result<Option<i64>, PolicyError>;
}

/// Time-based codes: SHA1, 30 second steps, 6 digits by default.
#[derive(Debug, Clone)]
pub struct TotpPolicy {
    digits: usize,
    step: u64,
    skew: u8,
    resync_window: i64,
}

impl Default for TotpPolicy {
    fn default() -> Self {
        Self {
            digits: 6,
            step: 30,
            skew: 1,
            resync_window: 20,
        }
    }
}

impl TotpPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_digits(mut self, digits: usize) -> Self {
        self.digits = digits;
        self
    }

    #[must_use]
    pub fn with_skew(mut self, skew: u8) -> Self {
        self.skew = skew;
        self
    }

    /// Largest drift, in steps, a resync may move the user's clock by.
    #[must_use]
    pub fn with_resync_window(mut self, steps: i64) -> Self {
        self.resync_window = steps.max(0);
        self
    }

    fn totp(&self, secret: &OtpSecret) -> TOTP {
        TOTP::new_unchecked(
            Algorithm::SHA1,
            self.digits,
            self.skew,
            self.step,
            secret.expose().to_vec(),
        )
    }

    fn shifted(&self, now: u64, drift: i64) -> u64 {
        let step = i64::try_from(self.step).unwrap_or(i64::MAX);
        let now = i64::try_from(now).unwrap_or(i64::MAX);
        let shifted = now.saturating_add(drift.saturating_mul(step));
        u64::try_from(shifted).unwrap_or(0)
    }

    pub(crate) fn verify_at(&self, secret: &OtpSecret, drift: i64, otp: &str, now: u64) -> bool {
        if otp.len() != self.digits || !otp.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        self.totp(secret).check(otp, self.shifted(now, drift))
    }

    pub(crate) fn resync_at(
        &self,
        secret: &OtpSecret,
        drift: i64,
        first: &str,
        second: &str,
        now: u64,
    ) -> Option<i64> {
        let totp = self.totp(secret);
        // Closest offsets first so a lucky collision far away never wins.
        let mut offsets: Vec<i64> = (-self.resync_window..=self.resync_window).collect();
        offsets.sort_by_key(|offset| offset.abs());

        offsets.into_iter().find_map(|offset| {
            let candidate = drift.saturating_add(offset);
            let at = self.shifted(now, candidate);
            (totp.generate(at) == first && totp.generate(at.saturating_add(self.step)) == second)
                .then_some(candidate)
        })
    }
}

fn unix_now() -> Result<u64, PolicyError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .map_err(|_| PolicyError::Clock)
}

impl OtpPolicy for TotpPolicy {
    fn verify(&self, secret: &OtpSecret, drift: i64, otp: &str) -> Result<bool, PolicyError> {
        Ok(self.verify_at(secret, drift, otp, unix_now()?))
    }

    fn resync(
        &self,
        secret: &OtpSecret,
        drift: i64,
        first: &str,
        second: &str,
    ) -> Result<Option<i64>, PolicyError> {
        Ok(self.resync_at(secret, drift, first, second, unix_now()?))
    }
}
