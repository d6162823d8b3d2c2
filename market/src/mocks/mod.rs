//! Mock collaborators for tests and demos.
//!
//! Enabled through the default `test-utils` feature. Each mock records what
//! passed through it so tests can assert on side effects.

use crate::error::{MarketError, Result};
use crate::notifications::Notification;
use crate::providers::{
    CityDirectory, EmailSender, MalwareScanner, ProviderError, ProviderResult, PushChannel,
    ScanVerdict,
};
use crate::stores::memory::InMemoryListingRepository;
use crate::stores::ListingRepository;
use crate::types::{CityId, Listing, ListingId, UserId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// In-memory city directory keyed on the lowercased, trimmed name.
#[derive(Default)]
pub struct MockCityDirectory {
    cities: Mutex<HashMap<String, CityId>>,
}

impl MockCityDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn key(name: &str) -> String {
        name.trim().to_lowercase()
    }
}

#[async_trait]
impl CityDirectory for MockCityDirectory {
    async fn resolve_or_create(&self, name: &str) -> ProviderResult<CityId> {
        let key = Self::key(name);
        if key.is_empty() {
            return Err(ProviderError::new("city-directory", "empty city name"));
        }
        let mut cities = self
            .cities
            .lock()
            .map_err(|_| ProviderError::new("city-directory", "lock poisoned"))?;
        Ok(*cities.entry(key).or_insert_with(CityId::new))
    }

    async fn lookup(&self, name: &str) -> ProviderResult<Option<CityId>> {
        let cities = self
            .cities
            .lock()
            .map_err(|_| ProviderError::new("city-directory", "lock poisoned"))?;
        Ok(cities.get(&Self::key(name)).copied())
    }
}

/// Scanner that always returns a fixed verdict.
pub struct MockScanner {
    verdict: ScanVerdict,
    unavailable: bool,
}

impl MockScanner {
    /// Scanner that passes everything.
    #[must_use]
    pub fn clean() -> Self {
        Self {
            verdict: ScanVerdict::Clean,
            unavailable: false,
        }
    }

    /// Scanner that flags everything as malicious.
    #[must_use]
    pub fn infected() -> Self {
        Self {
            verdict: ScanVerdict::Infected,
            unavailable: false,
        }
    }

    /// Scanner whose backend is down.
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            verdict: ScanVerdict::Clean,
            unavailable: true,
        }
    }
}

#[async_trait]
impl MalwareScanner for MockScanner {
    async fn scan(&self, _data: &[u8]) -> ProviderResult<ScanVerdict> {
        if self.unavailable {
            return Err(ProviderError::new("malware-scanner", "backend unreachable"));
        }
        Ok(self.verdict)
    }
}

/// Listing repository whose writes can be switched to fail, for exercising
/// the durable-write failure path. Reads always work.
#[derive(Default)]
pub struct FlakyListingRepository {
    inner: InMemoryListingRepository,
    fail_saves: AtomicBool,
}

impl FlakyListingRepository {
    /// Creates a working repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent save fail.
    pub fn fail_saves(&self) {
        self.fail_saves.store(true, Ordering::SeqCst);
    }

    /// Makes saves work again.
    pub fn restore(&self) {
        self.fail_saves.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl ListingRepository for FlakyListingRepository {
    async fn save(&self, listing: &Listing) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(MarketError::Database("disk unavailable".to_string()));
        }
        self.inner.save(listing).await
    }

    async fn find(&self, id: ListingId) -> Result<Option<Listing>> {
        self.inner.find(id).await
    }

    async fn load_all(&self) -> Result<Vec<Listing>> {
        self.inner.load_all().await
    }

    async fn completed_by_owner(&self, owner: UserId) -> Result<Vec<Listing>> {
        self.inner.completed_by_owner(owner).await
    }

    async fn completed_by_claimant(&self, claimant: UserId) -> Result<Vec<Listing>> {
        self.inner.completed_by_claimant(claimant).await
    }

    async fn completed_in_city(&self, city: CityId) -> Result<Vec<Listing>> {
        self.inner.completed_in_city(city).await
    }
}

/// A sent email captured by [`RecordingEmailSender`].
#[derive(Debug, Clone)]
pub struct SentEmail {
    /// Recipient user.
    pub to: UserId,
    /// Subject line.
    pub subject: String,
    /// Body text.
    pub body: String,
}

/// Email sender that records instead of sending.
#[derive(Default)]
pub struct RecordingEmailSender {
    sent: Mutex<Vec<SentEmail>>,
    fail: AtomicBool,
}

impl RecordingEmailSender {
    /// Creates a sender that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent send fail.
    pub fn fail_sends(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// Everything sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl EmailSender for RecordingEmailSender {
    async fn send(&self, to: UserId, subject: &str, body: &str) -> ProviderResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProviderError::new("email", "smtp unavailable"));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(SentEmail {
                to,
                subject: subject.to_string(),
                body: body.to_string(),
            });
        }
        Ok(())
    }
}

/// Push channel that records pushes, optionally failing every attempt.
#[derive(Default)]
pub struct RecordingPushChannel {
    sent: Mutex<Vec<(UserId, Notification)>>,
    fail: bool,
}

impl RecordingPushChannel {
    /// Channel that delivers everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel where every push fails.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    /// Everything pushed so far.
    #[must_use]
    pub fn sent(&self) -> Vec<(UserId, Notification)> {
        self.sent.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PushChannel for RecordingPushChannel {
    async fn push(&self, recipient: UserId, notification: &Notification) -> ProviderResult<()> {
        if self.fail {
            return Err(ProviderError::new("push", "channel disconnected"));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((recipient, notification.clone()));
        }
        Ok(())
    }
}
