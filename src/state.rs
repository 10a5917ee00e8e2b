use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use url::Url;

/// Upstream proxy used for every request of a download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub url: Url,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Shared proxy slot. Callers may swap the proxy between retries; the next
/// attempt picks the new value up.
#[derive(Debug, Clone)]
pub struct ProxyHandle(Arc<watch::Sender<Option<ProxyConfig>>>);

impl ProxyHandle {
    pub fn new(proxy: Option<ProxyConfig>) -> Self {
        let (sender, _) = watch::channel(proxy);
        Self(Arc::new(sender))
    }

    pub fn set(&self, proxy: Option<ProxyConfig>) {
        self.0.send_replace(proxy);
    }

    pub fn current(&self) -> Option<ProxyConfig> {
        self.0.borrow().clone()
    }
}

impl Default for ProxyHandle {
    fn default() -> Self {
        Self::new(None)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartState {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl PartState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => PartState::InProgress,
            2 => PartState::Done,
            3 => PartState::Failed,
            _ => PartState::Pending,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            PartState::Pending => 0,
            PartState::InProgress => 1,
            PartState::Done => 2,
            PartState::Failed => 3,
        }
    }
}

/// One contiguous byte range of a multi-part transfer.
///
/// `downloaded` is only advanced by the worker owning the part. The state
/// transition uses release/acquire so the joining task sees the final value.
#[derive(Debug)]
pub struct Part {
    index: usize,
    offset: u64,
    length: u64,
    downloaded: AtomicU64,
    state: AtomicU8,
}

impl Part {
    pub fn new(index: usize, offset: u64, length: u64) -> Self {
        Self {
            index,
            offset,
            length,
            downloaded: AtomicU64::new(0),
            state: AtomicU8::new(PartState::Pending.as_u8()),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Acquire)
    }

    /// Next file offset this part will write to.
    pub fn position(&self) -> u64 {
        self.offset + self.downloaded()
    }

    pub fn state(&self) -> PartState {
        PartState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: PartState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub(crate) fn add_downloaded(&self, len: u64) {
        self.downloaded.fetch_add(len, Ordering::AcqRel);
    }
}

/// Splits `[0, length)` into `count` contiguous parts. Every part has the same
/// size except the last one, which absorbs the remainder. Never produces
/// empty parts: a file shorter than `count` bytes gets fewer parts.
pub fn split_parts(length: u64, count: NonZeroUsize) -> Vec<Part> {
    let count = (count.get() as u64).min(length);
    if count == 0 {
        return vec![];
    }

    let part_size = length / count;
    (0..count)
        .map(|i| {
            let offset = i * part_size;
            let len = if i == count - 1 {
                length - offset
            } else {
                part_size
            };
            Part::new(i as usize, offset, len)
        })
        .collect()
}

#[derive(Debug, Default)]
struct Progress {
    count: AtomicU64,
    parts: OnceLock<Vec<Part>>,
}

/// Metadata and progress of one logical download attempt.
///
/// Metadata is fixed once the probe built the state; only the progress
/// counters move. A redirect replaces the whole state through
/// [`DownloadState::relocated`].
#[derive(Debug)]
pub struct DownloadState {
    source: Url,
    length: Option<u64>,
    supports_range: bool,
    multipart: bool,
    filename_hint: Option<String>,
    referer: Option<Url>,
    proxy: ProxyHandle,
    progress: Arc<Progress>,
}

impl DownloadState {
    pub fn new(source: Url) -> Self {
        Self {
            source,
            length: None,
            supports_range: false,
            multipart: false,
            filename_hint: None,
            referer: None,
            proxy: ProxyHandle::default(),
            progress: Arc::default(),
        }
    }

    pub fn with_length(mut self, length: Option<u64>) -> Self {
        self.length = length;
        self
    }

    pub fn with_range_support(mut self, supports_range: bool) -> Self {
        self.supports_range = supports_range;
        self
    }

    /// Requests multi-part mode. Only honored when the length is known and
    /// ranges are supported, so call it after the other capability setters.
    pub fn with_multipart(mut self, multipart: bool) -> Self {
        self.multipart = multipart && self.supports_range && self.length.is_some();
        self
    }

    pub fn with_filename_hint(mut self, filename_hint: Option<String>) -> Self {
        self.filename_hint = filename_hint;
        self
    }

    pub fn with_referer(mut self, referer: Option<Url>) -> Self {
        self.referer = referer;
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyHandle) -> Self {
        self.proxy = proxy;
        self
    }

    /// State bound to `location`. Referer, proxy and capabilities carry over,
    /// and so does the progress record: the bytes already written belong to
    /// the same resource.
    pub fn relocated(&self, location: Url) -> Self {
        Self {
            source: location,
            length: self.length,
            supports_range: self.supports_range,
            multipart: self.multipart,
            filename_hint: self.filename_hint.clone(),
            referer: self.referer.clone(),
            proxy: self.proxy.clone(),
            progress: Arc::clone(&self.progress),
        }
    }

    pub fn source(&self) -> &Url {
        &self.source
    }

    pub fn length(&self) -> Option<u64> {
        self.length
    }

    pub fn supports_range(&self) -> bool {
        self.supports_range
    }

    pub fn is_multipart(&self) -> bool {
        self.multipart
    }

    pub fn filename_hint(&self) -> Option<&str> {
        self.filename_hint.as_deref()
    }

    pub fn referer(&self) -> Option<&Url> {
        self.referer.as_ref()
    }

    pub fn proxy(&self) -> &ProxyHandle {
        &self.proxy
    }

    /// Bytes written so far.
    pub fn count(&self) -> u64 {
        self.progress.count.load(Ordering::Acquire)
    }

    pub(crate) fn add_count(&self, len: u64) -> u64 {
        self.progress.count.fetch_add(len, Ordering::AcqRel) + len
    }

    /// Raises `count` to `position` if it is behind; never lowers it.
    pub(crate) fn advance_count_to(&self, position: u64) -> u64 {
        self.progress
            .count
            .fetch_max(position, Ordering::AcqRel)
            .max(position)
    }

    /// Parts of a multi-part transfer; empty until the split happened.
    pub fn parts(&self) -> &[Part] {
        self.progress.parts.get().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Returns the parts, computing the split on first use. Later calls keep
    /// the original boundaries.
    pub(crate) fn init_parts(&self, split: impl FnOnce() -> Vec<Part>) -> &[Part] {
        self.progress.parts.get_or_init(split)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> DownloadState {
        DownloadState::new(Url::parse("http://example.com/a.bin").unwrap())
    }

    fn assert_contiguous(parts: &[Part], length: u64) {
        let mut next = 0;
        for part in parts {
            assert_eq!(part.offset(), next);
            assert!(part.length() > 0);
            next = part.end();
        }
        assert_eq!(next, length);
        assert_eq!(parts.iter().map(Part::length).sum::<u64>(), length);
    }

    #[test]
    fn split_covers_length_without_gaps() {
        for length in [1u64, 7, 100, 1023, 10_000_000] {
            for count in 1..=16 {
                let parts = split_parts(length, NonZeroUsize::new(count).unwrap());
                assert_contiguous(&parts, length);
            }
        }
    }

    #[test]
    fn last_part_absorbs_remainder() {
        let parts = split_parts(10, NonZeroUsize::new(3).unwrap());
        let lengths: Vec<u64> = parts.iter().map(Part::length).collect();
        assert_eq!(lengths, vec![3, 3, 4]);

        let parts = split_parts(10_000_000, NonZeroUsize::new(4).unwrap());
        assert!(parts.iter().all(|p| p.length() == 2_500_000));
    }

    #[test]
    fn short_files_get_fewer_parts() {
        assert_eq!(split_parts(3, NonZeroUsize::new(8).unwrap()).len(), 3);
        assert!(split_parts(0, NonZeroUsize::new(8).unwrap()).is_empty());
    }

    #[test]
    fn multipart_requires_length_and_range() {
        let s = state().with_multipart(true);
        assert!(!s.is_multipart());

        let s = state().with_length(Some(10)).with_multipart(true);
        assert!(!s.is_multipart());

        let s = state()
            .with_length(Some(10))
            .with_range_support(true)
            .with_multipart(true);
        assert!(s.is_multipart());
    }

    #[test]
    fn count_never_moves_backwards() {
        let s = state();
        assert_eq!(s.advance_count_to(40), 40);
        assert_eq!(s.advance_count_to(10), 40);
        assert_eq!(s.add_count(5), 45);
        assert_eq!(s.count(), 45);
    }

    #[test]
    fn parts_are_split_only_once() {
        let s = state().with_length(Some(100));
        let first = s.init_parts(|| split_parts(100, NonZeroUsize::new(4).unwrap())).len();
        let second = s.init_parts(|| split_parts(100, NonZeroUsize::new(2).unwrap())).len();
        assert_eq!(first, 4);
        assert_eq!(second, 4);
    }

    #[test]
    fn relocation_keeps_referer_and_progress() {
        let referer = Url::parse("http://example.com/page").unwrap();
        let s = state()
            .with_referer(Some(referer.clone()))
            .with_length(Some(50));
        s.add_count(20);

        let moved = s.relocated(Url::parse("http://mirror.example.com/a.bin").unwrap());
        assert_eq!(moved.source().host_str(), Some("mirror.example.com"));
        assert_eq!(moved.referer(), Some(&referer));
        assert_eq!(moved.length(), Some(50));
        assert_eq!(moved.count(), 20);
    }

    #[test]
    fn proxy_changes_are_visible_through_clones() {
        let handle = ProxyHandle::default();
        let s = state().with_proxy(handle.clone());
        assert!(s.proxy().current().is_none());

        handle.set(Some(ProxyConfig {
            url: Url::parse("http://proxy.local:3128").unwrap(),
            username: None,
            password: None,
        }));
        assert!(s.proxy().current().is_some());
    }

    #[test]
    fn part_state_round_trips_through_atomic() {
        let part = Part::new(0, 0, 10);
        assert_eq!(part.state(), PartState::Pending);
        part.set_state(PartState::Done);
        assert_eq!(part.state(), PartState::Done);
        part.add_downloaded(4);
        assert_eq!(part.position(), 4);
    }
}
