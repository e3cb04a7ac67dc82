//! Pairs posts with their author's profile event.
//!
//! Posts and profiles arrive on independent subscriptions in no particular
//! order. The cache keeps at most one post per author while that author's
//! profile is outstanding:
//!
//! ```text
//!   post(p)     ──► pending[p] = post, emit REQ profile-<p[..8]>
//!   post(p)'    ──► pending[p] = post'   (previous post dropped), emit REQ
//!   profile(p)  ──► pop pending[p] ──► CorrelatedResult { post', profile }
//!   profile(q)  ──► nothing pending for q, dropped
//! ```
//!
//! Pending posts are never expired. Memory is bounded by the number of
//! distinct authors whose profile never arrived; `feed_pending_entries`
//! tracks it.

use parking_lot::Mutex;
use relaytail_core::{
    EventClass, EventPayload, ProfilePayload, RequestFrame, build_profile_request,
    is_control_frame, parse_relay_event,
};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// A post together with its author's decoded profile event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrelatedResult {
    pub post: EventPayload,
    pub user: ProfilePayload,
}

/// How inbound events are told apart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Classifier {
    /// By `kind`: 0 is a profile, 1 and 6 are posts, everything else is
    /// ignored. A kind-0 event whose content is not a document is dropped.
    #[default]
    Kind,

    /// By content shape: content that decodes as a document is a profile,
    /// anything else is a post. `kind` is not consulted, so a post whose
    /// text happens to be valid JSON is treated as a profile.
    ContentShape,
}

impl Classifier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Kind => "kind",
            Self::ContentShape => "content-shape",
        }
    }
}

impl fmt::Display for Classifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classifier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kind" => Ok(Self::Kind),
            "content-shape" | "content" => Ok(Self::ContentShape),
            other => Err(format!(
                "unknown classifier '{other}' (expected 'kind' or 'content-shape')"
            )),
        }
    }
}

/// Why an inbound frame produced nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discard {
    /// Empty frame, end-of-stored-events marker or rate-limit notice.
    Control,
    /// Not an `EVENT` envelope with a usable event.
    Malformed,
    /// Kind is neither a profile nor a post.
    UnsupportedKind,
    /// Kind-0 event whose content is not a document.
    UndecodableProfile,
}

impl Discard {
    /// Metric label value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Malformed => "malformed",
            Self::UnsupportedKind => "unsupported_kind",
            Self::UndecodableProfile => "undecodable_profile",
        }
    }
}

/// What the caller must do after an inbound frame.
///
/// The cache performs no I/O: the session enqueues `emit` and transmits
/// `request`.
#[derive(Debug, Default)]
pub struct InboundOutcome {
    /// Completed pairing, if the frame was a profile some post waited for.
    pub emit: Option<CorrelatedResult>,

    /// Profile request to send, if the frame was a post.
    pub request: Option<RequestFrame>,

    /// Set when the frame was dropped before correlation.
    pub discarded: Option<Discard>,
}

impl InboundOutcome {
    fn discarded(reason: Discard) -> Self {
        Self {
            discarded: Some(reason),
            ..Default::default()
        }
    }

    /// True when the frame had no effect.
    pub fn is_empty(&self) -> bool {
        self.emit.is_none() && self.request.is_none()
    }
}

/// Snapshot of the cache's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Frames passed to [`CorrelationCache::handle_inbound`].
    pub frames: u64,
    /// Frames dropped before correlation.
    pub discarded: u64,
    /// Results emitted.
    pub emitted: u64,
    /// Profile requests issued.
    pub profile_requests: u64,
    /// Pending posts overwritten by a newer post from the same author.
    pub superseded: u64,
    /// Profiles dropped because nothing was pending for their author.
    pub unmatched_profiles: u64,
}

#[derive(Default)]
struct Counters {
    frames: AtomicU64,
    discarded: AtomicU64,
    emitted: AtomicU64,
    profile_requests: AtomicU64,
    superseded: AtomicU64,
    unmatched_profiles: AtomicU64,
}

enum Classified {
    Post(EventPayload),
    Profile(ProfilePayload),
}

/// Bounded, thread-safe post/profile correlation cache.
///
/// Shared by reference (`Arc<CorrelationCache>`); all state sits behind one
/// mutex that is held only for a single map operation.
pub struct CorrelationCache {
    classifier: Classifier,
    /// pubkey -> most recent post awaiting that author's profile.
    pending: Mutex<HashMap<String, EventPayload>>,
    counters: Counters,
}

impl Default for CorrelationCache {
    fn default() -> Self {
        Self::new(Classifier::default())
    }
}

impl CorrelationCache {
    pub fn new(classifier: Classifier) -> Self {
        Self {
            classifier,
            pending: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn classifier(&self) -> Classifier {
        self.classifier
    }

    /// Process one raw text frame from the relay.
    ///
    /// Never fails: control frames and malformed envelopes come back as an
    /// outcome with [`InboundOutcome::discarded`] set.
    pub fn handle_inbound(&self, raw: &str) -> InboundOutcome {
        self.counters.frames.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("feed_frames_total").increment(1);

        if is_control_frame(raw) {
            return self.discard(Discard::Control);
        }

        let event = match parse_relay_event(raw) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "discarding malformed frame");
                return self.discard(Discard::Malformed);
            }
        };

        match self.classify(event.payload) {
            Ok(Classified::Post(post)) => self.hold_post(post),
            Ok(Classified::Profile(profile)) => self.pair_profile(profile),
            Err(reason) => self.discard(reason),
        }
    }

    /// Number of authors with a post awaiting their profile.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether a post by `pubkey` is awaiting its profile.
    pub fn is_pending(&self, pubkey: &str) -> bool {
        self.pending.lock().contains_key(pubkey)
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            frames: c.frames.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            emitted: c.emitted.load(Ordering::Relaxed),
            profile_requests: c.profile_requests.load(Ordering::Relaxed),
            superseded: c.superseded.load(Ordering::Relaxed),
            unmatched_profiles: c.unmatched_profiles.load(Ordering::Relaxed),
        }
    }

    fn classify(&self, payload: EventPayload) -> Result<Classified, Discard> {
        match self.classifier {
            Classifier::Kind => match EventClass::of_kind(payload.kind) {
                EventClass::Profile => match payload.decode_content() {
                    Some(doc) => Ok(Classified::Profile(payload.with_content(doc))),
                    None => Err(Discard::UndecodableProfile),
                },
                EventClass::Content => Ok(Classified::Post(payload)),
                EventClass::Other => Err(Discard::UnsupportedKind),
            },
            Classifier::ContentShape => match payload.decode_content() {
                Some(doc) => Ok(Classified::Profile(payload.with_content(doc))),
                None => Ok(Classified::Post(payload)),
            },
        }
    }

    fn hold_post(&self, post: EventPayload) -> InboundOutcome {
        let request = build_profile_request(&post.pubkey);
        let pubkey = post.pubkey.clone();

        let (superseded, pending_len) = {
            let mut pending = self.pending.lock();
            let previous = pending.insert(pubkey, post);
            // Set under the guard so concurrent callers publish lengths in order.
            metrics::gauge!("feed_pending_entries").set(pending.len() as f64);
            (previous.is_some(), pending.len())
        };

        if superseded {
            self.counters.superseded.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("feed_pending_superseded_total").increment(1);
        }
        self.counters
            .profile_requests
            .fetch_add(1, Ordering::Relaxed);
        metrics::counter!("feed_profile_requests_total").increment(1);

        debug!(
            label = %request.label,
            superseded,
            pending = pending_len,
            "post awaiting profile"
        );

        InboundOutcome {
            request: Some(request),
            ..Default::default()
        }
    }

    fn pair_profile(&self, profile: ProfilePayload) -> InboundOutcome {
        let (post, pending_len) = {
            let mut pending = self.pending.lock();
            let post = pending.remove(&profile.pubkey);
            metrics::gauge!("feed_pending_entries").set(pending.len() as f64);
            (post, pending.len())
        };

        let Some(post) = post else {
            self.counters
                .unmatched_profiles
                .fetch_add(1, Ordering::Relaxed);
            metrics::counter!("feed_profiles_unmatched_total").increment(1);
            return InboundOutcome::default();
        };

        self.counters.emitted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("feed_results_emitted_total").increment(1);

        debug!(
            post = %post.id,
            pubkey = %profile.pubkey,
            pending = pending_len,
            "paired post with profile"
        );

        InboundOutcome {
            emit: Some(CorrelatedResult {
                post,
                user: profile,
            }),
            ..Default::default()
        }
    }

    fn discard(&self, reason: Discard) -> InboundOutcome {
        self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("feed_frames_discarded_total", "reason" => reason.as_str()).increment(1);
        InboundOutcome::discarded(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ResultQueue;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::sync::Arc;

    const ALICE: &str = "abc12345ffffffffffffffffffffffffffffffffffffffffffffffffffffffff";
    const BOB: &str = "b0b0b0b0eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee";

    fn frame(id: &str, pubkey: &str, kind: u16, content: &str) -> String {
        serde_json::json!([
            "EVENT",
            "feed-test",
            {
                "id": id,
                "pubkey": pubkey,
                "created_at": 1700000000,
                "kind": kind,
                "tags": [],
                "content": content,
                "sig": "sig"
            }
        ])
        .to_string()
    }

    fn post(id: &str, pubkey: &str, text: &str) -> String {
        frame(id, pubkey, 1, text)
    }

    fn profile(pubkey: &str, name: &str) -> String {
        frame(
            &format!("meta-{name}"),
            pubkey,
            0,
            &serde_json::json!({ "name": name }).to_string(),
        )
    }

    // =========================================================================
    // Pairing
    // =========================================================================

    #[test]
    fn test_post_then_profile_pairs() {
        let cache = CorrelationCache::default();

        let outcome = cache.handle_inbound(&post("p1", ALICE, "hello"));
        assert!(outcome.emit.is_none());
        let request = outcome.request.unwrap();
        assert_eq!(request.label, "profile-abc12345");
        assert_eq!(request.filter.authors, Some(vec![ALICE.to_string()]));
        assert_eq!(request.filter.kinds, Some(vec![0]));
        assert!(cache.is_pending(ALICE));

        let outcome = cache.handle_inbound(&profile(ALICE, "alice"));
        assert!(outcome.request.is_none());
        let result = outcome.emit.unwrap();
        assert_eq!(result.post.id, "p1");
        assert_eq!(result.post.content, "hello");
        assert_eq!(result.user.pubkey, ALICE);
        assert_eq!(result.user.content, serde_json::json!({ "name": "alice" }));
        assert!(!cache.is_pending(ALICE));
        assert_eq!(cache.pending_len(), 0);
    }

    #[test]
    fn test_result_preserves_post_fields() {
        let cache = CorrelationCache::default();
        cache.handle_inbound(&post("p1", ALICE, "hello"));
        let result = cache.handle_inbound(&profile(ALICE, "alice")).emit.unwrap();

        assert_eq!(result.post.extra["sig"], "sig");
        assert_eq!(result.user.extra["created_at"], 1700000000);
    }

    #[test]
    fn test_latest_post_wins() {
        let cache = CorrelationCache::default();

        assert!(cache.handle_inbound(&post("p1", ALICE, "first")).request.is_some());
        assert!(cache.handle_inbound(&post("p2", ALICE, "second")).request.is_some());
        assert_eq!(cache.pending_len(), 1);
        assert_eq!(cache.stats().superseded, 1);

        let result = cache.handle_inbound(&profile(ALICE, "alice")).emit.unwrap();
        assert_eq!(result.post.id, "p2");
        assert_eq!(result.post.content, "second");

        // The superseded post never surfaces.
        assert!(cache.handle_inbound(&profile(ALICE, "alice")).emit.is_none());
    }

    #[test]
    fn test_one_pending_entry_per_author() {
        let cache = CorrelationCache::default();
        for i in 0..50 {
            cache.handle_inbound(&post(&format!("a{i}"), ALICE, "x"));
            cache.handle_inbound(&post(&format!("b{i}"), BOB, "y"));
        }
        assert_eq!(cache.pending_len(), 2);
    }

    #[test]
    fn test_profile_without_post_is_dropped() {
        let cache = CorrelationCache::default();

        let outcome = cache.handle_inbound(&profile(ALICE, "alice"));
        assert!(outcome.is_empty());
        assert!(outcome.discarded.is_none());
        assert_eq!(cache.pending_len(), 0);
        assert_eq!(cache.stats().unmatched_profiles, 1);

        // A later post still waits for a fresh profile.
        let outcome = cache.handle_inbound(&post("p1", ALICE, "hello"));
        assert!(outcome.emit.is_none());
        assert!(outcome.request.is_some());
    }

    #[test]
    fn test_authors_are_independent() {
        let cache = CorrelationCache::default();
        cache.handle_inbound(&post("pa", ALICE, "from alice"));
        cache.handle_inbound(&post("pb", BOB, "from bob"));

        let result = cache.handle_inbound(&profile(BOB, "bob")).emit.unwrap();
        assert_eq!(result.post.id, "pb");
        assert!(cache.is_pending(ALICE));
        assert!(!cache.is_pending(BOB));
    }

    #[test]
    fn test_repost_is_content() {
        let cache = CorrelationCache::default();
        let outcome = cache.handle_inbound(&frame("r1", ALICE, 6, "reposted"));
        assert!(outcome.request.is_some());
        assert!(cache.is_pending(ALICE));
    }

    // =========================================================================
    // Discards
    // =========================================================================

    #[test]
    fn test_control_frames_change_nothing() {
        let cache = CorrelationCache::default();
        cache.handle_inbound(&post("p1", ALICE, "hello"));

        for raw in [
            r#"["EOSE","feed-test"]"#,
            r#"["CLOSED","feed-test","error: too many concurrent REQs"]"#,
            "",
        ] {
            let outcome = cache.handle_inbound(raw);
            assert!(outcome.is_empty());
            assert_eq!(outcome.discarded, Some(Discard::Control));
        }
        assert_eq!(cache.pending_len(), 1);
        assert!(cache.is_pending(ALICE));
    }

    #[test]
    fn test_malformed_frames_are_discarded() {
        let cache = CorrelationCache::default();
        for raw in [
            "not json",
            r#"["NOTICE","slow down"]"#,
            r#"["OK","e1",true,""]"#,
            r#"["EVENT","feed-test",{"kind":1,"content":"no pubkey"}]"#,
            r#"{"pubkey":"aa"}"#,
        ] {
            let outcome = cache.handle_inbound(raw);
            assert!(outcome.is_empty());
            assert_eq!(outcome.discarded, Some(Discard::Malformed));
        }
        assert_eq!(cache.pending_len(), 0);
        assert_eq!(cache.stats().discarded, 5);
    }

    #[test]
    fn test_kind_classifier_ignores_other_kinds() {
        let cache = CorrelationCache::new(Classifier::Kind);
        let outcome = cache.handle_inbound(&frame("r", ALICE, 7, "+"));
        assert_eq!(outcome.discarded, Some(Discard::UnsupportedKind));
        assert_eq!(cache.pending_len(), 0);
    }

    #[test]
    fn test_kind_classifier_drops_undecodable_profile() {
        let cache = CorrelationCache::new(Classifier::Kind);
        cache.handle_inbound(&post("p1", ALICE, "hello"));

        let outcome = cache.handle_inbound(&frame("m", ALICE, 0, "not a document"));
        assert_eq!(outcome.discarded, Some(Discard::UndecodableProfile));
        assert!(cache.is_pending(ALICE));
    }

    #[test]
    fn test_kind_classifier_keeps_json_looking_posts() {
        let cache = CorrelationCache::new(Classifier::Kind);
        let outcome = cache.handle_inbound(&frame("p1", ALICE, 1, r#"{"looks":"like json"}"#));
        assert!(outcome.request.is_some());
        assert!(cache.is_pending(ALICE));
    }

    // =========================================================================
    // Content-shape classifier
    // =========================================================================

    #[test]
    fn test_content_shape_classifier_pairs_by_decodability() {
        let cache = CorrelationCache::new(Classifier::ContentShape);

        // Kind is not consulted.
        assert!(cache.handle_inbound(&frame("p1", ALICE, 42, "plain")).request.is_some());
        let result = cache
            .handle_inbound(&frame("m1", ALICE, 1, r#"{"name":"alice"}"#))
            .emit
            .unwrap();
        assert_eq!(result.post.id, "p1");
        assert_eq!(result.user.content["name"], "alice");
    }

    #[test]
    fn test_content_shape_classifier_treats_json_post_as_profile() {
        let cache = CorrelationCache::new(Classifier::ContentShape);
        let outcome = cache.handle_inbound(&frame("p1", ALICE, 1, "123"));
        assert!(outcome.is_empty());
        assert!(outcome.discarded.is_none());
        assert_eq!(cache.pending_len(), 0);
    }

    #[test]
    fn test_classifier_from_str() {
        assert_eq!("kind".parse::<Classifier>().unwrap(), Classifier::Kind);
        assert_eq!(
            "Content-Shape".parse::<Classifier>().unwrap(),
            Classifier::ContentShape
        );
        assert!("bogus".parse::<Classifier>().is_err());
        assert_eq!(Classifier::ContentShape.to_string(), "content-shape");
    }

    // =========================================================================
    // Stats
    // =========================================================================

    #[test]
    fn test_stats_counts() {
        let cache = CorrelationCache::default();
        cache.handle_inbound(&post("p1", ALICE, "a"));
        cache.handle_inbound(&post("p2", ALICE, "b"));
        cache.handle_inbound(&profile(ALICE, "alice"));
        cache.handle_inbound(r#"["EOSE","x"]"#);

        assert_eq!(
            cache.stats(),
            CacheStats {
                frames: 4,
                discarded: 1,
                emitted: 1,
                profile_requests: 2,
                superseded: 1,
                unmatched_profiles: 0,
            }
        );
    }

    #[test]
    fn test_pending_gauge_tracks_map_size() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let cache = CorrelationCache::default();

        let pending_gauge = || {
            handle
                .render()
                .lines()
                .find_map(|line| line.strip_prefix("feed_pending_entries "))
                .map(|value| value.parse::<f64>().unwrap())
        };

        metrics::with_local_recorder(&recorder, || {
            cache.handle_inbound(&post("p1", ALICE, "hello"));
            cache.handle_inbound(&post("p2", BOB, "hi"));
        });
        assert_eq!(pending_gauge(), Some(2.0));

        metrics::with_local_recorder(&recorder, || {
            cache.handle_inbound(&profile(ALICE, "alice"));
        });
        assert_eq!(pending_gauge(), Some(1.0));

        metrics::with_local_recorder(&recorder, || {
            cache.handle_inbound(&profile(ALICE, "alice"));
            cache.handle_inbound(&profile(BOB, "bob"));
        });
        assert_eq!(pending_gauge(), Some(0.0));
    }

    // =========================================================================
    // Concurrency
    // =========================================================================

    #[test]
    fn test_concurrent_inbound_and_drain_loses_no_results() {
        const WORKERS: usize = 4;
        const AUTHORS_PER_WORKER: usize = 100;

        let cache = Arc::new(CorrelationCache::default());
        let queue = Arc::new(ResultQueue::new());
        let drained = Arc::new(Mutex::new(Vec::new()));

        std::thread::scope(|s| {
            for w in 0..WORKERS {
                let cache = Arc::clone(&cache);
                let queue = Arc::clone(&queue);
                s.spawn(move || {
                    for a in 0..AUTHORS_PER_WORKER {
                        let pubkey = format!("{w:04}{a:060}");
                        cache.handle_inbound(&post(&format!("{w}-{a}"), &pubkey, "hi"));
                        let outcome = cache.handle_inbound(&profile(&pubkey, "n"));
                        if let Some(result) = outcome.emit {
                            queue.enqueue(result);
                        }
                    }
                });
            }
            for _ in 0..2 {
                let queue = Arc::clone(&queue);
                let drained = Arc::clone(&drained);
                s.spawn(move || {
                    for _ in 0..100 {
                        let batch = queue.drain_all();
                        drained.lock().extend(batch);
                        std::thread::yield_now();
                    }
                });
            }
        });

        let mut all = std::mem::take(&mut *drained.lock());
        all.extend(queue.drain_all());

        assert_eq!(all.len(), WORKERS * AUTHORS_PER_WORKER);
        assert_eq!(cache.pending_len(), 0);
        assert_eq!(cache.stats().emitted as usize, WORKERS * AUTHORS_PER_WORKER);
    }
}
