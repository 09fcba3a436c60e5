//! Runs batches against a [`TranslationBackend`] on a bounded worker pool.
//!
//! A [`Dispatch`] is lazy: each call to [`Dispatch::next_batch`] lets the
//! workers pull batches off the queue until the oldest outstanding batch is
//! done, then hands back finished results one batch at a time, in plan order.
//! A worker whose batch is sleeping in backoff does not hold the others up.
//! Batches never started (cancellation, or simply not pulled yet) stay in
//! [`Dispatch::remaining`] and can be dispatched again later.
//!
//! A batch that still fails after its last attempt is split (5 linked units,
//! then 1) so a single bad line only fails itself.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Serialize;

use super::backend::{BatchRequest, TranslationBackend};
use super::batching::{plan_batches, Batch, PendingItem};
use super::retry::{CancelToken, Pacer, RetryPolicy};
use crate::error::{BackendError, EngineError};
use crate::services::terminology::{GlossaryHint, TermMatcher};
use crate::services::token_guard::TokenGuard;

/// Sub-batch sizes, in linked units, tried after a batch fails for good.
const SPLIT_SIZES: &[usize] = &[5, 1];

/// Batches one `next_batch` call may start, per worker.
const WINDOW_PER_WORKER: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    pub batch_size: usize,
    pub parallelism: usize,
    pub retry: RetryPolicy,
    pub min_batch_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            parallelism: 2,
            retry: RetryPolicy::default(),
            min_batch_interval: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntryOutcome {
    /// `attempts` counts every backend call that carried the entry.
    Translated { text: String, attempts: usize },
    Failed { error: String, retryable: bool, attempts: usize },
}

/// The backend's answer for one entry, tagged with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryResult {
    pub index: usize,
    pub id: String,
    pub batch: usize,
    pub outcome: EntryOutcome,
}

impl EntryResult {
    pub fn is_translated(&self) -> bool {
        matches!(self.outcome, EntryOutcome::Translated { .. })
    }
}

enum BatchRun {
    Done(Vec<EntryResult>),
    NotStarted(Batch),
}

#[derive(Clone, Copy)]
struct Target<'a> {
    backend: &'a dyn TranslationBackend,
    terms: Option<&'a TermMatcher>,
}

pub struct Dispatcher {
    config: DispatchConfig,
    pool: ThreadPool,
    pacer: Pacer,
    cancel: CancelToken,
    guard: Arc<TokenGuard>,
    source_lang: String,
    target_lang: String,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("source_lang", &self.source_lang)
            .field("target_lang", &self.target_lang)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        config: DispatchConfig,
        source_lang: impl Into<String>,
        target_lang: impl Into<String>,
        cancel: CancelToken,
    ) -> Result<Self, EngineError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.parallelism.max(1))
            .thread_name(|i| format!("dispatch-{i}"))
            .build()
            .map_err(|e| EngineError::Config(format!("worker pool: {e}")))?;

        Ok(Self {
            pacer: Pacer::new(config.min_batch_interval),
            config,
            pool,
            cancel,
            guard: Arc::new(TokenGuard::default()),
            source_lang: source_lang.into(),
            target_lang: target_lang.into(),
        })
    }

    /// Guard used to locate placeholders in batch texts.
    pub fn with_guard(mut self, guard: Arc<TokenGuard>) -> Self {
        self.guard = guard;
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Plans `items` into batches and returns a lazy dispatch over them.
    pub fn dispatch<'a>(
        &'a self,
        items: Vec<PendingItem>,
        backend: &'a dyn TranslationBackend,
        terms: Option<&'a TermMatcher>,
    ) -> Dispatch<'a> {
        let batches = plan_batches(items, self.config.batch_size);
        tracing::debug!(
            batches = batches.len(),
            backend = backend.name(),
            "dispatch planned"
        );
        Dispatch {
            dispatcher: self,
            target: Target { backend, terms },
            queue: batches.into(),
            ready: BTreeMap::new(),
            buffered: VecDeque::new(),
        }
    }

    /// Pulls batches off the shared window until it says stop.
    fn work(&self, window: &Mutex<Window>, target: Target<'_>) {
        loop {
            let batch = {
                let mut w = window.lock().unwrap_or_else(PoisonError::into_inner);
                if self.cancel.is_cancelled() || !w.may_start() {
                    return;
                }
                match w.queue.pop_front() {
                    Some(b) => {
                        w.busy += 1;
                        w.started += 1;
                        b
                    }
                    None => return,
                }
            };

            let number = batch.number;
            let run = self.run_batch(batch, target);

            let mut w = window.lock().unwrap_or_else(PoisonError::into_inner);
            w.busy -= 1;
            match run {
                BatchRun::Done(results) => {
                    if w.head == Some(number) {
                        w.head_done = true;
                    }
                    w.done.insert(number, results);
                }
                BatchRun::NotStarted(batch) => w.not_started.push(batch),
            }
        }
    }

    fn run_batch(&self, batch: Batch, target: Target<'_>) -> BatchRun {
        if self.cancel.is_cancelled() {
            return BatchRun::NotStarted(batch);
        }
        self.pacer.wait();
        if self.cancel.is_cancelled() {
            return BatchRun::NotStarted(batch);
        }

        let mut results = Vec::with_capacity(batch.items.len());
        self.run_items(target, batch.number, batch.items, 0, true, &mut results);
        BatchRun::Done(results)
    }

    /// Sends `items` as one request; on final failure splits them into
    /// smaller requests, or marks them failed once they cannot shrink.
    fn run_items(
        &self,
        target: Target<'_>,
        number: usize,
        items: Vec<PendingItem>,
        prior_attempts: usize,
        paced: bool,
        out: &mut Vec<EntryResult>,
    ) {
        let (sent, attempts) = self.send(target, number, &items, paced);
        let attempts = prior_attempts + attempts;

        let error = match sent {
            Ok(texts) => {
                out.extend(items.into_iter().zip(texts).map(|(item, text)| EntryResult {
                    index: item.index,
                    id: item.id,
                    batch: number,
                    outcome: EntryOutcome::Translated { text, attempts },
                }));
                return;
            }
            Err(e) => e,
        };

        let mut units = linked_units(items);
        let split = SPLIT_SIZES
            .iter()
            .copied()
            .find(|&s| s < units.len())
            .filter(|_| !matches!(error, BackendError::RateLimited));
        if let Some(size) = split {
            tracing::warn!(
                batch = number,
                units = units.len(),
                size,
                error = %error,
                "batch failed, retrying in smaller parts"
            );
            while !units.is_empty() {
                let take = size.min(units.len());
                let part: Vec<PendingItem> = units.drain(..take).flatten().collect();
                self.run_items(target, number, part, attempts, false, out);
            }
            return;
        }

        tracing::error!(batch = number, attempts, error = %error, "batch failed");
        let message = error.to_string();
        let retryable = error.is_retryable();
        out.extend(units.into_iter().flatten().map(|item| EntryResult {
            index: item.index,
            id: item.id,
            batch: number,
            outcome: EntryOutcome::Failed {
                error: message.clone(),
                retryable,
                attempts,
            },
        }));
    }

    /// One request with retries. `paced` means the caller already waited on
    /// the pacer for the first call.
    fn send(
        &self,
        target: Target<'_>,
        number: usize,
        items: &[PendingItem],
        paced: bool,
    ) -> (Result<Vec<String>, BackendError>, usize) {
        let request = self.request(items, target.terms);
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempts = 0usize;

        loop {
            if attempts > 0 || !paced {
                self.pacer.wait();
            }
            attempts += 1;

            let err = match target.backend.translate_batch(&request) {
                Ok(out) if out.len() == request.texts.len() => {
                    tracing::debug!(batch = number, entries = out.len(), attempts, "batch translated");
                    return (Ok(out), attempts);
                }
                Ok(out) => BackendError::MalformedResponse {
                    expected: request.texts.len(),
                    got: out.len(),
                },
                Err(e) => e,
            };

            if !err.is_retryable() || attempts >= max_attempts {
                return (Err(err), attempts);
            }

            let delay = self.config.retry.backoff(attempts - 1);
            tracing::warn!(
                batch = number,
                attempt = attempts,
                max_attempts,
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "batch failed, retrying"
            );
            thread::sleep(delay);
        }
    }

    fn request(&self, items: &[PendingItem], terms: Option<&TermMatcher>) -> BatchRequest {
        let texts: Vec<String> = items.iter().map(|i| i.text.clone()).collect();

        let mut glossary: Vec<GlossaryHint> = Vec::new();
        if let Some(m) = terms.filter(|m| !m.is_empty()) {
            for text in &texts {
                for hint in m.glossary_outside(text, &self.guard.placeholder_spans(text)) {
                    if !glossary.contains(&hint) {
                        glossary.push(hint);
                    }
                }
            }
        }

        BatchRequest {
            texts,
            source_lang: self.source_lang.clone(),
            target_lang: self.target_lang.clone(),
            glossary,
        }
    }
}

/// Consecutive members of one linked group stay together; everything else is
/// a unit of its own.
fn linked_units(items: Vec<PendingItem>) -> Vec<Vec<PendingItem>> {
    let mut units: Vec<Vec<PendingItem>> = Vec::new();
    for item in items {
        let joins = match (units.last().and_then(|u| u.last()), &item.group) {
            (Some(prev), Some(group)) => prev.group.as_ref() == Some(group),
            _ => false,
        };
        if joins {
            if let Some(last) = units.last_mut() {
                last.push(item);
                continue;
            }
        }
        units.push(vec![item]);
    }
    units
}

/// Work shared by the workers of one `next_batch` call.
struct Window {
    queue: VecDeque<Batch>,
    /// Oldest batch not yet handed out; the call returns once it is done.
    head: Option<usize>,
    head_done: bool,
    busy: usize,
    started: usize,
    limit: usize,
    done: BTreeMap<usize, Vec<EntryResult>>,
    not_started: Vec<Batch>,
}

impl Window {
    /// Keep pulling while the head is outstanding, or while the call has to
    /// wait for another worker anyway.
    fn may_start(&self) -> bool {
        !self.queue.is_empty() && self.started < self.limit && (!self.head_done || self.busy > 0)
    }
}

/// A lazy, restartable sequence of batch results.
pub struct Dispatch<'a> {
    dispatcher: &'a Dispatcher,
    target: Target<'a>,
    queue: VecDeque<Batch>,
    ready: BTreeMap<usize, Vec<EntryResult>>,
    buffered: VecDeque<EntryResult>,
}

impl<'a> Dispatch<'a> {
    /// Results of the next finished batch, in the batch's own entry order.
    ///
    /// Batches may finish in any order; they are still handed out in plan
    /// order.
    pub fn next_batch(&mut self) -> Option<Vec<EntryResult>> {
        if let Some((_, done)) = self.ready.pop_first() {
            return Some(done);
        }
        if self.queue.is_empty() || self.dispatcher.cancel.is_cancelled() {
            return None;
        }

        self.run_window();
        self.ready.pop_first().map(|(_, done)| done)
    }

    fn run_window(&mut self) {
        let dispatcher = self.dispatcher;
        let target = self.target;
        let workers = dispatcher.config.parallelism.max(1);

        let window = Mutex::new(Window {
            head: self.queue.front().map(|b| b.number),
            queue: std::mem::take(&mut self.queue),
            head_done: false,
            busy: 0,
            started: 0,
            limit: workers * WINDOW_PER_WORKER,
            done: BTreeMap::new(),
            not_started: Vec::new(),
        });

        dispatcher.pool.scope(|s| {
            for _ in 0..workers {
                s.spawn(|_| dispatcher.work(&window, target));
            }
        });

        let mut window = window.into_inner().unwrap_or_else(PoisonError::into_inner);
        window.not_started.sort_by_key(|b| b.number);
        for batch in window.not_started.into_iter().rev() {
            window.queue.push_front(batch);
        }
        self.queue = window.queue;
        self.ready.append(&mut window.done);
    }

    /// Finished results not handed out yet, in plan order, without starting
    /// any new batch.
    pub fn take_ready(&mut self) -> Vec<EntryResult> {
        let mut out: Vec<EntryResult> = self.buffered.drain(..).collect();
        for (_, results) in std::mem::take(&mut self.ready) {
            out.extend(results);
        }
        out
    }

    /// Entries whose batch has not been started.
    pub fn remaining(&self) -> Vec<PendingItem> {
        self.queue
            .iter()
            .flat_map(|b| b.items.iter().cloned())
            .collect()
    }

    pub fn remaining_batches(&self) -> usize {
        self.queue.len()
    }

    pub fn is_cancelled(&self) -> bool {
        self.dispatcher.cancel.is_cancelled()
    }
}

impl Iterator for Dispatch<'_> {
    type Item = EntryResult;

    fn next(&mut self) -> Option<EntryResult> {
        while self.buffered.is_empty() {
            let batch = self.next_batch()?;
            self.buffered.extend(batch);
        }
        self.buffered.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use super::*;
    use crate::services::mock::{MockBackend, MockMode};
    use crate::services::terminology::{TerminologyRule, TerminologyTable};

    fn items(n: usize) -> Vec<PendingItem> {
        (0..n)
            .map(|i| PendingItem {
                index: i,
                id: format!("line{i}"),
                text: format!("text {i}"),
                group: None,
            })
            .collect()
    }

    fn fast(batch_size: usize, parallelism: usize) -> DispatchConfig {
        DispatchConfig {
            batch_size,
            parallelism,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                jitter: false,
            },
            min_batch_interval: Duration::ZERO,
        }
    }

    fn dispatcher(config: DispatchConfig) -> Dispatcher {
        Dispatcher::new(config, "en", "zh", CancelToken::new()).unwrap()
    }

    #[test]
    fn every_entry_comes_back_once() {
        let d = dispatcher(fast(3, 2));
        let backend = MockBackend::new(MockMode::Prefix("ZH:".into()));
        let mut results: Vec<EntryResult> = d.dispatch(items(10), &backend, None).collect();
        results.sort_by_key(|r| r.index);

        assert_eq!(results.len(), 10);
        for (i, r) in results.iter().enumerate() {
            assert_eq!(r.index, i);
            assert_eq!(
                r.outcome,
                EntryOutcome::Translated {
                    text: format!("ZH:text {i}"),
                    attempts: 1
                }
            );
        }
        assert_eq!(backend.calls(), 4);
    }

    #[test]
    fn out_of_order_completion_keeps_plan_order() {
        let d = dispatcher(fast(1, 4));
        let backend = MockBackend::new(MockMode::Echo).with_delays(vec![
            Duration::from_millis(40),
            Duration::from_millis(25),
            Duration::from_millis(10),
            Duration::from_millis(0),
        ]);
        let results: Vec<usize> = d.dispatch(items(8), &backend, None).map(|r| r.index).collect();
        assert_eq!(results, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn exhausted_retries_fail_every_entry_after_splitting() {
        let d = dispatcher(fast(2, 2));
        let backend = MockBackend::new(MockMode::Fail(BackendError::Transient("down".into())));
        let results: Vec<EntryResult> = d.dispatch(items(5), &backend, None).collect();

        assert_eq!(results.len(), 5);
        let attempts: Vec<usize> = results
            .iter()
            .map(|r| match &r.outcome {
                EntryOutcome::Failed {
                    attempts, retryable, ..
                } => {
                    assert!(*retryable);
                    *attempts
                }
                other => panic!("unexpected outcome {other:?}"),
            })
            .collect();
        // pairs: 3 calls together, then 3 each alone
        assert_eq!(attempts, vec![6, 6, 6, 6, 3]);
        assert_eq!(backend.calls(), 21);
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let d = dispatcher(fast(5, 1));
        let backend = MockBackend::new(MockMode::Fail(BackendError::Permanent("bad key".into())));
        let results: Vec<EntryResult> = d.dispatch(items(2), &backend, None).collect();
        assert!(results.iter().all(|r| matches!(
            r.outcome,
            EntryOutcome::Failed {
                attempts: 2,
                retryable: false,
                ..
            }
        )));
        // once together, once each alone
        assert_eq!(backend.calls(), 3);
    }

    #[test]
    fn rate_limited_batches_are_not_split() {
        let d = dispatcher(fast(4, 1));
        let backend = MockBackend::new(MockMode::Fail(BackendError::RateLimited));
        let results: Vec<EntryResult> = d.dispatch(items(4), &backend, None).collect();
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| !r.is_translated()));
        assert_eq!(backend.calls(), 3);
    }

    /// Rejects any request that carries the poisoned text.
    struct Poisoned {
        poison: &'static str,
        calls: AtomicUsize,
    }

    impl TranslationBackend for Poisoned {
        fn name(&self) -> &str {
            "poisoned"
        }

        fn translate_batch(&self, req: &BatchRequest) -> Result<Vec<String>, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if req.texts.iter().any(|t| t == self.poison) {
                return Err(BackendError::MalformedResponse {
                    expected: req.texts.len(),
                    got: 0,
                });
            }
            Ok(req.texts.iter().map(|t| format!("ZH:{t}")).collect())
        }
    }

    #[test]
    fn one_bad_line_only_fails_itself() {
        let d = dispatcher(fast(10, 1));
        let backend = Poisoned {
            poison: "text 3",
            calls: AtomicUsize::new(0),
        };
        let results: Vec<EntryResult> = d.dispatch(items(10), &backend, None).collect();

        assert_eq!(results.len(), 10);
        let failed: Vec<usize> = results
            .iter()
            .filter(|r| !r.is_translated())
            .map(|r| r.index)
            .collect();
        assert_eq!(failed, vec![3]);
        assert_eq!(results.iter().map(|r| r.index).collect::<Vec<_>>(), (0..10).collect::<Vec<_>>());
        // all ten, then 0..=4, then each of 0..=4 alone, then 5..=9
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3 + 3 + (4 + 3) + 1);
    }

    #[test]
    fn splitting_keeps_linked_groups_together() {
        let d = dispatcher(fast(10, 1));
        let backend = Poisoned {
            poison: "text 2",
            calls: AtomicUsize::new(0),
        };
        let mut batch = items(4);
        batch[1].group = Some("plural".into());
        batch[2].group = Some("plural".into());

        let results: Vec<EntryResult> = d.dispatch(batch, &backend, None).collect();
        let failed: Vec<usize> = results
            .iter()
            .filter(|r| !r.is_translated())
            .map(|r| r.index)
            .collect();
        assert_eq!(failed, vec![1, 2]);
        assert_eq!(results.len(), 4);
    }

    #[test]
    fn transient_failures_recover() {
        let d = dispatcher(fast(10, 1));
        let backend = MockBackend::new(MockMode::FailTimes(2));
        let results: Vec<EntryResult> = d.dispatch(items(3), &backend, None).collect();
        assert!(results.iter().all(|r| matches!(
            r.outcome,
            EntryOutcome::Translated { attempts: 3, .. }
        )));
    }

    #[test]
    fn short_responses_are_malformed() {
        let d = dispatcher(fast(4, 1));
        let backend = MockBackend::new(MockMode::Short);
        let results: Vec<EntryResult> = d.dispatch(items(4), &backend, None).collect();
        assert_eq!(results.len(), 4);
        match &results[0].outcome {
            EntryOutcome::Failed { error, attempts, .. } => {
                assert!(error.contains("0 translation(s) for 1"));
                assert_eq!(*attempts, 6);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(backend.calls(), 3 + 4 * 3);
    }

    #[test]
    fn cancellation_stops_new_batches_and_is_restartable() {
        let token = CancelToken::new();
        let d = Dispatcher::new(fast(2, 1), "en", "zh", token.clone()).unwrap();
        let backend = MockBackend::new(MockMode::Echo);

        let mut dispatch = d.dispatch(items(6), &backend, None);
        let first = dispatch.next_batch().unwrap();
        assert_eq!(first.len(), 2);

        token.cancel();
        assert!(dispatch.next_batch().is_none());
        let left = dispatch.remaining();
        assert_eq!(left.iter().map(|i| i.index).collect::<Vec<_>>(), vec![2, 3, 4, 5]);
        assert_eq!(backend.calls(), 1);

        let resumed = dispatcher(fast(2, 1));
        let rest: Vec<EntryResult> = resumed.dispatch(left, &backend, None).collect();
        assert_eq!(rest.len(), 4);
        assert_eq!(rest[0].index, 2);
    }

    #[test]
    fn cancel_mid_wave_leaves_unstarted_batches_queued() {
        struct CancelAfterFirst {
            token: CancelToken,
            calls: AtomicUsize,
        }
        impl TranslationBackend for CancelAfterFirst {
            fn name(&self) -> &str {
                "cancel-after-first"
            }
            fn translate_batch(&self, req: &BatchRequest) -> Result<Vec<String>, BackendError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.token.cancel();
                Ok(req.texts.clone())
            }
        }

        let token = CancelToken::new();
        let backend = CancelAfterFirst {
            token: token.clone(),
            calls: AtomicUsize::new(0),
        };
        let d = Dispatcher::new(fast(1, 1), "en", "zh", token).unwrap();
        let done: Vec<EntryResult> = d.dispatch(items(3), &backend, None).collect();

        assert_eq!(done.len(), 1);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn min_interval_spaces_batches() {
        let mut config = fast(1, 2);
        config.min_batch_interval = Duration::from_millis(30);
        let d = dispatcher(config);
        let backend = MockBackend::new(MockMode::Echo);

        let start = Instant::now();
        let n = d.dispatch(items(4), &backend, None).count();
        assert_eq!(n, 4);
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[test]
    fn slow_batch_does_not_idle_other_workers() {
        struct SlowFirst {
            started: Mutex<Vec<(String, Instant)>>,
        }
        impl TranslationBackend for SlowFirst {
            fn name(&self) -> &str {
                "slow-first"
            }
            fn translate_batch(&self, req: &BatchRequest) -> Result<Vec<String>, BackendError> {
                self.started
                    .lock()
                    .unwrap()
                    .push((req.texts[0].clone(), Instant::now()));
                if req.texts[0] == "text 0" {
                    thread::sleep(Duration::from_millis(400));
                }
                Ok(req.texts.clone())
            }
        }

        let d = dispatcher(fast(1, 2));
        let backend = SlowFirst {
            started: Mutex::new(Vec::new()),
        };
        let start = Instant::now();
        let order: Vec<usize> = d.dispatch(items(4), &backend, None).map(|r| r.index).collect();

        assert_eq!(order, vec![0, 1, 2, 3]);
        let started = backend.started.lock().unwrap();
        let late: Vec<&str> = started
            .iter()
            .filter(|(_, at)| at.duration_since(start) >= Duration::from_millis(250))
            .map(|(t, _)| t.as_str())
            .collect();
        assert!(late.is_empty(), "started after the slow batch finished: {late:?}");
    }

    #[test]
    fn glossary_skips_placeholders() {
        let table = TerminologyTable::from_rules([
            TerminologyRule::literal("P1", "一号"),
            TerminologyRule::literal("Pierre", "皮埃尔"),
        ]);
        let terms = table.snapshot().unwrap();
        let d = dispatcher(fast(5, 1));
        let backend = MockBackend::new(MockMode::Echo);
        let batch = vec![PendingItem {
            index: 0,
            id: "a".into(),
            text: "Give ⟦P1⟧ to Pierre".into(),
            group: None,
        }];

        let _ = d.dispatch(batch, &backend, Some(&terms)).count();
        let glossary = &backend.requests()[0].glossary;
        assert_eq!(glossary.len(), 1);
        assert_eq!(glossary[0].source, "Pierre");
    }

    #[test]
    fn glossary_hints_reach_the_backend() {
        let table = TerminologyTable::from_rules([TerminologyRule::literal("Pierre", "皮埃尔")]);
        let terms = table.snapshot().unwrap();
        let d = dispatcher(fast(5, 1));
        let backend = MockBackend::new(MockMode::Echo);
        let batch = vec![PendingItem {
            index: 0,
            id: "a".into(),
            text: "Pierre's shop".into(),
            group: None,
        }];

        let _ = d.dispatch(batch, &backend, Some(&terms)).count();
        let seen = backend.requests();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].glossary.len(), 1);
        assert_eq!(seen[0].glossary[0].target, "皮埃尔");
    }
}
