use crate::build::{BuildError, BuildManager, BuildResult};
use crate::environment::{CancelToken, Environment, ScratchArena};
use crate::mutator::Candidate;
use crate::runner::{ObservedResult, TestCase, TestOutcome, TestRunner};
use crate::scenario::{AlgorithmSettings, AlgorithmType};
use crossbeam::channel::{self, RecvTimeoutError};
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Shared cap on the number of candidates evaluated.
#[derive(Debug)]
pub struct CandidateBudget {
    limit: Option<u64>,
    used: AtomicU64,
}

impl CandidateBudget {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            limit,
            used: AtomicU64::new(0),
        }
    }

    /// Claims one evaluation. Returns `false` once the limit is reached.
    pub fn try_acquire(&self) -> bool {
        match self.limit {
            None => {
                self.used.fetch_add(1, Ordering::SeqCst);
                true
            }
            Some(limit) => self
                .used
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                    (used < limit).then_some(used + 1)
                })
                .is_ok(),
        }
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    BuildFailed(BuildError),
    TestMismatch { test: String, observed: ObservedResult },
    Cancelled,
    Environment(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::BuildFailed(e) => write!(f, "{e}"),
            RejectReason::TestMismatch { test, observed } => {
                write!(f, "test '{test}' did not match its expectation ({observed:?})")
            }
            RejectReason::Cancelled => write!(f, "cancelled"),
            RejectReason::Environment(e) => write!(f, "environment error: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accepted,
    Rejected(RejectReason),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }
}

/// Everything learned about one candidate.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub candidate: Candidate,
    /// `None` when the candidate never reached the build.
    pub build: Option<BuildResult>,
    pub tests: Vec<TestOutcome>,
    pub elapsed: Duration,
    pub verdict: Verdict,
}

/// Evaluates a candidate inside the scratch slot owned by the calling worker.
pub trait CandidateEvaluator: Sync {
    fn evaluate(&self, slot: usize, candidate: Candidate, cancel: &CancelToken) -> Evaluation;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionReason {
    StreamExhausted,
    CandidateLimit,
    TimeLimit,
    Cancelled,
}

impl fmt::Display for ExhaustionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ExhaustionReason::StreamExhausted => "every candidate was evaluated",
            ExhaustionReason::CandidateLimit => "candidate limit reached",
            ExhaustionReason::TimeLimit => "time limit reached",
            ExhaustionReason::Cancelled => "search was cancelled",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
    Init,
    Searching,
    Found,
    Exhausted,
}

#[derive(Debug, Clone)]
pub enum SearchOutcome {
    Found(Box<Evaluation>),
    Exhausted(ExhaustionReason),
}

#[derive(Debug, Clone)]
pub struct SearchReport {
    pub outcome: SearchOutcome,
    /// Candidates that completed evaluation, accepted or rejected.
    pub evaluated: u64,
    /// Candidates stopped by cancellation before they completed.
    pub cancelled: u64,
    pub elapsed: Duration,
}

impl SearchReport {
    pub fn state(&self) -> SearchState {
        match self.outcome {
            SearchOutcome::Found(_) => SearchState::Found,
            SearchOutcome::Exhausted(_) => SearchState::Exhausted,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchLimits {
    pub candidates: Option<u64>,
    pub time: Option<Duration>,
}

/// Reorders successive windows of a candidate stream with a seeded RNG.
pub struct WindowShuffle<I> {
    inner: I,
    window: usize,
    rng: ChaCha8Rng,
    buffer: VecDeque<Candidate>,
}

impl<I: Iterator<Item = Candidate>> WindowShuffle<I> {
    pub fn new(inner: I, window: usize, seed: u64) -> Self {
        Self {
            inner,
            window: window.max(1),
            rng: ChaCha8Rng::seed_from_u64(seed),
            buffer: VecDeque::new(),
        }
    }
}

impl<I: Iterator<Item = Candidate>> Iterator for WindowShuffle<I> {
    type Item = Candidate;

    fn next(&mut self) -> Option<Candidate> {
        if self.buffer.is_empty() {
            let mut window: Vec<Candidate> = self.inner.by_ref().take(self.window).collect();
            window.shuffle(&mut self.rng);
            self.buffer.extend(window);
        }
        self.buffer.pop_front()
    }
}

struct Job {
    sequence: u64,
    candidate: Candidate,
    cancel: CancelToken,
}

/// Dispatches candidates to a pool of workers and reconciles their verdicts.
///
/// Candidates are numbered in the order they are pulled from the stream. The
/// winner is the accepted candidate with the lowest number, so a search with
/// any thread count returns the same patch as a sequential one, provided the
/// limits are not hit first.
pub struct SearchController {
    threads: usize,
    limits: SearchLimits,
    algorithm: AlgorithmSettings,
    seed: u64,
}

impl SearchController {
    pub fn new(threads: usize, limits: SearchLimits, algorithm: AlgorithmSettings, seed: u64) -> Self {
        Self {
            threads: threads.max(1),
            limits,
            algorithm,
            seed,
        }
    }

    pub fn run<I>(
        &self,
        candidates: I,
        evaluator: &dyn CandidateEvaluator,
        cancel: &CancelToken,
    ) -> SearchReport
    where
        I: Iterator<Item = Candidate>,
    {
        match self.algorithm.algorithm_type {
            AlgorithmType::Exhaustive => self.search(candidates, evaluator, cancel),
            AlgorithmType::Random => self.search(
                WindowShuffle::new(candidates, self.algorithm.window, self.seed),
                evaluator,
                cancel,
            ),
        }
    }

    fn search<I>(&self, mut stream: I, evaluator: &dyn CandidateEvaluator, cancel: &CancelToken) -> SearchReport
    where
        I: Iterator<Item = Candidate>,
    {
        let start_time = Instant::now();
        let deadline = self.limits.time.map(|limit| start_time + limit);
        let budget = CandidateBudget::new(self.limits.candidates);
        let mut state = SearchState::Init;
        debug!("search state {state:?}, {} worker(s)", self.threads);

        let (job_tx, job_rx) = channel::bounded::<Job>(self.threads);
        let (done_tx, done_rx) = channel::unbounded::<(u64, Evaluation)>();

        let mut in_flight: BTreeMap<u64, CancelToken> = BTreeMap::new();
        let mut best: Option<(u64, Evaluation)> = None;
        let mut stop: Option<ExhaustionReason> = None;
        let mut timed_out = false;
        let mut evaluated = 0u64;
        let mut cancelled = 0u64;
        let mut next_sequence = 0u64;

        std::thread::scope(|scope| {
            for slot in 0..self.threads {
                let job_rx = job_rx.clone();
                let done_tx = done_tx.clone();
                scope.spawn(move || {
                    for job in job_rx.iter() {
                        let evaluation = evaluator.evaluate(slot, job.candidate, &job.cancel);
                        if done_tx.send((job.sequence, evaluation)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(done_tx);

            state = SearchState::Searching;
            debug!("search state {state:?}");

            loop {
                while stop.is_none() && best.is_none() && in_flight.len() < self.threads {
                    if cancel.is_cancelled() {
                        stop = Some(ExhaustionReason::Cancelled);
                        break;
                    }
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        stop = Some(ExhaustionReason::TimeLimit);
                        break;
                    }
                    if !budget.try_acquire() {
                        stop = Some(ExhaustionReason::CandidateLimit);
                        break;
                    }
                    let Some(candidate) = stream.next() else {
                        stop = Some(ExhaustionReason::StreamExhausted);
                        break;
                    };
                    debug!("dispatching candidate {candidate}");
                    let token = cancel.child();
                    in_flight.insert(next_sequence, token.clone());
                    let job = Job {
                        sequence: next_sequence,
                        candidate,
                        cancel: token,
                    };
                    if job_tx.send(job).is_err() {
                        warn!("search workers stopped unexpectedly");
                        in_flight.remove(&next_sequence);
                        stop = Some(ExhaustionReason::Cancelled);
                        break;
                    }
                    next_sequence += 1;
                }

                if in_flight.is_empty() {
                    break;
                }

                // After the deadline every in-flight job is cancelled, so drain without one.
                let wait_until = if timed_out { None } else { deadline };
                let received = match wait_until {
                    Some(d) => match done_rx.recv_timeout(d.saturating_duration_since(Instant::now())) {
                        Ok(message) => Some(message),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    },
                    None => match done_rx.recv() {
                        Ok(message) => Some(message),
                        Err(_) => break,
                    },
                };

                let Some((sequence, evaluation)) = received else {
                    info!("search time limit reached, cancelling {} candidate(s)", in_flight.len());
                    timed_out = true;
                    if stop != Some(ExhaustionReason::Cancelled) {
                        stop = Some(ExhaustionReason::TimeLimit);
                    }
                    in_flight.values().for_each(CancelToken::cancel);
                    continue;
                };
                in_flight.remove(&sequence);

                match &evaluation.verdict {
                    Verdict::Accepted => {
                        evaluated += 1;
                        info!(
                            "candidate {} accepted after {:?}",
                            evaluation.candidate, evaluation.elapsed
                        );
                        if best.as_ref().is_none_or(|(winner, _)| sequence < *winner) {
                            for (_, token) in in_flight.range(sequence + 1..) {
                                token.cancel();
                            }
                            best = Some((sequence, evaluation));
                        }
                    }
                    Verdict::Rejected(RejectReason::Cancelled) => {
                        cancelled += 1;
                        debug!("candidate {} cancelled", evaluation.candidate);
                    }
                    Verdict::Rejected(reason) => {
                        evaluated += 1;
                        debug!("candidate {} rejected: {reason}", evaluation.candidate);
                    }
                }
            }
            drop(job_tx);
        });

        let outcome = match best {
            Some((_, evaluation)) => SearchOutcome::Found(Box::new(evaluation)),
            None => SearchOutcome::Exhausted(stop.unwrap_or(ExhaustionReason::StreamExhausted)),
        };
        let report = SearchReport {
            outcome,
            evaluated,
            cancelled,
            elapsed: start_time.elapsed(),
        };
        info!(
            "search finished in state {:?}: {} evaluated, {} cancelled, budget used {}",
            report.state(),
            report.evaluated,
            report.cancelled,
            budget.used()
        );
        report
    }
}

/// Builds and tests candidates against the real program.
pub struct ProgramEvaluator<'a> {
    pub env: &'a dyn Environment,
    pub arena: &'a ScratchArena,
    pub build: &'a BuildManager,
    pub steps: &'a [String],
    pub runner: &'a TestRunner,
    pub tests: &'a [TestCase],
}

struct RestoreOnDrop<'a> {
    arena: &'a ScratchArena,
    slot: usize,
    file: &'a str,
}

impl Drop for RestoreOnDrop<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.arena.restore_file(self.slot, self.file) {
            warn!("failed to restore {} in slot {}: {e}", self.file, self.slot);
        }
    }
}

impl CandidateEvaluator for ProgramEvaluator<'_> {
    fn evaluate(&self, slot: usize, candidate: Candidate, cancel: &CancelToken) -> Evaluation {
        let start_time = Instant::now();
        let finish = |candidate, build, tests, verdict| Evaluation {
            candidate,
            build,
            tests,
            elapsed: start_time.elapsed(),
            verdict,
        };

        let Some(workdir) = self.arena.slot(slot) else {
            let reason = RejectReason::Environment(format!("no scratch slot {slot}"));
            return finish(candidate, None, Vec::new(), Verdict::Rejected(reason));
        };
        if let Err(e) = self
            .arena
            .write_file(slot, &candidate.location.file, &candidate.patched)
        {
            let reason = RejectReason::Environment(e.to_string());
            return finish(candidate, None, Vec::new(), Verdict::Rejected(reason));
        }

        let (build, tests, verdict) = {
            let _restore = RestoreOnDrop {
                arena: self.arena,
                slot,
                file: &candidate.location.file,
            };
            self.build_and_test(workdir, cancel)
        };
        finish(candidate, Some(build), tests, verdict)
    }
}

impl ProgramEvaluator<'_> {
    fn build_and_test(
        &self,
        workdir: &std::path::Path,
        cancel: &CancelToken,
    ) -> (BuildResult, Vec<TestOutcome>, Verdict) {
        let build = self.build.build(self.env, self.steps, workdir, cancel);
        match &build.failure {
            Some(BuildError::Cancelled) => {
                return (build, Vec::new(), Verdict::Rejected(RejectReason::Cancelled));
            }
            Some(failure) => {
                let reason = RejectReason::BuildFailed(failure.clone());
                return (build, Vec::new(), Verdict::Rejected(reason));
            }
            None => {}
        }

        let mut outcomes = Vec::with_capacity(self.tests.len());
        for test in self.tests {
            let outcome = self.runner.run(test, workdir, cancel);
            let matched = outcome.matched_expectation;
            let observed = outcome.observed.clone();
            outcomes.push(outcome);
            if observed == ObservedResult::Cancelled {
                return (build, outcomes, Verdict::Rejected(RejectReason::Cancelled));
            }
            if !matched {
                let reason = RejectReason::TestMismatch {
                    test: test.name.clone(),
                    observed,
                };
                return (build, outcomes, Verdict::Rejected(reason));
            }
        }
        (build, outcomes, Verdict::Accepted)
    }
}
