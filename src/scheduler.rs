//! Parallel execution of one round.
//!
//! A fixed number of worker threads pull matches from a shared queue, run them to
//! completion and report back over a channel. Results are handed back in the order of the
//! submitted match list, whatever the completion order, because the next round is paired
//! from that order.
//!
//! A round never outlives [`RoundScheduler::run`]: when the round is abandoned (budget
//! expired, run-aborting error) the running matches are cancelled and their workers joined
//! before it returns, so their processes are gone before the next round starts.

use std::{
    collections::VecDeque,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        mpsc::{self, RecvTimeoutError},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail};
use tracing::{debug, error, warn};

use crate::{bracket::Match, error::MatchError, poll::CancelToken, tiebreak::MatchResult};

/// Runs a single match to its result.
pub trait MatchRunner: Send + Sync {
    /// Once `cancel` is set the match is abandoned: its result is discarded and it should
    /// tear its processes down and return as soon as possible.
    ///
    /// # Errors
    /// Only for run-aborting conditions. A match that went wrong still has a result.
    fn run_match(&self, m: Match, cancel: &CancelToken) -> anyhow::Result<MatchResult>;
}

impl<F> MatchRunner for F
where
    F: Fn(Match) -> anyhow::Result<MatchResult> + Send + Sync,
{
    fn run_match(&self, m: Match, _cancel: &CancelToken) -> anyhow::Result<MatchResult> {
        self(m)
    }
}

/// Progress notifications of [`RoundScheduler::run`].
#[derive(Debug)]
pub enum RoundEvent<'a> {
    Started(&'a Match),
    Finished(&'a MatchResult),
}

enum Message {
    Started(usize),
    Finished(usize, anyhow::Result<MatchResult>),
}

#[derive(Debug, Clone, Copy)]
pub struct RoundScheduler {
    max_concurrency: usize,
    budget: Option<Duration>,
}

impl RoundScheduler {
    /// `budget` bounds the whole round. Matches still running when it expires are decided
    /// by seed and carry a [`MatchError::RoundTimeout`].
    pub fn new(max_concurrency: usize, budget: Option<Duration>) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            budget,
        }
    }

    /// Runs every match of `matches`, at most `max_concurrency` at a time.
    ///
    /// # Errors
    /// Fails as soon as one match reports a run-aborting error, or panics. Queued matches
    /// are then dropped and running ones cancelled.
    pub fn run<R: MatchRunner + 'static>(
        &self,
        matches: Vec<Match>,
        runner: Arc<R>,
        mut on_event: impl FnMut(RoundEvent),
    ) -> anyhow::Result<Vec<MatchResult>> {
        let count = matches.len();
        let deadline = self.budget.map(|budget| Instant::now() + budget);
        let queue = Arc::new(Mutex::new(
            matches.iter().cloned().enumerate().collect::<VecDeque<_>>(),
        ));
        let (tx, rx) = mpsc::channel();
        let cancel = CancelToken::new();

        let mut workers = vec![];
        for _ in 0..self.max_concurrency.min(count) {
            let queue = queue.clone();
            let runner = runner.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            workers.push(thread::spawn(move || loop {
                let Some((index, m)) = queue.lock().expect("poisoned").pop_front() else {
                    break;
                };
                if tx.send(Message::Started(index)).is_err() {
                    break;
                }
                let description = m.to_string();
                let result = catch_unwind(AssertUnwindSafe(|| runner.run_match(m, &cancel)))
                    .unwrap_or_else(|_| Err(anyhow!("{description} panicked")));
                if tx.send(Message::Finished(index, result)).is_err() {
                    break;
                }
            }));
        }
        drop(tx);

        let mut results: Vec<Option<MatchResult>> = vec![None; count];
        let mut finished = 0;
        while finished < count {
            let message = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    match rx.recv_timeout(left) {
                        Ok(message) => message,
                        Err(RecvTimeoutError::Timeout) => break,
                        Err(RecvTimeoutError::Disconnected) => {
                            abandon(&queue, &cancel, workers);
                            bail!("all match workers stopped before the round ended")
                        }
                    }
                }
                None => match rx.recv() {
                    Ok(message) => message,
                    Err(_) => {
                        abandon(&queue, &cancel, workers);
                        bail!("all match workers stopped before the round ended")
                    }
                },
            };

            match message {
                Message::Started(index) => on_event(RoundEvent::Started(&matches[index])),
                Message::Finished(index, Ok(result)) => {
                    debug!("{} finished, winner {}", matches[index], result.winner);
                    on_event(RoundEvent::Finished(&result));
                    results[index] = Some(result);
                    finished += 1;
                }
                Message::Finished(index, Err(e)) => {
                    error!("{} aborted the round: {e:#}", matches[index]);
                    abandon(&queue, &cancel, workers);
                    return Err(e);
                }
            }
        }

        if finished < count {
            warn!("round budget expired with {} matches unfinished", count - finished);
        }
        abandon(&queue, &cancel, workers);

        let results = results
            .into_iter()
            .zip(matches)
            .map(|(result, m)| match result {
                Some(result) => result,
                None => {
                    let budget = self.budget.unwrap_or_default();
                    warn!("{m} did not finish within the round budget, better seed advances");
                    let result = MatchResult::seed_fallback(m, vec![MatchError::RoundTimeout(budget)]);
                    on_event(RoundEvent::Finished(&result));
                    result
                }
            })
            .collect();
        Ok(results)
    }
}

/// Drops queued matches, cancels running ones and waits for every worker to exit.
fn abandon(
    queue: &Mutex<VecDeque<(usize, Match)>>,
    cancel: &CancelToken,
    workers: Vec<JoinHandle<()>>,
) {
    let dropped = {
        let mut queue = queue.lock().expect("poisoned");
        let dropped = queue.len();
        queue.clear();
        dropped
    };
    let running = workers.iter().filter(|w| !w.is_finished()).count();
    if running > 0 {
        debug!(dropped, running, "cancelling running matches");
        cancel.cancel();
    }
    for worker in workers {
        if worker.join().is_err() {
            warn!("a match worker panicked");
        }
    }
}

/// Runs `matches` with at most `max_concurrency` in flight and no round budget.
pub fn run_round<R: MatchRunner + 'static>(
    matches: Vec<Match>,
    max_concurrency: usize,
    runner: Arc<R>,
) -> anyhow::Result<Vec<MatchResult>> {
    RoundScheduler::new(max_concurrency, None).run(matches, runner, |_| {})
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        bracket::build_round1,
        limits::BoardSize,
        participant::{Participant, Slot},
        tiebreak::TiebreakStage,
    };

    fn round(n: u32) -> Vec<Match> {
        let seeds = (1..=n)
            .map(|i| Arc::new(Participant::new(format!("S{i}"), "G", i)))
            .collect::<Vec<_>>();
        build_round1(&seeds, &[BoardSize::Small]).unwrap()
    }

    fn second_wins(m: Match) -> anyhow::Result<MatchResult> {
        Ok(MatchResult::decided(m, Slot::Second, TiebreakStage::Normal))
    }

    #[test]
    fn results_follow_submission_order() {
        // earlier matches take longer, so they finish last
        let runner = Arc::new(|m: Match| {
            thread::sleep(Duration::from_millis(60 - 10 * m.number as u64));
            second_wins(m)
        });
        let results = run_round(round(8), 4, runner).unwrap();
        let numbers = results.iter().map(|r| r.pairing.number).collect::<Vec<_>>();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        let winners = results.iter().map(|r| r.winner.seed).collect::<Vec<_>>();
        assert_eq!(winners, vec![8, 7, 6, 5]);
    }

    #[test]
    fn concurrency_is_capped() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (running.clone(), peak.clone());
        let runner = Arc::new(move |m: Match| {
            let now = r.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            r.fetch_sub(1, Ordering::SeqCst);
            second_wins(m)
        });
        let results = run_round(round(16), 3, runner).unwrap();
        assert_eq!(results.len(), 8);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn round_budget_falls_back_to_seed() {
        let runner = Arc::new(|m: Match| {
            if m.number == 2 {
                thread::sleep(Duration::from_millis(800));
            }
            second_wins(m)
        });
        let scheduler = RoundScheduler::new(2, Some(Duration::from_millis(300)));
        let mut finished = 0;
        let results = scheduler
            .run(round(4), runner, |event| {
                if let RoundEvent::Finished(_) = event {
                    finished += 1;
                }
            })
            .unwrap();
        assert_eq!(finished, 2);
        assert_eq!(results[0].winner.seed, 4);
        // (2, 3) timed out: seed 2 advances
        assert_eq!(results[1].winner.seed, 2);
        assert_eq!(results[1].decided_by, TiebreakStage::SeedFallback);
        assert!(matches!(results[1].errors[..], [MatchError::RoundTimeout(_)]));
    }

    /// Holds every match for up to `hold`, giving up early when cancelled.
    struct SlowRunner {
        hold: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        cancelled: AtomicUsize,
    }

    impl SlowRunner {
        fn new(hold: Duration) -> Self {
            Self {
                hold,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                cancelled: AtomicUsize::new(0),
            }
        }
    }

    impl MatchRunner for SlowRunner {
        fn run_match(&self, m: Match, cancel: &CancelToken) -> anyhow::Result<MatchResult> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let start = Instant::now();
            while start.elapsed() < self.hold {
                if cancel.is_cancelled() {
                    self.cancelled.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                thread::sleep(Duration::from_millis(5));
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            second_wins(m)
        }
    }

    #[test]
    fn expired_round_is_drained_before_returning() {
        let runner = Arc::new(SlowRunner::new(Duration::from_millis(800)));
        let scheduler = RoundScheduler::new(1, Some(Duration::from_millis(100)));
        let start = Instant::now();
        for _ in 0..2 {
            let results = scheduler.run(round(4), runner.clone(), |_| {}).unwrap();
            assert!(results
                .iter()
                .all(|r| r.decided_by == TiebreakStage::SeedFallback));
            assert_eq!(runner.in_flight.load(Ordering::SeqCst), 0);
        }
        assert_eq!(runner.peak.load(Ordering::SeqCst), 1);
        assert_eq!(runner.cancelled.load(Ordering::SeqCst), 2);
        assert!(start.elapsed() < Duration::from_millis(800));
    }

    #[test]
    fn aborted_round_cancels_running_matches() {
        struct AbortSecond(SlowRunner);
        impl MatchRunner for AbortSecond {
            fn run_match(&self, m: Match, cancel: &CancelToken) -> anyhow::Result<MatchResult> {
                if m.number == 2 {
                    thread::sleep(Duration::from_millis(20));
                    bail!("port space exhausted");
                }
                self.0.run_match(m, cancel)
            }
        }

        let runner = Arc::new(AbortSecond(SlowRunner::new(Duration::from_secs(5))));
        let start = Instant::now();
        assert!(run_round(round(4), 2, runner.clone()).is_err());
        assert_eq!(runner.0.in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(runner.0.cancelled.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn fatal_error_aborts_the_round() {
        let runner = Arc::new(|m: Match| {
            if m.number == 1 {
                bail!("port space exhausted");
            }
            second_wins(m)
        });
        let err = run_round(round(4), 1, runner).unwrap_err();
        assert!(err.to_string().contains("exhausted"));
    }

    #[test]
    fn panicking_match_is_reported() {
        let runner = Arc::new(|m: Match| -> anyhow::Result<MatchResult> {
            if m.number == 2 {
                panic!("boom");
            }
            second_wins(m)
        });
        assert!(run_round(round(4), 2, runner).is_err());
    }
}
