use std::{
    fmt,
    time::{Duration, Instant},
};

use common::config::statistics::{MAX_UPDATE_INTERVAL, MIN_UPDATE_INTERVAL};
use ipc::message::FailureKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    Executions,
    Crashes,
    Hangs,
    Ooms,
    CorpusSize,
    FeatureCount,
    ExecsPerSecond,
}

impl Counter {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Executions => "executions",
            Self::Crashes => "crashes",
            Self::Hangs => "hangs",
            Self::Ooms => "ooms",
            Self::CorpusSize => "corpus_size",
            Self::FeatureCount => "feature_count",
            Self::ExecsPerSecond => "execs_per_second",
        }
    }
}

/// reporting seam so runs can ship counters somewhere other than the log
pub trait StatsSink {
    fn record(&mut self, counter: Counter, value: u64);
}

#[derive(Debug, Default)]
pub struct LogSink;

impl StatsSink for LogSink {
    fn record(&mut self, counter: Counter, value: u64) {
        log::info!("{} = {}", counter.as_str(), value);
    }
}

#[derive(Debug)]
pub struct Statistics {
    start: Instant,
    last_report: Instant,
    executions_at_last_report: u64,
    executions: u64,
    crashes: u64,
    hangs: u64,
    ooms: u64,
    corpus_size: u64,
    feature_count: u64,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_report: now,
            executions_at_last_report: 0,
            executions: 0,
            crashes: 0,
            hangs: 0,
            ooms: 0,
            corpus_size: 0,
            feature_count: 0,
        }
    }

    pub fn add_executions(&mut self, count: u64) {
        self.executions += count;
    }

    pub fn add_failure(&mut self, kind: FailureKind) {
        match kind {
            FailureKind::Hang => self.hangs += 1,
            FailureKind::Oom => self.ooms += 1,
            FailureKind::Crash | FailureKind::Leak | FailureKind::CrashOrHang => self.crashes += 1,
        }
    }

    pub fn set_corpus(&mut self, corpus_size: usize, feature_count: usize) {
        self.corpus_size = corpus_size as u64;
        self.feature_count = feature_count as u64;
    }

    pub fn executions(&self) -> u64 {
        self.executions
    }

    pub fn crashes(&self) -> u64 {
        self.crashes
    }

    fn execs_per_second(&self, interval: Duration) -> u64 {
        let executions = self.executions - self.executions_at_last_report;
        (executions as f64 / interval.as_secs_f64().max(f64::EPSILON)) as u64
    }

    fn should_report(&self, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_report);
        if elapsed < MIN_UPDATE_INTERVAL {
            return false;
        }

        elapsed >= MAX_UPDATE_INTERVAL || self.executions > self.executions_at_last_report
    }

    /// rate-limited report, a no-op while inside the minimum interval
    pub fn maybe_report(&mut self, sink: &mut dyn StatsSink) -> bool {
        let now = Instant::now();
        if !self.should_report(now) {
            return false;
        }

        self.report(sink, now);
        true
    }

    pub fn report(&mut self, sink: &mut dyn StatsSink, now: Instant) {
        let interval = now.duration_since(self.last_report);

        sink.record(Counter::Executions, self.executions);
        sink.record(Counter::ExecsPerSecond, self.execs_per_second(interval));
        sink.record(Counter::Crashes, self.crashes);
        sink.record(Counter::Hangs, self.hangs);
        sink.record(Counter::Ooms, self.ooms);
        sink.record(Counter::CorpusSize, self.corpus_size);
        sink.record(Counter::FeatureCount, self.feature_count);

        self.last_report = now;
        self.executions_at_last_report = self.executions;
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let elapsed = self.start.elapsed();
        write!(
            f,
            "{} execs ({}/s), corpus {} inputs / {} features, {} crashes, {} hangs, {} ooms",
            self.executions,
            (self.executions as f64 / elapsed.as_secs_f64().max(f64::EPSILON)) as u64,
            self.corpus_size,
            self.feature_count,
            self.crashes,
            self.hangs,
            self.ooms,
        )
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Default)]
    struct VecSink(Vec<(Counter, u64)>);

    impl StatsSink for VecSink {
        fn record(&mut self, counter: Counter, value: u64) {
            self.0.push((counter, value));
        }
    }

    #[test]
    fn counters_accumulate() {
        let mut stats = Statistics::new();
        stats.add_executions(10);
        stats.add_executions(5);
        stats.add_failure(FailureKind::Crash);
        stats.add_failure(FailureKind::CrashOrHang);
        stats.add_failure(FailureKind::Hang);
        stats.add_failure(FailureKind::Oom);
        stats.set_corpus(3, 7);

        let mut sink = VecSink::default();
        stats.report(&mut sink, Instant::now());

        let value = |counter| {
            sink.0
                .iter()
                .find(|(c, _)| *c == counter)
                .map(|(_, v)| *v)
                .unwrap()
        };
        assert_eq!(value(Counter::Executions), 15);
        assert_eq!(value(Counter::Crashes), 2);
        assert_eq!(value(Counter::Hangs), 1);
        assert_eq!(value(Counter::Ooms), 1);
        assert_eq!(value(Counter::CorpusSize), 3);
        assert_eq!(value(Counter::FeatureCount), 7);
    }

    #[test]
    fn reporting_is_rate_limited() {
        let mut stats = Statistics::new();
        stats.add_executions(1);

        // freshly created, still inside the minimum interval
        let mut sink = VecSink::default();
        assert!(!stats.maybe_report(&mut sink));
        assert!(sink.0.is_empty());
    }

    #[test]
    fn idle_run_reports_only_at_max_interval() {
        let stats = Statistics::new();

        let after_min = Instant::now() + MIN_UPDATE_INTERVAL;
        let after_max = Instant::now() + MAX_UPDATE_INTERVAL;

        // nothing happened: no report until the maximum interval forces one
        assert!(!stats.should_report(after_min));
        assert!(stats.should_report(after_max));
    }

    #[test]
    fn display_summarizes_the_run() {
        let mut stats = Statistics::new();
        stats.add_executions(100);
        stats.set_corpus(4, 9);

        let display = stats.to_string();
        assert!(display.contains("100 execs"));
        assert!(display.contains("corpus 4 inputs / 9 features"));
    }
}
