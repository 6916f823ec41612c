//! Execution statistics: instruction counting, gas metering and the
//! wasm/host wall-time split.
//!
//! A [`Statistics`] value is shared between the executor and the embedder
//! (and across async invocation threads), so the counters are atomic and
//! the timers sit behind a mutex. All counters are disabled by default and
//! toggled individually through
//! [`Config::with_statistics`](crate::Config::with_statistics).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

/// Number of cost-table entries: one per 16-bit opcode.
const COST_TABLE_LEN: usize = u16::MAX as usize + 1;

/// Which clock is recording.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum TimerTag {
    Wasm,
    Host,
}

/// Nested timer state; at most one clock records at any moment.
#[derive(Default)]
struct TimerStack {
    stack: Vec<TimerTag>,
    started: Option<Instant>,
    wasm: Duration,
    host: Duration,
}

impl TimerStack {
    fn accumulate(&mut self) {
        if let (Some(started), Some(tag)) = (self.started.take(), self.stack.last()) {
            let elapsed = started.elapsed();
            match tag {
                TimerTag::Wasm => self.wasm += elapsed,
                TimerTag::Host => self.host += elapsed,
            }
        }
    }

    fn push(&mut self, tag: TimerTag) {
        self.accumulate();
        self.stack.push(tag);
        self.started = Some(Instant::now());
    }

    fn pop(&mut self, tag: TimerTag) {
        self.accumulate();
        if self.stack.last() == Some(&tag) {
            self.stack.pop();
        }
        if !self.stack.is_empty() {
            self.started = Some(Instant::now());
        }
    }
}

/// Per-invocation statistics: instruction count, gas and time split.
pub struct Statistics {
    cost_table: RwLock<Vec<u64>>,
    instr_count: AtomicU64,
    cost_sum: AtomicU64,
    cost_limit: AtomicU64,
    timers: Mutex<TimerStack>,
}

impl fmt::Debug for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Statistics")
            .field("instr_count", &self.instr_count())
            .field("gas_used", &self.gas_used())
            .field("gas_limit", &self.gas_limit())
            .finish()
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    /// Creates statistics with every opcode costing 1 and no gas limit.
    pub fn new() -> Self {
        Self {
            cost_table: RwLock::new(vec![1; COST_TABLE_LEN]),
            instr_count: AtomicU64::new(0),
            cost_sum: AtomicU64::new(0),
            cost_limit: AtomicU64::new(u64::MAX),
            timers: Mutex::new(TimerStack::default()),
        }
    }

    /// Replaces the cost table; missing entries cost 0.
    pub fn set_cost_table(&self, table: &[u64]) {
        let mut costs = self.cost_table.write();
        costs.clear();
        costs.extend_from_slice(table);
        costs.resize(COST_TABLE_LEN, 0);
    }

    /// Sets the cost of one opcode.
    pub fn set_cost(&self, opcode: u16, cost: u64) {
        self.cost_table.write()[opcode as usize] = cost;
    }

    /// The cost of one opcode.
    pub fn cost_of(&self, opcode: u16) -> u64 {
        self.cost_table.read()[opcode as usize]
    }

    /// Sets the gas ceiling.
    pub fn set_gas_limit(&self, limit: u64) {
        self.cost_limit.store(limit, Ordering::Relaxed);
    }

    /// The gas ceiling.
    pub fn gas_limit(&self) -> u64 {
        self.cost_limit.load(Ordering::Relaxed)
    }

    /// Accumulated gas; saturated at the limit.
    pub fn gas_used(&self) -> u64 {
        self.cost_sum.load(Ordering::Relaxed)
    }

    /// Adds `cost` gas.
    ///
    /// Returns `false` when the addition would cross the limit; the
    /// counter saturates at the limit and the crossing opcode must trap
    /// without retiring.
    #[must_use]
    pub fn add_cost(&self, cost: u64) -> bool {
        let limit = self.cost_limit.load(Ordering::Relaxed);
        loop {
            let current = self.cost_sum.load(Ordering::Relaxed);
            let next = current.saturating_add(cost);
            if next > limit {
                self.cost_sum.store(limit, Ordering::Relaxed);
                return false;
            }
            if self
                .cost_sum
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Adds the table cost of `opcode`.
    #[must_use]
    pub fn add_instr_cost(&self, opcode: u16) -> bool {
        self.add_cost(self.cost_of(opcode))
    }

    /// Returns `cost` gas, flooring at zero.
    pub fn sub_cost(&self, cost: u64) {
        let mut current = self.cost_sum.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(cost);
            match self.cost_sum.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Counts one retired instruction.
    pub fn inc_instr_count(&self) {
        self.instr_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Retired instruction count.
    pub fn instr_count(&self) -> u64 {
        self.instr_count.load(Ordering::Relaxed)
    }

    /// Retired instructions per second of Wasm execution time.
    pub fn instr_per_second(&self) -> f64 {
        let wasm = self.wasm_time().as_secs_f64();
        if wasm == 0.0 {
            return 0.0;
        }
        self.instr_count() as f64 / wasm
    }

    /// Starts recording Wasm time (pauses host time when nested).
    pub fn start_record_wasm(&self) {
        self.timers.lock().push(TimerTag::Wasm);
    }

    /// Stops recording Wasm time (resumes the enclosing clock).
    pub fn stop_record_wasm(&self) {
        self.timers.lock().pop(TimerTag::Wasm);
    }

    /// Starts recording host time (pauses Wasm time).
    pub fn start_record_host(&self) {
        self.timers.lock().push(TimerTag::Host);
    }

    /// Stops recording host time (resumes the enclosing clock).
    pub fn stop_record_host(&self) {
        self.timers.lock().pop(TimerTag::Host);
    }

    /// Accumulated Wasm execution time.
    pub fn wasm_time(&self) -> Duration {
        let mut timers = self.timers.lock();
        timers.accumulate();
        if !timers.stack.is_empty() {
            timers.started = Some(Instant::now());
        }
        timers.wasm
    }

    /// Accumulated host-function execution time.
    pub fn host_time(&self) -> Duration {
        let mut timers = self.timers.lock();
        timers.accumulate();
        if !timers.stack.is_empty() {
            timers.started = Some(Instant::now());
        }
        timers.host
    }

    /// Total recorded execution time.
    pub fn total_time(&self) -> Duration {
        self.wasm_time() + self.host_time()
    }

    /// Resets all four counters; the cost table and limit stay.
    pub fn clear(&self) {
        self.instr_count.store(0, Ordering::Relaxed);
        self.cost_sum.store(0, Ordering::Relaxed);
        *self.timers.lock() = TimerStack::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn gas_saturates_at_the_limit() {
        let stats = Statistics::new();
        stats.set_gas_limit(10);
        assert!(stats.add_cost(7));
        assert!(stats.add_cost(3));
        assert!(!stats.add_cost(1));
        assert_eq!(stats.gas_used(), 10);
        // Monotonic, never exceeding the limit.
        assert!(!stats.add_cost(100));
        assert_eq!(stats.gas_used(), 10);
    }

    #[test]
    fn cost_table_defaults_to_one() {
        let stats = Statistics::new();
        assert_eq!(stats.cost_of(0x6a), 1);
        stats.set_cost(0x6a, 5);
        assert_eq!(stats.cost_of(0x6a), 5);
        assert!(stats.add_instr_cost(0x6a));
        assert_eq!(stats.gas_used(), 5);
    }

    #[test]
    fn sub_cost_floors_at_zero() {
        let stats = Statistics::new();
        assert!(stats.add_cost(3));
        stats.sub_cost(10);
        assert_eq!(stats.gas_used(), 0);
    }

    #[test]
    fn timers_partition_exclusively() {
        let stats = Statistics::new();
        stats.start_record_wasm();
        thread::sleep(Duration::from_millis(10));
        stats.start_record_host();
        thread::sleep(Duration::from_millis(10));
        stats.stop_record_host();
        stats.stop_record_wasm();

        let wasm = stats.wasm_time();
        let host = stats.host_time();
        assert!(wasm >= Duration::from_millis(8));
        assert!(host >= Duration::from_millis(8));

        stats.clear();
        assert_eq!(stats.wasm_time(), Duration::ZERO);
        assert_eq!(stats.instr_count(), 0);
    }
}
