//! Engine configuration.
//!
//! A [`Config`] is handed to [`Executor::new`](crate::Executor::new) and is
//! immutable afterwards. The Wasm 2.0 baseline (multi-value, reference
//! types, bulk memory, SIMD, sign-extension, non-trapping float-to-int,
//! mutable globals) is always available; everything newer is gated behind a
//! [`Proposal`] flag.

/// A post-2.0 WebAssembly language extension that can be switched on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Proposal {
    /// `return_call` and `return_call_indirect`.
    TailCall,
    /// Arithmetic in constant expressions.
    ExtendedConst,
    /// Typed function references (`call_ref`, non-nullable concrete refs).
    FunctionReferences,
    /// Garbage collection: struct/array/i31 references and rec types.
    GC,
    /// More than one linear memory per module.
    MultiMemory,
    /// Relaxed SIMD instructions.
    RelaxedSimd,
    /// Exception handling: `try`/`catch`/`throw`/`rethrow` and tags.
    ExceptionHandling,
    /// Shared memories and atomic instructions.
    Threads,
}

impl Proposal {
    fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// A set of enabled [`Proposal`]s.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ProposalSet(u32);

impl ProposalSet {
    /// The empty set: Wasm 2.0 baseline only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables a proposal.
    pub fn insert(&mut self, proposal: Proposal) {
        self.0 |= proposal.bit();
    }

    /// Disables a proposal.
    pub fn remove(&mut self, proposal: Proposal) {
        self.0 &= !proposal.bit();
    }

    /// Whether a proposal is enabled.
    pub fn contains(&self, proposal: Proposal) -> bool {
        self.0 & proposal.bit() != 0
    }
}

impl FromIterator<Proposal> for ProposalSet {
    fn from_iter<I: IntoIterator<Item = Proposal>>(iter: I) -> Self {
        let mut set = Self::new();
        for proposal in iter {
            set.insert(proposal);
        }
        set
    }
}

/// Which statistics counters the executor maintains.
///
/// All counters are disabled by default; each can be toggled on its own.
#[derive(Debug, Copy, Clone, Default)]
pub struct StatisticsConfig {
    /// Count retired instructions.
    pub instr_count: bool,
    /// Account per-opcode cost against the gas limit.
    pub cost: bool,
    /// Record the wasm/host wall-time split.
    pub time: bool,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    proposals: ProposalSet,
    max_memory_page: u32,
    allow_af_unix: bool,
    force_interpreter: bool,
    statistics: StatisticsConfig,
    gas_limit: u64,
    time_limit_ms: u64,
    forbidden_plugins: Vec<String>,
    max_value_stack: usize,
    max_call_depth: usize,
    gc_threshold: u64,
    gc_interval_ms: u64,
    gc_collector_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proposals: ProposalSet::new(),
            max_memory_page: 65536,
            allow_af_unix: false,
            force_interpreter: false,
            statistics: StatisticsConfig::default(),
            gas_limit: u64::MAX,
            time_limit_ms: 0,
            forbidden_plugins: Vec::new(),
            max_value_stack: 1024 * 1024,
            max_call_depth: 16 * 1024,
            gc_threshold: 1024 * 1024,
            gc_interval_ms: 1000,
            gc_collector_threads: 2,
        }
    }
}

impl Config {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables `proposal`.
    pub fn with_proposal(mut self, proposal: Proposal) -> Self {
        self.proposals.insert(proposal);
        self
    }

    /// Replaces the whole proposal set.
    pub fn with_proposals(mut self, proposals: ProposalSet) -> Self {
        self.proposals = proposals;
        self
    }

    /// Hard ceiling for `memory.grow`, in pages.
    pub fn with_max_memory_page(mut self, pages: u32) -> Self {
        self.max_memory_page = pages;
        self
    }

    /// Allow WASI sockets to use UNIX-domain families.
    ///
    /// Consumed by socket plug-ins; the core only carries the flag.
    pub fn with_allow_af_unix(mut self, allow: bool) -> Self {
        self.allow_af_unix = allow;
        self
    }

    /// Disables the compiled-code path even when a function carries one.
    pub fn with_force_interpreter(mut self, force: bool) -> Self {
        self.force_interpreter = force;
        self
    }

    /// Selects which statistics counters are maintained.
    pub fn with_statistics(mut self, statistics: StatisticsConfig) -> Self {
        self.statistics = statistics;
        self
    }

    /// Per-invocation gas ceiling.
    pub fn with_gas_limit(mut self, limit: u64) -> Self {
        self.gas_limit = limit;
        self
    }

    /// Per-invocation wall-clock ceiling in milliseconds; `0` disables it.
    pub fn with_time_limit_ms(mut self, limit: u64) -> Self {
        self.time_limit_ms = limit;
        self
    }

    /// Plug-ins excluded from registration.
    pub fn with_forbidden_plugins(mut self, names: Vec<String>) -> Self {
        self.forbidden_plugins = names;
        self
    }

    /// Caps the operand stack, in values.
    pub fn with_max_value_stack(mut self, limit: usize) -> Self {
        self.max_value_stack = limit;
        self
    }

    /// Caps the number of active call frames.
    pub fn with_max_call_depth(mut self, limit: usize) -> Self {
        self.max_call_depth = limit;
        self
    }

    /// GC heap occupancy (bytes) that wakes the collector.
    pub fn with_gc_threshold(mut self, bytes: u64) -> Self {
        self.gc_threshold = bytes;
        self
    }

    /// Number of collector worker threads.
    pub fn with_gc_collector_threads(mut self, count: usize) -> Self {
        self.gc_collector_threads = count.max(1);
        self
    }

    /// The enabled proposal set.
    pub fn proposals(&self) -> ProposalSet {
        self.proposals
    }

    /// Hard `memory.grow` ceiling in pages.
    pub fn max_memory_page(&self) -> u32 {
        self.max_memory_page
    }

    /// Whether UNIX-domain socket families are allowed.
    pub fn allow_af_unix(&self) -> bool {
        self.allow_af_unix
    }

    /// Whether compiled function bodies are ignored.
    pub fn force_interpreter(&self) -> bool {
        self.force_interpreter
    }

    /// The statistics toggles.
    pub fn statistics(&self) -> StatisticsConfig {
        self.statistics
    }

    /// The per-invocation gas ceiling.
    pub fn gas_limit(&self) -> u64 {
        self.gas_limit
    }

    /// The per-invocation wall-clock ceiling in milliseconds.
    pub fn time_limit_ms(&self) -> u64 {
        self.time_limit_ms
    }

    /// Names of excluded plug-ins.
    pub fn forbidden_plugins(&self) -> &[String] {
        &self.forbidden_plugins
    }

    /// Operand stack cap, in values.
    pub fn max_value_stack(&self) -> usize {
        self.max_value_stack
    }

    /// Call depth cap.
    pub fn max_call_depth(&self) -> usize {
        self.max_call_depth
    }

    /// GC wake-up threshold in bytes.
    pub fn gc_threshold(&self) -> u64 {
        self.gc_threshold
    }

    /// GC timer interval in milliseconds.
    pub fn gc_interval_ms(&self) -> u64 {
        self.gc_interval_ms
    }

    /// Collector thread count.
    pub fn gc_collector_threads(&self) -> usize {
        self.gc_collector_threads
    }
}
