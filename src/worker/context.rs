//! Per-session recorder state.
//!
//! Instrumented code reports into a [`Probe`]; the probe writes into the
//! session's [`ProfilerContext`] and the current test's [`TestScope`]. There
//! is no global state: every session builds its own context.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use objsim_types::{DomainKind, ExitSnapshot, FieldWhitelist, Snapshot, TestId};

use crate::index_domain::IndexDomain;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Record coverage and field accesses, never snapshots.
    Discovery,
    /// Record snapshots of the target methods, pruned by their whitelists.
    Capture,
}

#[derive(Debug, Default)]
struct Recorders {
    /// Test -> indices of the methods it entered.
    coverage: BTreeMap<TestId, BTreeSet<u32>>,
    /// Live frames per target method.
    depth: HashMap<u32, u32>,
    /// Target method -> fields touched while one of its frames was live.
    accesses: BTreeMap<u32, BTreeSet<u32>>,
}

pub struct ProfilerContext {
    stage: Stage,
    methods: Mutex<IndexDomain>,
    fields: Mutex<IndexDomain>,
    targets: HashSet<u32>,
    whitelists: HashMap<u32, FieldWhitelist>,
    coverage_globs: Vec<String>,
    snapshot_limit: usize,
    recorders: Mutex<Recorders>,
}

impl ProfilerContext {
    /// Context for a discovery run: the patched methods become the targets.
    pub fn for_discovery(patched_methods: &[String], coverage_globs: Vec<String>) -> Self {
        let mut methods = IndexDomain::new(DomainKind::Methods);
        let targets = patched_methods
            .iter()
            .map(|m| methods.get_or_add(m.as_str()))
            .collect();
        Self {
            stage: Stage::Discovery,
            methods: Mutex::new(methods),
            fields: Mutex::new(IndexDomain::new(DomainKind::Fields)),
            targets,
            whitelists: HashMap::new(),
            coverage_globs,
            snapshot_limit: 0,
            recorders: Mutex::new(Recorders::default()),
        }
    }

    /// Context for a capture run over domains saved by discovery.
    pub fn for_capture(
        methods: IndexDomain,
        fields: IndexDomain,
        whitelists: HashMap<u32, FieldWhitelist>,
        snapshot_limit: usize,
    ) -> Self {
        Self {
            stage: Stage::Capture,
            methods: Mutex::new(methods),
            fields: Mutex::new(fields),
            targets: whitelists.keys().copied().collect(),
            whitelists,
            coverage_globs: Vec::new(),
            snapshot_limit,
            recorders: Mutex::new(Recorders::default()),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn snapshot_limit(&self) -> usize {
        self.snapshot_limit
    }

    /// Forget frames left open by a previous test.
    pub fn begin_test(&self) {
        self.recorders.lock().depth.clear();
    }

    pub fn coverage(&self) -> BTreeMap<TestId, Vec<u32>> {
        self.recorders
            .lock()
            .coverage
            .iter()
            .map(|(test, methods)| (test.clone(), methods.iter().copied().collect()))
            .collect()
    }

    pub fn field_accesses(&self) -> BTreeMap<u32, Vec<u32>> {
        let recorders = self.recorders.lock();
        self.targets
            .iter()
            .map(|target| {
                let fields = recorders
                    .accesses
                    .get(target)
                    .map(|f| f.iter().copied().collect())
                    .unwrap_or_default();
                (*target, fields)
            })
            .collect()
    }

    pub fn methods(&self) -> IndexDomain {
        self.methods.lock().clone()
    }

    pub fn fields(&self) -> IndexDomain {
        self.fields.lock().clone()
    }

    fn method_index(&self, name: &str) -> u32 {
        self.methods.lock().get_or_add(name)
    }

    fn field_index(&self, name: &str) -> u32 {
        self.fields.lock().get_or_add(name)
    }

    fn records_coverage_of(&self, method: &str) -> bool {
        if self.coverage_globs.is_empty() {
            return true;
        }
        let class = objsim_types::split_member_name(method)
            .map(|(class, _)| class)
            .unwrap_or(method);
        self.coverage_globs.iter().any(|g| glob_match(g, class))
    }
}

/// Snapshots captured for one test.
pub struct TestScope {
    test: TestId,
    limit: usize,
    exits: Mutex<VecDeque<ExitSnapshot>>,
}

impl TestScope {
    pub fn new(test: TestId, limit: usize) -> Self {
        Self {
            test,
            limit,
            exits: Mutex::new(VecDeque::new()),
        }
    }

    pub fn test(&self) -> &TestId {
        &self.test
    }

    fn push(&self, exit: ExitSnapshot) {
        let mut exits = self.exits.lock();
        if self.limit > 0 && exits.len() == self.limit {
            exits.pop_front();
        }
        exits.push_back(exit);
    }

    pub fn take(&self) -> Vec<ExitSnapshot> {
        self.exits.lock().drain(..).collect()
    }
}

/// Hooks called by instrumented code while a test runs.
#[derive(Clone)]
pub struct Probe {
    ctx: Arc<ProfilerContext>,
    scope: Arc<TestScope>,
}

impl Probe {
    pub fn new(ctx: Arc<ProfilerContext>, scope: Arc<TestScope>) -> Self {
        Self { ctx, scope }
    }

    /// A method frame was entered.
    pub fn enter(&self, method: &str) {
        let idx = self.ctx.method_index(method);
        let mut rec = self.ctx.recorders.lock();
        if self.ctx.records_coverage_of(method) {
            rec.coverage
                .entry(self.scope.test.clone())
                .or_default()
                .insert(idx);
        }
        if self.ctx.targets.contains(&idx) {
            *rec.depth.entry(idx).or_insert(0) += 1;
        }
    }

    /// A field was read or written.
    pub fn field(&self, field: &str) {
        let idx = self.ctx.field_index(field);
        let mut rec = self.ctx.recorders.lock();
        let live: Vec<u32> = rec
            .depth
            .iter()
            .filter(|(_, depth)| **depth > 0)
            .map(|(method, _)| *method)
            .collect();
        for method in live {
            rec.accesses.entry(method).or_default().insert(idx);
        }
    }

    /// A method frame is being left, normally or by an exception.
    ///
    /// `slots` is the state at the exit; see [`ExitSnapshot`] for the layout.
    pub fn exit(&self, method: &str, slots: Vec<Snapshot>) {
        let idx = self.ctx.method_index(method);
        if !self.ctx.targets.contains(&idx) {
            return;
        }
        {
            let mut rec = self.ctx.recorders.lock();
            if let Some(depth) = rec.depth.get_mut(&idx) {
                *depth = depth.saturating_sub(1);
            }
        }
        if self.ctx.stage == Stage::Capture {
            let mut exit = ExitSnapshot::new(slots);
            if let Some(whitelist) = self.ctx.whitelists.get(&idx) {
                exit.prune(whitelist);
            }
            self.scope.push(exit);
        }
    }
}

/// `*` matches any run of characters, everything else matches itself.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}
