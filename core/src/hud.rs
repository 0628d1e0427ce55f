//! Per-step counters surfaced to the agent in every tool response footer.

use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

#[derive(Debug, Default)]
pub struct Hud {
    edits: AtomicUsize,
    undos: AtomicUsize,
    plan: Mutex<Option<String>>,
}

impl Hud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_edits(&self, count: usize) {
        self.edits.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_undo(&self) {
        self.undos.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_plan(&self, plan: Option<String>) {
        if let Ok(mut guard) = self.plan.lock() {
            *guard = plan;
        }
    }

    pub fn render(&self, unlocked_files: usize) -> String {
        let edits = self.edits.load(Ordering::Relaxed);
        let undos = self.undos.load(Ordering::Relaxed);
        let plan = self
            .plan
            .lock()
            .ok()
            .and_then(|p| p.clone())
            .unwrap_or_else(|| "none".to_string());
        format!("[hud] edits: {edits} | undos: {undos} | unlocked files: {unlocked_files} | plan: {plan}")
    }
}
