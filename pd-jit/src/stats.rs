//! Counters bumped by generated code when stats are enabled.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::insn::Opcode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Counter {
    /// Instructions executed in native code.
    InsnsCount,
    SideExits,
    /// Side exits taken at an instruction with this opcode.
    ExitAt(Opcode),
}

impl Counter {
    fn slot(self) -> usize {
        match self {
            Counter::InsnsCount => 0,
            Counter::SideExits => 1,
            Counter::ExitAt(opcode) => 2 + opcode.index(),
        }
    }
}

const SLOTS: usize = 2 + Opcode::COUNT;

pub struct Counters {
    enabled: bool,
    slots: Box<[AtomicU64]>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CounterSnapshot {
    pub insns_count: u64,
    pub side_exits: u64,
    pub exits_by_opcode: Vec<(String, u64)>,
}

impl Counters {
    pub fn new(enabled: bool) -> Self {
        let slots = (0..SLOTS).map(|_| AtomicU64::new(0)).collect();
        Self { enabled, slots }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Address generated code increments, or None when stats are off.
    pub fn addr(&self, counter: Counter) -> Option<u64> {
        self.enabled
            .then(|| self.slots[counter.slot()].as_ptr() as u64)
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.slots[counter.slot()].load(Ordering::Relaxed)
    }

    pub fn incr(&self, counter: Counter) {
        self.slots[counter.slot()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let mut exits_by_opcode: Vec<(String, u64)> = Opcode::ALL
            .iter()
            .map(|op| (op.name().to_string(), self.get(Counter::ExitAt(*op))))
            .filter(|(_, count)| *count > 0)
            .collect();
        exits_by_opcode.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        CounterSnapshot {
            insns_count: self.get(Counter::InsnsCount),
            side_exits: self.get(Counter::SideExits),
            exits_by_opcode,
        }
    }
}
