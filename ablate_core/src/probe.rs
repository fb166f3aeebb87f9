use std::collections::HashMap;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::debug;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MB
}

/// Reads the process table to follow an engine process and everything it spawned.
pub struct ProcessTreeProbe {
    system: System,
    root: Pid,
}

impl ProcessTreeProbe {
    pub fn new(root_pid: u32) -> Self {
        Self {
            system: System::new(),
            root: Pid::from_u32(root_pid),
        }
    }

    pub fn refresh(&mut self) {
        self.system.refresh_processes(ProcessesToUpdate::All, true);
    }

    /// Root first, then descendants in breadth-first order. Empty once the root is gone.
    pub fn tree(&self) -> Vec<Pid> {
        let processes = self.system.processes();
        if !processes.contains_key(&self.root) {
            return Vec::new();
        }
        let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (pid, process) in processes {
            // Linux threads show up as tasks sharing the parent's memory.
            if process.thread_kind().is_some() {
                continue;
            }
            if let Some(parent) = process.parent() {
                children.entry(parent).or_default().push(*pid);
            }
        }
        let mut tree = vec![self.root];
        let mut cursor = 0;
        while cursor < tree.len() {
            if let Some(kids) = children.get(&tree[cursor]) {
                tree.extend(kids.iter().copied().filter(|pid| *pid != self.root));
            }
            cursor += 1;
        }
        tree
    }

    /// Resident memory of the whole tree, or `None` when the root has disappeared.
    pub fn resident_bytes(&mut self) -> Option<u64> {
        self.refresh();
        let tree = self.tree();
        if tree.is_empty() {
            return None;
        }
        Some(
            tree.iter()
                .filter_map(|pid| self.system.process(*pid))
                .map(|process| process.memory())
                .sum(),
        )
    }

    /// Sends SIGKILL to every descendant of the root, deepest first.
    ///
    /// The root itself is left to its owner so it can be reaped through `Child`.
    pub fn kill_descendants(&mut self) -> usize {
        self.refresh();
        let tree = self.tree();
        let mut killed = 0;
        for pid in tree.iter().skip(1).rev() {
            if let Some(process) = self.system.process(*pid) {
                if process.kill() {
                    killed += 1;
                } else {
                    debug!(%pid, "descendant already gone");
                }
            }
        }
        killed
    }
}
