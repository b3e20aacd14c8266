//! Process tree and alive-count timeline of the traced command.

use std::fmt::Write;

use serde::Serialize;

use crate::event::{Event, EventKind};

/// One sample of the alive-count step function, valid from `time` until the
/// next sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeInterval {
    pub time: u64,
    pub alive: usize,
}

#[derive(Debug)]
struct Node {
    pid: u32,
    command: String,
    alive: bool,
    children: Vec<usize>,
}

/// Arena backed process tree. Node 0 is the root.
#[derive(Debug)]
pub struct ProcessTree {
    nodes: Vec<Node>,
}

impl ProcessTree {
    fn new(pid: u32, command: String) -> Self {
        ProcessTree {
            nodes: vec![Node {
                pid,
                command,
                alive: true,
                children: Vec::new(),
            }],
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn root_pid(&self) -> u32 {
        self.nodes[0].pid
    }

    /// Depth first search from the root, children in insertion order.
    fn find(&self, pid: u32) -> Option<usize> {
        let mut stack = vec![0];
        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx];
            if node.pid == pid {
                return Some(idx);
            }
            stack.extend(node.children.iter().rev());
        }
        None
    }

    fn add_child(&mut self, parent: usize, pid: u32, command: &str) {
        let idx = self.nodes.len();
        self.nodes.push(Node {
            pid,
            command: command.to_string(),
            alive: false,
            children: Vec::new(),
        });
        self.nodes[parent].children.push(idx);
    }

    fn set_alive(&mut self, pid: u32) {
        if let Some(idx) = self.find(pid) {
            self.nodes[idx].alive = true;
        }
    }

    /// Mark the node for `pid` and its whole subtree dead.
    fn kill(&mut self, pid: u32) {
        let Some(idx) = self.find(pid) else {
            return;
        };
        let mut stack = vec![idx];
        while let Some(idx) = stack.pop() {
            self.nodes[idx].alive = false;
            stack.extend(self.nodes[idx].children.iter());
        }
    }

    /// Alive nodes reachable from the root through alive nodes only.
    pub fn alive_count(&self) -> usize {
        if !self.nodes[0].alive {
            return 0;
        }
        let mut count = 0;
        let mut stack = vec![0];
        while let Some(idx) = stack.pop() {
            count += 1;
            stack.extend(
                self.nodes[idx]
                    .children
                    .iter()
                    .filter(|&&child| self.nodes[child].alive),
            );
        }
        count
    }

    /// Indented rendering, one node per line, live nodes tagged `[ALIVE]`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut stack = vec![(0, 0)];
        while let Some((idx, depth)) = stack.pop() {
            let node = &self.nodes[idx];
            let _ = write!(out, "{}{} ({})", "  ".repeat(depth), node.command, node.pid);
            if node.alive {
                out.push_str(" [ALIVE]");
            }
            out.push('\n');
            stack.extend(node.children.iter().rev().map(|&child| (child, depth + 1)));
        }
        out
    }
}

/// Rebuilds the traced command's process tree from a fused event stream and
/// derives how many of its tasks were alive over time.
pub struct LivenessReconstructor {
    events: Vec<Event>,
    tree: Option<ProcessTree>,
    intervals: Vec<TimeInterval>,
    attach_misses: u64,
}

impl LivenessReconstructor {
    /// `root_hint` is the traced command's pid. Without it the first event's
    /// pid and command become the root.
    pub fn new(mut events: Vec<Event>, root_hint: Option<u32>) -> Self {
        events.sort_by_key(|event| event.timestamp);

        let tree = events.first().map(|first| match root_hint {
            Some(pid) => {
                let command = events
                    .iter()
                    .find(|event| event.pid == pid)
                    .map(|event| event.command.clone())
                    .unwrap_or_else(|| "[unknown]".to_string());
                ProcessTree::new(pid, command)
            }
            None => ProcessTree::new(first.pid, first.command.clone()),
        });

        LivenessReconstructor {
            events,
            tree,
            intervals: Vec::new(),
            attach_misses: 0,
        }
    }

    pub fn tree(&self) -> Option<&ProcessTree> {
        self.tree.as_ref()
    }

    /// Attach every creation event under its parent's node.
    ///
    /// Creations whose parent is not in the tree yet are dropped and counted.
    pub fn build_tree(&mut self) -> &mut Self {
        let Some(tree) = self.tree.as_mut() else {
            return self;
        };
        for event in self.events.iter().filter(|e| e.kind.is_creation()) {
            if tree.find(event.child_pid).is_some() {
                continue;
            }
            match tree.find(event.pid) {
                Some(parent) => tree.add_child(parent, event.child_pid, &event.command),
                None => {
                    self.attach_misses += 1;
                    tracing::trace!(
                        "no parent {} in tree for {} of {}",
                        event.pid,
                        event.kind,
                        event.child_pid
                    );
                }
            }
        }
        tracing::info!(
            "process tree built: {} nodes, {} creations without parent",
            tree.len(),
            self.attach_misses
        );
        self
    }

    /// Replay the stream over the tree and sample the alive count whenever
    /// it changes. The series is closed at the last event's timestamp.
    pub fn compute_intervals(&mut self) -> &[TimeInterval] {
        self.intervals.clear();
        let Some(tree) = self.tree.as_mut() else {
            return &self.intervals;
        };

        let mut max_ts = 0;
        for event in &self.events {
            max_ts = max_ts.max(event.timestamp);
            match event.kind {
                EventKind::Fork | EventKind::Clone | EventKind::Clone3 => {
                    tree.set_alive(event.child_pid)
                }
                EventKind::Exit => tree.kill(event.pid),
                // parent_pid holds the thread group id for exit_group
                EventKind::ExitGroup => tree.kill(event.parent_pid),
                _ => {}
            }

            let alive = tree.alive_count();
            if self.intervals.last().map(|last| last.alive) != Some(alive) {
                self.intervals.push(TimeInterval {
                    time: event.timestamp,
                    alive,
                });
            }
        }

        if let Some(&last) = self.intervals.last() {
            if last.time < max_ts {
                self.intervals.push(TimeInterval {
                    time: max_ts,
                    alive: last.alive,
                });
            }
        }
        tracing::info!("computed {} time intervals", self.intervals.len());
        &self.intervals
    }

    pub fn intervals(&self) -> &[TimeInterval] {
        &self.intervals
    }

    pub fn attach_misses(&self) -> u64 {
        self.attach_misses
    }

    pub fn render_tree(&self) -> String {
        self.tree.as_ref().map(ProcessTree::render).unwrap_or_default()
    }
}
