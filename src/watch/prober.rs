//! Threshold failure detection.
//!
//! Every tick walks a probe wave down the tree from the root's children,
//! FIFO. A server that has already missed `warn_threshold` probes gets one
//! warning and blocks descent into its subtree; the wave resumes through it
//! on the first tick after it answers again. No wall-clock deadlines — the
//! per-server counter and the fixed tick period are the whole detector.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};

use super::topology::Topology;

/// What one tick wants done: probes to send and alert lines to emit.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickOutput {
    /// Servers to probe, in wave order.
    pub probes: Vec<String>,
    pub alerts: Vec<String>,
}

#[derive(Debug)]
pub struct Prober {
    warn_threshold: u32,
    ignore: HashSet<String>,
}

impl Prober {
    pub fn new<I, S>(warn_threshold: u32, ignore: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Prober {
            warn_threshold,
            ignore: ignore.into_iter().map(Into::into).collect(),
        }
    }

    /// Run one probe wave. Counters are checked before they are incremented,
    /// so a server is warned about on the probe *after* the threshold'th
    /// unanswered one, exactly once.
    pub fn tick(&self, topo: &mut Topology, now: DateTime<Utc>) -> TickOutput {
        let mut out = TickOutput::default();
        let Some(root) = topo.root() else {
            return out;
        };

        let mut queue: VecDeque<String> = topo
            .get(root)
            .map(|entry| entry.downlinks.iter().cloned().collect())
            .unwrap_or_default();

        while let Some(name) = queue.pop_front() {
            if self.ignore.contains(&name) {
                // Not probed, not counted, subtree never traversed.
                continue;
            }
            let Some(entry) = topo.get_mut(&name) else {
                continue;
            };

            let at_threshold = entry.probes == self.warn_threshold;
            let healthy = entry.probes < self.warn_threshold;
            let last_reply = entry.last_reply;
            if healthy {
                queue.extend(entry.downlinks.iter().cloned());
            }
            entry.probes += 1;
            out.probes.push(name.clone());

            if at_threshold {
                let mut line =
                    format!("WARN: {name} failed to check in {} times", self.warn_threshold);
                if let Some(at) = last_reply {
                    let since = (now - at).num_milliseconds() as f64 / 1000.0;
                    line.push_str(&format!(" (seen {since:.2}s ago)"));
                }
                out.alerts.push(line);

                let mut affected = topo.descendants(&name);
                affected.sort();
                out.alerts.push(format!("{name} downlinks: {}", affected.join(", ")));
            }
        }
        out
    }

    /// A probe reply arrived. Emits the recovery alert when the server was
    /// sitting exactly at the threshold, then decrements its counter.
    ///
    /// Unknown names are a silent no-op: the server may have been removed by
    /// a split between the probe and its reply. The counter also floors at
    /// zero for the same race in the other direction.
    pub fn on_reply(
        &self,
        topo: &mut Topology,
        name: &str,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let entry = topo.get_mut(name)?;
        let caught_up = entry.probes == self.warn_threshold;
        entry.probes = entry.probes.saturating_sub(1);
        entry.last_reply = Some(now);
        caught_up.then(|| format!("INFO: {name} caught up"))
    }
}
