// rust/rv-core/src/topology/verifier.rs

//! Post-rendezvous topology check.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Write;

use crate::error::{Result, RvError};
use crate::node::NodeIdentity;
use crate::rendezvous::split_host_port;

use super::collective::Collective;

/// Which ranks ended up on which hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologySnapshot {
    pub world_size: usize,
    pub hosts: BTreeMap<String, BTreeSet<usize>>,
}

impl TopologySnapshot {
    /// Builds a snapshot from hostnames indexed by rank.
    pub fn from_reports(hostnames: &[String]) -> Self {
        let mut hosts: BTreeMap<String, BTreeSet<usize>> = BTreeMap::new();
        for (rank, host) in hostnames.iter().enumerate() {
            hosts.entry(host.clone()).or_default().insert(rank);
        }
        Self {
            world_size: hostnames.len(),
            hosts,
        }
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_multi_node(&self) -> bool {
        self.host_count() > 1
    }

    /// Host the given rank reported, if any.
    pub fn host_of(&self, rank: usize) -> Option<&str> {
        self.hosts
            .iter()
            .find(|(_, ranks)| ranks.contains(&rank))
            .map(|(host, _)| host.as_str())
    }

    /// Compares the advertised head address against the reported hosts.
    ///
    /// The port is stripped first. A host matches when either string
    /// contains the other, so `gpu-a01` matches `gpu-a01.cluster.local`.
    /// Rank 0's host is tried before the rest.
    pub fn check_head(&self, expected: Option<&str>) -> HeadCheck {
        let Some(expected) = expected else {
            return HeadCheck::Unknown;
        };
        let (wanted, _) = split_host_port(expected);
        if wanted.is_empty() {
            return HeadCheck::Unknown;
        }

        let is_match = |host: &str| host.contains(wanted) || wanted.contains(host);

        let first = self.host_of(0).filter(|host| is_match(host));
        let any = || {
            self.hosts
                .keys()
                .map(String::as_str)
                .find(|host| is_match(host))
        };

        match first.or_else(any) {
            Some(host) => HeadCheck::Matched {
                host: host.to_string(),
            },
            None => HeadCheck::Mismatch {
                expected: wanted.to_string(),
            },
        }
    }
}

/// Outcome of cross-checking the advertised head address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadCheck {
    Matched { host: String },
    Mismatch { expected: String },
    /// No head address was advertised.
    Unknown,
}

impl fmt::Display for HeadCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Matched { host } => write!(f, "matched({host})"),
            Self::Mismatch { expected } => write!(f, "mismatch(expected={expected})"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// Non-fatal findings; the run continues regardless.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyWarning {
    /// Every rank landed on one host.
    SingleHost,
    FewerHostsThanExpected { expected: usize, observed: usize },
}

impl fmt::Display for TopologyWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SingleHost => f.write_str("single-node degeneration: all ranks on one host"),
            Self::FewerHostsThanExpected { expected, observed } => {
                write!(f, "expected {expected} hosts, observed {observed}")
            }
        }
    }
}

/// The coordinator's conclusion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyReport {
    pub snapshot: TopologySnapshot,
    pub head_check: HeadCheck,
    pub warnings: Vec<TopologyWarning>,
}

impl TopologyReport {
    pub fn new(
        snapshot: TopologySnapshot,
        expected_head: Option<&str>,
        expected_nodes: Option<usize>,
    ) -> Self {
        let head_check = snapshot.check_head(expected_head);
        let observed = snapshot.host_count();

        let mut warnings = Vec::new();
        if !snapshot.is_multi_node() {
            warnings.push(TopologyWarning::SingleHost);
        }
        if let Some(expected) = expected_nodes {
            if expected > observed {
                warnings.push(TopologyWarning::FewerHostsThanExpected { expected, observed });
            }
        }

        Self {
            snapshot,
            head_check,
            warnings,
        }
    }

    pub fn host_count(&self) -> usize {
        self.snapshot.host_count()
    }

    pub fn is_multi_node(&self) -> bool {
        self.snapshot.is_multi_node()
    }

    /// Writes the summary lines scraped by downstream tooling.
    pub fn write_summary(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let hosts: Vec<&str> = self.snapshot.hosts.keys().map(String::as_str).collect();
        writeln!(out, "host_count={}", self.host_count())?;
        writeln!(out, "hosts=[{}]", hosts.join(", "))?;
        writeln!(out, "multi_node={}", self.is_multi_node())?;
        writeln!(out, "head_check={}", self.head_check)?;
        for warning in &self.warnings {
            writeln!(out, "warning={warning}")?;
        }
        out.flush()
    }
}

/// Formats one rank's self-report line.
pub fn rank_line(node: &NodeIdentity) -> String {
    format!(
        "[Rank {}/{}] host={} local_rank={}",
        node.rank, node.world_size, node.hostname, node.local_rank
    )
}

/// Runs the topology check on this rank.
///
/// Every rank prints its own line in rank order, crossing a barrier after
/// each turn, then hostnames are all-gathered. Rank 0 builds, logs and
/// prints the report; other ranks get `None`.
///
/// Write failures on `out` are logged and do not abort the check, since the
/// remaining ranks are still waiting in the collective.
///
/// # Errors
///
/// Returns an error if a collective operation fails or times out.
pub fn verify(
    collective: &mut dyn Collective,
    node: &NodeIdentity,
    expected_head: Option<&str>,
    expected_nodes: Option<usize>,
    out: &mut dyn Write,
) -> Result<Option<TopologyReport>> {
    if collective.rank() != node.rank || collective.world_size() != node.world_size {
        return Err(RvError::cluster(format!(
            "collective is rank {}/{} but node is rank {}/{}",
            collective.rank(),
            collective.world_size(),
            node.rank,
            node.world_size
        )));
    }

    for turn in 0..node.world_size {
        if turn == node.rank {
            let line = rank_line(node);
            if let Err(e) = writeln!(out, "{line}").and_then(|()| out.flush()) {
                tracing::warn!(rank = node.rank, error = %e, "failed to print rank report");
            }
        }
        collective.barrier()?;
    }

    let hostnames = collective.all_gather(&node.hostname)?;
    if !node.is_coordinator() {
        return Ok(None);
    }

    let report = TopologyReport::new(
        TopologySnapshot::from_reports(&hostnames),
        expected_head,
        expected_nodes,
    );

    tracing::info!(
        host_count = report.host_count(),
        multi_node = report.is_multi_node(),
        head_check = %report.head_check,
        "topology verified"
    );
    for warning in &report.warnings {
        tracing::warn!(%warning, "topology warning");
    }
    if let HeadCheck::Mismatch { expected } = &report.head_check {
        tracing::warn!(expected = %expected, "advertised head address matches no reported host");
    }

    if let Err(e) = report.write_summary(out) {
        tracing::warn!(error = %e, "failed to print topology summary");
    }
    Ok(Some(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::LocalGroup;
    use std::io;
    use std::sync::{Arc, Mutex};
    use std::thread;

    #[derive(Clone, Default)]
    struct SharedLog(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedLog {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedLog {
        fn lines(&self) -> Vec<String> {
            String::from_utf8(self.0.lock().unwrap().clone())
                .unwrap()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }
    }

    fn hosts(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn run_group(hostnames: Vec<String>, expected_head: Option<&'static str>) -> (Option<TopologyReport>, SharedLog) {
        let world_size = hostnames.len();
        let log = SharedLog::default();

        let handles: Vec<_> = LocalGroup::create(world_size)
            .into_iter()
            .zip(hostnames)
            .map(|(mut member, host)| {
                let mut out = log.clone();
                thread::spawn(move || {
                    let rank = member.rank();
                    let node = NodeIdentity::new(host, rank, rank % 2, world_size);
                    verify(&mut member, &node, expected_head, None, &mut out).unwrap()
                })
            })
            .collect();

        let reports: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(reports[1..].iter().all(Option::is_none));
        (reports.into_iter().next().flatten(), log)
    }

    #[test]
    fn test_identical_hosts_degenerate() {
        let snapshot = TopologySnapshot::from_reports(&hosts(&["n1", "n1", "n1", "n1"]));
        let report = TopologyReport::new(snapshot, None, None);

        assert_eq!(report.host_count(), 1);
        assert!(!report.is_multi_node());
        assert_eq!(report.warnings, vec![TopologyWarning::SingleHost]);
        assert_eq!(report.head_check, HeadCheck::Unknown);
    }

    #[test]
    fn test_half_distinct_hosts() {
        let names: Vec<String> = (0..8).map(|rank| format!("node-{}", rank / 2)).collect();
        let snapshot = TopologySnapshot::from_reports(&names);

        assert_eq!(snapshot.host_count(), 4);
        assert!(snapshot.is_multi_node());
        assert_eq!(snapshot.hosts["node-3"], BTreeSet::from([6, 7]));
        assert_eq!(snapshot.world_size, 8);
    }

    #[test]
    fn test_snapshot_invariants() {
        let snapshot = TopologySnapshot::from_reports(&hosts(&["b", "a", "b"]));
        let covered: usize = snapshot.hosts.values().map(BTreeSet::len).sum();

        assert_eq!(covered, snapshot.world_size);
        assert!(snapshot.host_count() <= snapshot.world_size);
        assert_eq!(snapshot.host_of(1), Some("a"));
        assert_eq!(snapshot.host_of(5), None);
    }

    #[test]
    fn test_fewer_hosts_than_expected() {
        let snapshot = TopologySnapshot::from_reports(&hosts(&["n1", "n1", "n2", "n2"]));
        let report = TopologyReport::new(snapshot, None, Some(3));

        assert_eq!(
            report.warnings,
            vec![TopologyWarning::FewerHostsThanExpected {
                expected: 3,
                observed: 2
            }]
        );
    }

    #[test]
    fn test_head_check() {
        let snapshot =
            TopologySnapshot::from_reports(&hosts(&["gpu-a01.cluster.local", "gpu-a02.cluster.local"]));

        assert_eq!(
            snapshot.check_head(Some("gpu-a01")),
            HeadCheck::Matched {
                host: "gpu-a01.cluster.local".to_string()
            }
        );
        assert_eq!(
            snapshot.check_head(Some("gpu-a02:29500")),
            HeadCheck::Matched {
                host: "gpu-a02.cluster.local".to_string()
            }
        );
        assert_eq!(
            snapshot.check_head(Some("10.0.0.1:6379")),
            HeadCheck::Mismatch {
                expected: "10.0.0.1".to_string()
            }
        );
        assert_eq!(snapshot.check_head(None), HeadCheck::Unknown);
    }

    #[test]
    fn test_summary_lines() {
        let snapshot = TopologySnapshot::from_reports(&hosts(&["n2", "n1"]));
        let report = TopologyReport::new(snapshot, Some("n1"), Some(2));
        let mut out: Vec<u8> = Vec::new();

        report.write_summary(&mut out).unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "host_count=2\nhosts=[n1, n2]\nmulti_node=true\nhead_check=matched(n1)\n"
        );
    }

    #[test]
    fn test_rank_lines_printed_in_order() {
        let names = hosts(&["gpu-a01", "gpu-a01", "gpu-a02", "gpu-a02"]);
        let (report, log) = run_group(names, Some("gpu-a01:29500"));

        let lines = log.lines();
        assert_eq!(
            &lines[..4],
            &[
                "[Rank 0/4] host=gpu-a01 local_rank=0",
                "[Rank 1/4] host=gpu-a01 local_rank=1",
                "[Rank 2/4] host=gpu-a02 local_rank=0",
                "[Rank 3/4] host=gpu-a02 local_rank=1",
            ]
        );
        assert_eq!(lines[4], "host_count=2");
        assert_eq!(lines[6], "multi_node=true");

        let report = report.unwrap();
        assert!(report.warnings.is_empty());
        assert!(matches!(report.head_check, HeadCheck::Matched { .. }));
    }

    #[test]
    fn test_single_rank_flags_single_host() {
        let (report, log) = run_group(hosts(&["laptop"]), None);

        let report = report.unwrap();
        assert_eq!(report.warnings, vec![TopologyWarning::SingleHost]);
        assert!(log.lines().contains(&"warning=single-node degeneration: all ranks on one host".to_string()));
    }

    #[test]
    fn test_output_failure_is_not_fatal() {
        let mut group = LocalGroup::create(1);
        let node = NodeIdentity::new("laptop", 0, 0, 1);

        let report = verify(&mut group[0], &node, None, None, &mut BrokenPipe).unwrap();
        assert_eq!(report.unwrap().host_count(), 1);
    }

    #[test]
    fn test_rank_mismatch_rejected() {
        let mut group = LocalGroup::create(2);
        let node = NodeIdentity::new("laptop", 0, 0, 2);

        assert!(verify(&mut group[1], &node, None, None, &mut Vec::<u8>::new()).is_err());
    }
}
