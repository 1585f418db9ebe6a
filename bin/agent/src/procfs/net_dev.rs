use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use dockwatch_client::entities::{
  InterfaceCounters, NetworkStat,
};

pub struct NetDevReader {
  path: PathBuf,
}

impl NetDevReader {
  pub fn new(proc_dir: &Path) -> NetDevReader {
    NetDevReader {
      path: proc_dir.join("net/dev"),
    }
  }

  pub fn read(&self) -> anyhow::Result<Vec<NetworkStat>> {
    let contents = std::fs::read_to_string(&self.path)
      .with_context(|| format!("open {}", self.path.display()))?;
    parse_net_dev(&contents)
  }
}

/// `/proc/net/dev` starts with two header lines, then one line
/// per interface: `name:` followed by 8 receive and 8 transmit
/// counters. The transmit columns are bytes, packets, errs, drop,
/// fifo, colls, carrier, compressed; they are stored positionally
/// in the same counter shape as the receive side.
fn parse_net_dev(
  contents: &str,
) -> anyhow::Result<Vec<NetworkStat>> {
  let mut stats = Vec::new();
  for line in contents.lines().skip(2) {
    if line.trim().is_empty() {
      continue;
    }
    let Some((name, counters)) = line.split_once(':') else {
      bail!("invalid net/dev line: {line}");
    };
    let fields = counters
      .split_whitespace()
      .map(str::parse)
      .collect::<Result<Vec<u64>, _>>()
      .with_context(|| format!("parse counters of {name}"))?;
    if fields.len() != 16 {
      bail!(
        "expected 16 counters for {name}, got {}",
        fields.len()
      );
    }
    stats.push(NetworkStat {
      interface: name.trim().to_string(),
      received: counters_from(&fields[0..8]),
      transmit: counters_from(&fields[8..16]),
    });
  }
  Ok(stats)
}

fn counters_from(fields: &[u64]) -> InterfaceCounters {
  InterfaceCounters {
    bytes: fields[0],
    packets: fields[1],
    errs: fields[2],
    drop: fields[3],
    fifo: fields[4],
    frame: fields[5],
    compressed: fields[6],
    multicast: fields[7],
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const FIXTURE: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 12345678    9876    0    0    0     0          0         0 12345678    9876    0    0    0     0       0          0
vethf3a1: 987654321   65432    5   10    0     0          0         2 123456789   54321    2    5    0     0       0          0
";

  #[test]
  fn parses_interfaces() {
    let stats = parse_net_dev(FIXTURE).unwrap();
    assert_eq!(stats.len(), 2);

    assert_eq!(stats[0].interface, "lo");
    assert_eq!(stats[0].received.bytes, 12345678);
    assert_eq!(stats[0].transmit.bytes, 12345678);

    let veth = &stats[1];
    assert_eq!(veth.interface, "vethf3a1");
    assert_eq!(veth.received.bytes, 987654321);
    assert_eq!(veth.received.errs, 5);
    assert_eq!(veth.received.drop, 10);
    assert_eq!(veth.received.multicast, 2);
    assert_eq!(veth.transmit.bytes, 123456789);
    assert_eq!(veth.transmit.packets, 54321);
  }

  #[test]
  fn short_counter_row_is_an_error() {
    let res = parse_net_dev(
      "h\nh\n    lo: 1 2 3\n",
    );
    assert!(res.is_err());
  }
}
