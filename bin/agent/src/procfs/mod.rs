//! Readers over the proc pseudo-filesystem. Each reader returns a
//! fresh snapshot per call; parse failures surface to the caller
//! and are never fatal to the process.

mod cpu;
mod loadavg;
mod meminfo;
mod net_dev;

pub use cpu::{CpuStatReader, CpuStats, CpuTimes};
pub use loadavg::{LoadAverage, LoadAvgReader, RunningProcsReader};
pub use meminfo::{MemInfo, MemInfoReader};
pub use net_dev::NetDevReader;
