//! Fault-injecting device wrapper for tests
//!
//! [`ScriptedDevice`] forwards every call to an inner device unless the
//! shared [`FaultScript`] says otherwise. The script is cloneable, so a test
//! keeps one handle while the file system owns the device:
//!
//! ```rust
//! use nvmfs::nvm::{FaultScript, Geometry, Op, RamDevice, Scripted, ScriptedDevice};
//!
//! let script = FaultScript::new();
//! let device = ScriptedDevice::new(RamDevice::new(Geometry::default()), script.clone());
//!
//! // Next mount hook fails with -5, later calls pass through
//! script.push(Op::Mount, Scripted::Fail(-5));
//! // Simulate power loss after two more programs/erases
//! script.cut_power_after(2);
//! # drop(device);
//! ```

use super::{Geometry, NvmDevice};
use crate::error::{errno, DeviceError};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Device operation kinds that can be scripted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Init,
    Mount,
    Format,
    Read,
    Write,
    Erase,
}

/// Scripted outcome of one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scripted {
    /// Forward to the inner device
    Pass,
    /// Fail with the given (negative) driver code
    Fail(i32),
    /// Reads only: fill the destination from these bytes instead of the device
    Data(Vec<u8>),
}

#[derive(Debug, Default)]
struct ScriptState {
    queued: HashMap<Op, VecDeque<Scripted>>,
    calls: HashMap<Op, usize>,
    /// Remaining programs/erases before the power goes out
    power_budget: Option<usize>,
    failing_addrs: Vec<u32>,
}

/// Shared control block for a [`ScriptedDevice`]
#[derive(Debug, Clone, Default)]
pub struct FaultScript {
    state: Arc<Mutex<ScriptState>>,
}

impl FaultScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an outcome for the next unscripted call of `op`.
    pub fn push(&self, op: Op, outcome: Scripted) {
        self.state
            .lock()
            .queued
            .entry(op)
            .or_default()
            .push_back(outcome);
    }

    /// Let `n` more writes/erases succeed, then fail every one after that
    /// with `-EIO` until [`restore_power`](Self::restore_power).
    pub fn cut_power_after(&self, n: usize) {
        self.state.lock().power_budget = Some(n);
    }

    pub fn restore_power(&self) {
        self.state.lock().power_budget = None;
    }

    /// Fail every write whose range covers `addr`.
    pub fn fail_writes_at(&self, addr: u32) {
        self.state.lock().failing_addrs.push(addr);
    }

    /// Remove all queued outcomes, address faults and power cuts.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.queued.clear();
        state.failing_addrs.clear();
        state.power_budget = None;
    }

    /// Number of calls of `op` observed so far.
    pub fn calls(&self, op: Op) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    fn next(&self, op: Op, range: Option<(u32, usize)>) -> Scripted {
        let mut state = self.state.lock();
        *state.calls.entry(op).or_default() += 1;

        if let Some(outcome) = state.queued.get_mut(&op).and_then(|q| q.pop_front()) {
            return outcome;
        }

        if matches!(op, Op::Write | Op::Erase) {
            if let Some(budget) = state.power_budget.as_mut() {
                if *budget == 0 {
                    return Scripted::Fail(errno::EIO);
                }
                *budget -= 1;
            }
        }

        if let (Op::Write, Some((addr, len))) = (op, range) {
            let end = addr as u64 + len as u64;
            if state
                .failing_addrs
                .iter()
                .any(|&bad| (bad as u64) >= addr as u64 && (bad as u64) < end)
            {
                return Scripted::Fail(errno::EIO);
            }
        }

        Scripted::Pass
    }
}

/// Device wrapper driven by a [`FaultScript`]
pub struct ScriptedDevice<D> {
    inner: D,
    script: FaultScript,
}

impl<D: NvmDevice> ScriptedDevice<D> {
    pub fn new(inner: D, script: FaultScript) -> Self {
        ScriptedDevice { inner, script }
    }

    pub fn script(&self) -> &FaultScript {
        &self.script
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut D {
        &mut self.inner
    }

    /// Unwrap the device, e.g. to remount it after a simulated power cut.
    pub fn into_inner(self) -> D {
        self.inner
    }
}

fn fail(code: i32) -> DeviceError {
    tracing::trace!("Scripted device failure {}", code);
    DeviceError::Code(code)
}

impl<D: NvmDevice> NvmDevice for ScriptedDevice<D> {
    fn geometry(&self) -> Geometry {
        self.inner.geometry()
    }

    fn init(&mut self) -> Result<(), DeviceError> {
        match self.script.next(Op::Init, None) {
            Scripted::Fail(code) => Err(fail(code)),
            _ => self.inner.init(),
        }
    }

    fn mount(&mut self) -> Result<(), DeviceError> {
        match self.script.next(Op::Mount, None) {
            Scripted::Fail(code) => Err(fail(code)),
            _ => self.inner.mount(),
        }
    }

    fn format(&mut self) -> Result<(), DeviceError> {
        match self.script.next(Op::Format, None) {
            Scripted::Fail(code) => Err(fail(code)),
            _ => self.inner.format(),
        }
    }

    fn read(&mut self, addr: u32, dst: &mut [u8]) -> Result<usize, DeviceError> {
        match self.script.next(Op::Read, Some((addr, dst.len()))) {
            Scripted::Fail(code) => Err(fail(code)),
            Scripted::Data(bytes) => {
                let n = bytes.len().min(dst.len());
                dst[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            Scripted::Pass => self.inner.read(addr, dst),
        }
    }

    fn write(&mut self, addr: u32, src: &[u8]) -> Result<usize, DeviceError> {
        match self.script.next(Op::Write, Some((addr, src.len()))) {
            Scripted::Fail(code) => Err(fail(code)),
            _ => self.inner.write(addr, src),
        }
    }

    fn erase(&mut self, block: u32) -> Result<(), DeviceError> {
        match self.script.next(Op::Erase, None) {
            Scripted::Fail(code) => Err(fail(code)),
            _ => self.inner.erase(block),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvm::RamDevice;

    fn device() -> (ScriptedDevice<RamDevice>, FaultScript) {
        let script = FaultScript::new();
        let dev = ScriptedDevice::new(RamDevice::new(Geometry::new(64, 4, 4)), script.clone());
        (dev, script)
    }

    #[test]
    fn test_passthrough() {
        let (mut dev, script) = device();
        dev.write(10, b"abc").unwrap();

        let mut buf = [0u8; 3];
        dev.read(10, &mut buf).unwrap();
        assert_eq!(&buf, b"abc");
        assert_eq!(script.calls(Op::Write), 1);
        assert_eq!(script.calls(Op::Read), 1);
    }

    #[test]
    fn test_queued_results_are_consumed_in_order() {
        let (mut dev, script) = device();
        script.push(Op::Mount, Scripted::Fail(-5));
        script.push(Op::Mount, Scripted::Pass);

        assert!(matches!(dev.mount(), Err(DeviceError::Code(-5))));
        assert!(dev.mount().is_ok());
        assert!(dev.mount().is_ok());
    }

    #[test]
    fn test_scripted_read_data() {
        let (mut dev, script) = device();
        script.push(Op::Read, Scripted::Data(vec![1, 2, 3]));

        let mut buf = [0u8; 3];
        assert_eq!(dev.read(0, &mut buf).unwrap(), 3);
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn test_short_read_is_an_error() {
        let (mut dev, script) = device();
        script.push(Op::Read, Scripted::Data(vec![1, 2]));

        let mut buf = [0u8; 4];
        assert!(matches!(
            dev.read_exact(8, &mut buf),
            Err(DeviceError::ShortRead {
                addr: 8,
                expected: 4,
                got: 2
            })
        ));

        // The next read goes to the device again
        dev.read_exact(8, &mut buf).unwrap();
        assert_eq!(buf, [0xFF; 4]);
    }

    #[test]
    fn test_power_cut() {
        let (mut dev, script) = device();
        script.cut_power_after(2);

        dev.write(0, &[0]).unwrap();
        dev.erase(1).unwrap();
        assert!(dev.write(1, &[0]).is_err());
        assert!(dev.erase(2).is_err());

        // Reads keep working after the cut
        let mut buf = [0u8; 1];
        dev.read(0, &mut buf).unwrap();

        script.restore_power();
        dev.write(1, &[0]).unwrap();
    }

    #[test]
    fn test_failing_address() {
        let (mut dev, script) = device();
        script.fail_writes_at(130);

        assert!(dev.write(128, &[0u8; 64]).is_err());
        assert!(dev.write(0, &[0u8; 64]).is_ok());
    }
}
