// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver for the TI TPS6598x family of USB Power Delivery controllers.
//!
//! The controller is reached either over I2C, where its registers are plain
//! SMBus block registers, or over SPMI, where they are paged: register 0
//! selects which register shows through a read window at offset 0x20 and a
//! write window at offset 0xa0.  Over SPMI the device also sleeps until
//! woken, so constructing an SPMI handle wakes it.
//!
//! On top of register access sits the 4CC command mailbox: a four-character
//! command written to CMD1, with its arguments and results in DATA1.

#![cfg_attr(not(test), no_std)]

mod i2c;
pub mod select;

pub use i2c::{HalSmbus, I2cError, SmbusBlock};

use drv_spmi::{Delay, DeviceTree, Reply, SpmiBus, MAX_PAYLOAD};
use ringbuf::{ringbuf, ringbuf_entry};
use select::{Action, Failure, Observation, Policy, State};
use serde::Deserialize;

/// Longest register the driver will move in one access.
pub const MAX_REGISTER_LEN: usize = 64;

/// Width of the interrupt event, mask and clear registers.
pub const IRQ_WIDTH: usize = 9;

/// CMD1 contents after the device rejected a command.
const CMD_INVALID: [u8; 4] = *b"!CMD";

/// Page selected while waiting for the device to wake.
const WAKE_PAGE: u8 = 3;

/// In-page offsets, SPMI only.
const PAGE_SELECT: u8 = 0x00;
const PAGE_WIDTH: u8 = 0x1f;
const READ_WINDOW: u8 = 0x20;
const WRITE_WINDOW: u8 = 0xa0;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Register {
    Mode,
    Cmd1,
    Data1,
    IntEvent1,
    IntEvent2,
    IntMask1,
    IntClear1,
    IntClear2,
    PowerState,
}

impl From<Register> for u8 {
    fn from(r: Register) -> Self {
        match r {
            Register::Mode => 0x03,
            Register::Cmd1 => 0x08,
            Register::Data1 => 0x09,
            Register::IntEvent1 => 0x14,
            Register::IntEvent2 => 0x15,
            Register::IntMask1 => 0x16,
            Register::IntClear1 => 0x18,
            Register::IntClear2 => 0x19,
            Register::PowerState => 0x20,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// SPMI controller error
    Spmi(drv_spmi::Error),
    /// I2C bus error
    I2c(I2cError),
    /// I2C block transfer moved fewer bytes than asked for
    ShortTransfer { reg: u8, expected: usize, got: usize },
    /// Access is longer than any register
    BadLength(usize),
    /// Register is narrower than the requested access
    RegisterTooSmall { reg: u8, size: u8, len: usize },
    /// Page never read back as selected
    SelectTimeout(u8),
    /// Wakeup command was not acknowledged
    WakeNotAcked,
    /// Device never came up on the wake page
    WakeTimeout,
    /// Device answered the command with "!CMD"
    InvalidCommand([u8; 4]),
    /// Command still running after the configured number of polls
    CommandTimeout([u8; 4]),
    /// IRQ state was never filled in by `disable_irqs`
    InvalidIrqState,
    /// Power state is still nonzero after SSPS
    PowerUpFailed { state: u8 },
    /// Operation needs the other transport
    NotSupported,
    /// Device-tree node is missing
    NoNode,
    /// Device-tree node lacks the address property
    NoProperty,
}

impl From<drv_spmi::Error> for Error {
    fn from(e: drv_spmi::Error) -> Self {
        Error::Spmi(e)
    }
}

impl From<I2cError> for Error {
    fn from(e: I2cError) -> Self {
        Error::I2c(e)
    }
}

#[derive(Copy, Clone, PartialEq)]
enum Trace {
    None,
    Wake { addr: u8 },
    WakeFailed(Failure),
    SelectDiverged { page: u8, got: u8 },
    SelectFailed { page: u8, failure: Failure },
    RegisterTooSmall { reg: u8, size: u8, len: usize },
    ShortTransfer { reg: u8, expected: usize, got: usize },
    Command([u8; 4]),
    CommandStatus([u8; 4]),
    InvalidCommand([u8; 4]),
    IrqsDisabled([u8; IRQ_WIDTH]),
    IrqsRestored([u8; IRQ_WIDTH]),
    PowerState(u8),
    PowerUpCommandFailed(Error),
}

ringbuf!(Trace, 32, Trace::None);

/// Tunables, as found in a `[config]` section of the application's TOML.
#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Tps6598xConfig {
    pub select_attempts: u32,
    pub select_readback_attempts: u32,
    pub select_readback_delay_us: u32,
    pub wake_attempts: u32,
    pub wake_delay_ms: u32,
    pub command_poll_delay_us: u32,
    /// Bound on CMD1 polls; commands are waited on forever when absent.
    pub command_poll_limit: Option<u32>,
}

impl Default for Tps6598xConfig {
    fn default() -> Self {
        Self {
            select_attempts: Policy::SELECT.write_attempts,
            select_readback_attempts: Policy::SELECT.readback_attempts,
            select_readback_delay_us: Policy::SELECT.readback_delay_us,
            wake_attempts: Policy::WAKE.write_attempts,
            wake_delay_ms: Policy::WAKE.rewrite_delay_us / 1000,
            command_poll_delay_us: 100,
            command_poll_limit: None,
        }
    }
}

impl Tps6598xConfig {
    fn select_policy(&self) -> Policy {
        Policy {
            write_attempts: self.select_attempts,
            readback_attempts: self.select_readback_attempts,
            readback_delay_us: self.select_readback_delay_us,
            ..Policy::SELECT
        }
    }

    fn wake_policy(&self) -> Policy {
        Policy {
            write_attempts: self.wake_attempts,
            rewrite_delay_us: self.wake_delay_ms.saturating_mul(1000),
            ..Policy::WAKE
        }
    }
}

/// Saved interrupt mask, filled in by [`Tps6598x::disable_irqs`] and put
/// back by [`Tps6598x::restore_irqs`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct IrqState {
    int_mask1: [u8; IRQ_WIDTH],
    valid: bool,
}

impl IrqState {
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn int_mask1(&self) -> &[u8; IRQ_WIDTH] {
        &self.int_mask1
    }
}

/// How the controller is reached. The bus is borrowed: whoever opened it
/// keeps it alive for as long as the driver exists.
#[derive(Copy, Clone)]
pub enum Transport<'a> {
    Spmi(&'a dyn SpmiBus),
    I2c(&'a dyn SmbusBlock),
}

pub struct Tps6598x<'a> {
    transport: Transport<'a>,
    addr: u8,
    delay: &'a dyn Delay,
    config: Tps6598xConfig,
}

impl<'a> Tps6598x<'a> {
    pub fn i2c(
        bus: &'a dyn SmbusBlock,
        addr: u8,
        delay: &'a dyn Delay,
        config: Tps6598xConfig,
    ) -> Self {
        Self {
            transport: Transport::I2c(bus),
            addr,
            delay,
            config,
        }
    }

    /// Opens the controller at slave `addr` and waits for it to wake.
    pub fn spmi(
        bus: &'a dyn SpmiBus,
        addr: u8,
        delay: &'a dyn Delay,
        config: Tps6598xConfig,
    ) -> Result<Self, Error> {
        let dev = Self {
            transport: Transport::Spmi(bus),
            addr,
            delay,
            config,
        };

        dev.wake(bus)?;
        Ok(dev)
    }

    /// Opens an I2C controller whose address is in the node's
    /// `hpm-iic-addr` property.
    pub fn from_node_i2c(
        tree: &dyn DeviceTree,
        node: &str,
        bus: &'a dyn SmbusBlock,
        delay: &'a dyn Delay,
        config: Tps6598xConfig,
    ) -> Result<Self, Error> {
        let addr = node_address(tree, node, "hpm-iic-addr")?;
        Ok(Self::i2c(bus, addr, delay, config))
    }

    /// Opens an SPMI controller whose slave address is the first byte of
    /// the node's `reg` property.
    pub fn from_node_spmi(
        tree: &dyn DeviceTree,
        node: &str,
        bus: &'a dyn SpmiBus,
        delay: &'a dyn Delay,
        config: Tps6598xConfig,
    ) -> Result<Self, Error> {
        let addr = node_address(tree, node, "reg")?;
        Self::spmi(bus, addr, delay, config)
    }

    /// Releases the handle; the bus itself is left alone.
    pub fn shutdown(self) {}

    pub fn transport(&self) -> Transport<'a> {
        self.transport
    }

    pub fn addr(&self) -> u8 {
        self.addr
    }

    fn wake(&self, bus: &dyn SpmiBus) -> Result<(), Error> {
        ringbuf_entry!(Trace::Wake { addr: self.addr });

        if bus.wakeup(self.addr)? != Reply::Ack {
            return Err(Error::WakeNotAcked);
        }

        let policy = self.config.wake_policy();

        self.run_select(bus, &policy, WAKE_PAGE).map_err(|failure| {
            ringbuf_entry!(Trace::WakeFailed(failure));
            match failure {
                Failure::Bus(e) => Error::Spmi(e),
                _ => Error::WakeTimeout,
            }
        })
    }

    /// Selects `page`, retrying until the device reports it.
    fn select(&self, bus: &dyn SpmiBus, page: u8) -> Result<(), Error> {
        let policy = self.config.select_policy();

        self.run_select(bus, &policy, page).map_err(|failure| {
            ringbuf_entry!(Trace::SelectFailed { page, failure });
            match failure {
                Failure::Bus(e) => Error::Spmi(e),
                _ => Error::SelectTimeout(page),
            }
        })
    }

    fn run_select(
        &self,
        bus: &dyn SpmiBus,
        policy: &Policy,
        page: u8,
    ) -> Result<(), Failure> {
        let mut state = State::Idle;
        let mut observation = Observation::Start;

        loop {
            let (next, action) =
                select::transition(policy, page, state, observation);
            state = next;

            observation = match action {
                Action::Write { delay_us } => {
                    if delay_us != 0 {
                        self.delay.delay_us(delay_us);
                    }
                    Observation::Written(bus.reg0_write(self.addr, page))
                }
                Action::Read { delay_us } => {
                    if delay_us != 0 {
                        self.delay.delay_us(delay_us);
                    }
                    let mut got = [0u8];
                    let r = bus.ext_read(self.addr, PAGE_SELECT, &mut got);
                    if r.is_ok() && select::diverged(page, got[0]) {
                        ringbuf_entry!(Trace::SelectDiverged {
                            page,
                            got: got[0]
                        });
                    }
                    Observation::ReadBack(r.map(|_| got[0]))
                }
                Action::Complete(result) => return result,
            };
        }
    }

    fn page_width(&self, bus: &dyn SpmiBus) -> Result<u8, Error> {
        let mut size = [0u8];
        bus.ext_read(self.addr, PAGE_WIDTH, &mut size)?;
        Ok(size[0])
    }

    /// Selects `reg` and makes sure it is at least `len` bytes wide.
    fn select_checked(
        &self,
        bus: &dyn SpmiBus,
        reg: u8,
        len: usize,
    ) -> Result<(), Error> {
        self.select(bus, reg)?;

        let size = self.page_width(bus)?;

        if len > usize::from(size) {
            ringbuf_entry!(Trace::RegisterTooSmall { reg, size, len });
            return Err(Error::RegisterTooSmall { reg, size, len });
        }

        Ok(())
    }

    /// Reads `buf.len()` bytes of register `reg`.
    pub fn read_reg(&self, reg: u8, buf: &mut [u8]) -> Result<(), Error> {
        if buf.len() > MAX_REGISTER_LEN {
            return Err(Error::BadLength(buf.len()));
        }

        match self.transport {
            Transport::I2c(bus) => {
                let got = bus.block_read(self.addr, reg, buf)?;
                self.check_transfer(reg, buf.len(), got)
            }
            Transport::Spmi(bus) => {
                self.select_checked(bus, reg, buf.len())?;

                for (i, chunk) in buf.chunks_mut(MAX_PAYLOAD).enumerate() {
                    let offset = READ_WINDOW + (i * MAX_PAYLOAD) as u8;
                    bus.ext_read(self.addr, offset, chunk)?;
                }

                Ok(())
            }
        }
    }

    /// Writes `data` to register `reg`.
    pub fn write_reg(&self, reg: u8, data: &[u8]) -> Result<(), Error> {
        if data.len() > MAX_REGISTER_LEN {
            return Err(Error::BadLength(data.len()));
        }

        match self.transport {
            Transport::I2c(bus) => {
                let got = bus.block_write(self.addr, reg, data)?;
                self.check_transfer(reg, data.len(), got)
            }
            Transport::Spmi(bus) => {
                self.select_checked(bus, reg, data.len())?;

                for (i, chunk) in data.chunks(MAX_PAYLOAD).enumerate() {
                    let offset = WRITE_WINDOW + (i * MAX_PAYLOAD) as u8;
                    bus.ext_write(self.addr, offset, chunk)?;
                }

                // Selecting the page again is what commits the write.
                self.select(bus, reg)
            }
        }
    }

    fn check_transfer(
        &self,
        reg: u8,
        expected: usize,
        got: usize,
    ) -> Result<(), Error> {
        if got != expected {
            ringbuf_entry!(Trace::ShortTransfer { reg, expected, got });
            return Err(Error::ShortTransfer { reg, expected, got });
        }

        Ok(())
    }

    /// Width of register `reg`, as the device reports it. SPMI only.
    pub fn register_size(&self, reg: u8) -> Result<u8, Error> {
        match self.transport {
            Transport::Spmi(bus) => {
                self.select(bus, reg)?;
                self.page_width(bus)
            }
            Transport::I2c(_) => Err(Error::NotSupported),
        }
    }

    /// Runs a 4CC command: arguments go to DATA1, the command to CMD1, and
    /// CMD1 is polled until the device clears it.  Results, if any, are then
    /// read from DATA1.
    pub fn command(
        &self,
        cmd: &[u8; 4],
        data_in: &[u8],
        data_out: &mut [u8],
    ) -> Result<(), Error> {
        ringbuf_entry!(Trace::Command(*cmd));

        if !data_in.is_empty() {
            self.write_reg(Register::Data1.into(), data_in)?;
        }

        self.write_reg(Register::Cmd1.into(), cmd)?;

        let mut polls = 0u32;

        loop {
            let mut status = [0u8; 4];
            self.read_reg(Register::Cmd1.into(), &mut status)?;

            match status {
                [0, 0, 0, 0] => break,
                CMD_INVALID => {
                    ringbuf_entry!(Trace::InvalidCommand(*cmd));
                    return Err(Error::InvalidCommand(*cmd));
                }
                status => {
                    ringbuf_entry!(Trace::CommandStatus(status));
                }
            }

            polls += 1;

            if let Some(limit) = self.config.command_poll_limit {
                if polls >= limit {
                    return Err(Error::CommandTimeout(*cmd));
                }
            }

            self.delay.delay_us(self.config.command_poll_delay_us);
        }

        if !data_out.is_empty() {
            self.read_reg(Register::Data1.into(), data_out)?;
        }

        Ok(())
    }

    /// Saves the interrupt mask into `state`, acknowledges everything
    /// pending and masks all interrupts.
    pub fn disable_irqs(&self, state: &mut IrqState) -> Result<(), Error> {
        self.read_reg(Register::IntMask1.into(), &mut state.int_mask1)?;
        state.valid = true;

        ringbuf_entry!(Trace::IrqsDisabled(state.int_mask1));

        self.write_reg(Register::IntClear1.into(), &[0xff; IRQ_WIDTH])?;
        self.write_reg(Register::IntMask1.into(), &[0; IRQ_WIDTH])
    }

    /// Puts back the mask saved by [`disable_irqs`](Self::disable_irqs).
    pub fn restore_irqs(&self, state: &IrqState) -> Result<(), Error> {
        if !state.valid {
            return Err(Error::InvalidIrqState);
        }

        ringbuf_entry!(Trace::IrqsRestored(state.int_mask1));

        self.write_reg(Register::IntMask1.into(), &state.int_mask1)
    }

    fn power_state(&self) -> Result<u8, Error> {
        let mut state = [0u8];
        self.read_reg(Register::PowerState.into(), &mut state)?;
        ringbuf_entry!(Trace::PowerState(state[0]));
        Ok(state[0])
    }

    /// Brings the controller to the S0 power state.
    pub fn power_up(&self) -> Result<(), Error> {
        if self.power_state()? == 0 {
            return Ok(());
        }

        // Whether this worked is decided by reading the state back.
        if let Err(e) = self.command(b"SSPS", &[0], &mut []) {
            ringbuf_entry!(Trace::PowerUpCommandFailed(e));
        }

        match self.power_state()? {
            0 => Ok(()),
            state => Err(Error::PowerUpFailed { state }),
        }
    }

    /// Current operating mode, e.g. `b"APP "`.
    pub fn mode(&self) -> Result<[u8; 4], Error> {
        let mut mode = [0u8; 4];
        self.read_reg(Register::Mode.into(), &mut mode)?;
        Ok(mode)
    }

    /// Reads the pending interrupt events from both event registers and
    /// clears exactly those. INT_EVENT1 fills the first half.
    pub fn ack_events(&self) -> Result<[u8; 2 * IRQ_WIDTH], Error> {
        let mut events = [0u8; 2 * IRQ_WIDTH];
        let (first, second) = events.split_at_mut(IRQ_WIDTH);

        for (event, clear, buf) in [
            (Register::IntEvent1, Register::IntClear1, first),
            (Register::IntEvent2, Register::IntClear2, second),
        ] {
            self.read_reg(event.into(), buf)?;
            self.write_reg(clear.into(), buf)?;
        }

        Ok(events)
    }
}

fn node_address(
    tree: &dyn DeviceTree,
    node: &str,
    property: &str,
) -> Result<u8, Error> {
    if !tree.has_node(node) {
        return Err(Error::NoNode);
    }

    match tree.property(node, property) {
        Some([addr, ..]) => Ok(*addr),
        _ => Err(Error::NoProperty),
    }
}
