// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver for a FIFO-based SPMI host controller
//!
//! The controller exposes three registers: a status register describing both
//! FIFOs, a write-only command FIFO and a read-only reply FIFO.  Every bus
//! transaction is framed the same way:
//!
//! 1. one [`frame::CommandWord`] carrying the slave address, the opcode and a
//!    16-bit "extra" field (usually a register address);
//! 2. zero or more payload words for writes;
//! 3. one [`frame::ReplyWord`] echoing the opcode and address, with the ACK
//!    bit and a frame parity field;
//! 4. zero or more payload words for reads.
//!
//! The driver keeps no state between transactions; everything lives in the
//! hardware FIFOs.  Callers must serialize access to a given controller.
//!
//! Device drivers sitting on the bus are written against the [`SpmiBus`]
//! trait rather than [`Spmi`] itself: only [`SpmiBus::raw_command`] talks to
//! hardware, and every other bus command is built on top of it.

#![cfg_attr(not(test), no_std)]

pub mod frame;

use frame::{opcode, CommandWord, ReplyWord, StatusWord};
use ringbuf::*;
use serde::Deserialize;

const STATUS: usize = 0x00;
const CMD: usize = 0x04;
const REPLY: usize = 0x08;

/// Largest valid slave address; addresses are 4 bits on the wire.
pub const MAX_ADDR: u8 = 0xf;

/// Largest payload for the extended commands, in either direction.
pub const MAX_PAYLOAD: usize = 16;

/// Largest payload for the extended "long" commands.
pub const MAX_LONG_PAYLOAD: usize = 8;

/// Largest value that fits in a register 0 write.
pub const MAX_REG0_VALUE: u8 = 0x7f;

/// Largest register reachable with the short register commands.
pub const MAX_SHORT_REG: u8 = 0x1f;

/// Size of the descriptor returned by [`SpmiBus::slave_descriptor`].
pub const SLAVE_DESC_LEN: usize = 10;

/// 32-bit access to the controller's registers, relative to its base.
///
/// Writes must have taken effect when the call returns, and accesses must
/// not be reordered with respect to each other.
pub trait Registers {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);
}

impl<T: Registers + ?Sized> Registers for &T {
    fn read32(&self, offset: usize) -> u32 {
        (**self).read32(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        (**self).write32(offset, value)
    }
}

/// Busy-wait delays. Implementations must not return early.
pub trait Delay {
    fn delay_us(&self, us: u32);

    fn delay_ms(&self, ms: u32) {
        for _ in 0..ms {
            self.delay_us(1000);
        }
    }
}

impl<T: Delay + ?Sized> Delay for &T {
    fn delay_us(&self, us: u32) {
        (**self).delay_us(us)
    }

    fn delay_ms(&self, ms: u32) {
        (**self).delay_ms(ms)
    }
}

/// Resolution of hardware nodes into addresses and properties, as done by
/// whatever parses the platform's device tree.
pub trait DeviceTree {
    fn has_node(&self, node: &str) -> bool;

    /// Base address of the `index`th entry in the node's `reg` property.
    fn reg_base(&self, node: &str, index: usize) -> Option<usize>;

    /// Raw contents of a named property.
    fn property(&self, node: &str, name: &str) -> Option<&[u8]>;
}

/// Memory-mapped controller registers.
pub struct Mmio {
    base: usize,
}

impl Mmio {
    /// # Safety
    ///
    /// `base` must be the address of an SPMI controller register block,
    /// mapped as device memory for as long as the `Mmio` exists, and not
    /// accessed through any other path in the meantime.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    fn cell(&self, offset: usize) -> &vcell::VolatileCell<u32> {
        // Safety: the contract on `new` makes every register offset within
        // the block a valid, exclusively owned device word.
        unsafe { &*((self.base + offset) as *const vcell::VolatileCell<u32>) }
    }
}

impl Registers for Mmio {
    fn read32(&self, offset: usize) -> u32 {
        self.cell(offset).get()
    }

    fn write32(&self, offset: usize, value: u32) {
        self.cell(offset).set(value)
    }
}

/// Tunables, as found in a `[config]` section of the application's TOML.
#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct SpmiConfig {
    /// Number of times the reply FIFO is polled before giving up on a word.
    pub rx_attempts: u32,
    /// Delay between two polls of the reply FIFO.
    pub rx_delay_us: u32,
}

impl Default for SpmiConfig {
    fn default() -> Self {
        Self {
            rx_attempts: 100,
            rx_delay_us: 100,
        }
    }
}

/// Outcome of a transaction that made it through the controller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Reply {
    /// The addressed slave acknowledged the command.
    Ack,
    /// The command completed, but the slave did not acknowledge it.
    Nack,
}

impl Reply {
    pub fn is_ack(self) -> bool {
        self == Reply::Ack
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// Slave address does not fit in 4 bits
    BadAddress(u8),
    /// Payload length out of range for the command
    BadLength(usize),
    /// Value does not fit in a register 0 write
    BadRegister0Value(u8),
    /// Register out of range for the short register commands
    BadRegister(u8),
    /// Command FIFO still holds words from an earlier transaction
    TxBusy,
    /// Reply FIFO stayed empty for the whole polling budget
    RxTimeout,
    /// Reply does not echo the opcode and address that were sent
    ReplyMismatch { reply: u32 },
    /// Frame parity disagrees with the number of bytes requested
    Parity { expected: u16, got: u16 },
    /// Hardware node could not be found
    NoNode,
    /// Hardware node has no usable register range
    NoRegs,
}

impl Error {
    /// Parity failures are the only ones worth retrying as-is: everything
    /// else is either a caller error or leaves the FIFOs in an unknown
    /// state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Parity { .. })
    }
}

#[derive(Copy, Clone, PartialEq)]
enum Trace {
    None,
    BadAddress(u8),
    BadLength(usize),
    TxBusy(u32),
    Leftover(u32),
    Command { addr: u8, opcode: u8, extra: u16 },
    RxTimeout,
    ReplyMismatch { sent: u32, reply: u32 },
    Parity { expected: u16, got: u16 },
    Nack { addr: u8, opcode: u8 },
}

ringbuf!(Trace, 32, Trace::None);

/// Commands understood by SPMI slaves.
///
/// Only [`raw_command`](Self::raw_command) needs implementing; the provided
/// methods validate their arguments, encode the opcode and forward to it.
pub trait SpmiBus {
    /// Runs one transaction against slave `addr`: sends the command and
    /// `data_in`, then fills `data_out` from the reply.
    fn raw_command(
        &self,
        addr: u8,
        cmd: u8,
        extra: u16,
        data_in: &[u8],
        data_out: &mut [u8],
    ) -> Result<Reply, Error>;

    fn reset(&self, addr: u8) -> Result<Reply, Error> {
        self.raw_command(addr, opcode::RESET, 0, &[], &mut [])
    }

    fn sleep(&self, addr: u8) -> Result<Reply, Error> {
        self.raw_command(addr, opcode::SLEEP, 0, &[], &mut [])
    }

    fn shutdown(&self, addr: u8) -> Result<Reply, Error> {
        self.raw_command(addr, opcode::SHUTDOWN, 0, &[], &mut [])
    }

    fn wakeup(&self, addr: u8) -> Result<Reply, Error> {
        self.raw_command(addr, opcode::WAKEUP, 0, &[], &mut [])
    }

    /// Writes register 0. The value travels both in the low opcode bits
    /// and in the high byte of the extra field.
    fn reg0_write(&self, addr: u8, value: u8) -> Result<Reply, Error> {
        if value > MAX_REG0_VALUE {
            return Err(Error::BadRegister0Value(value));
        }

        let extra = u16::from(value) << 8;
        self.raw_command(addr, opcode::ZERO_WRITE | value, extra, &[], &mut [])
    }

    fn reg_read(&self, addr: u8, reg: u8) -> Result<u8, Error> {
        if reg > MAX_SHORT_REG {
            return Err(Error::BadRegister(reg));
        }

        let mut value = [0u8];
        let cmd = opcode::READ | reg;
        self.raw_command(addr, cmd, reg.into(), &[], &mut value)?;
        Ok(value[0])
    }

    fn reg_write(&self, addr: u8, reg: u8, value: u8) -> Result<Reply, Error> {
        if reg > MAX_SHORT_REG {
            return Err(Error::BadRegister(reg));
        }

        let extra = u16::from(reg) | u16::from(value) << 8;
        self.raw_command(addr, opcode::WRITE | reg, extra, &[], &mut [])
    }

    fn ext_read(
        &self,
        addr: u8,
        reg: u8,
        buf: &mut [u8],
    ) -> Result<Reply, Error> {
        let len = encoded_len(buf.len(), MAX_PAYLOAD)?;
        self.raw_command(addr, opcode::EXT_READ | len, reg.into(), &[], buf)
    }

    fn ext_write(
        &self,
        addr: u8,
        reg: u8,
        data: &[u8],
    ) -> Result<Reply, Error> {
        let len = encoded_len(data.len(), MAX_PAYLOAD)?;
        let cmd = opcode::EXT_WRITE | len;
        self.raw_command(addr, cmd, reg.into(), data, &mut [])
    }

    fn ext_read_long(
        &self,
        addr: u8,
        reg: u16,
        buf: &mut [u8],
    ) -> Result<Reply, Error> {
        let len = encoded_len(buf.len(), MAX_LONG_PAYLOAD)?;
        self.raw_command(addr, opcode::EXT_READL | len, reg, &[], buf)
    }

    fn ext_write_long(
        &self,
        addr: u8,
        reg: u16,
        data: &[u8],
    ) -> Result<Reply, Error> {
        let len = encoded_len(data.len(), MAX_LONG_PAYLOAD)?;
        self.raw_command(addr, opcode::EXT_WRITEL | len, reg, data, &mut [])
    }

    fn slave_descriptor(
        &self,
        addr: u8,
    ) -> Result<[u8; SLAVE_DESC_LEN], Error> {
        let mut desc = [0u8; SLAVE_DESC_LEN];
        self.raw_command(addr, opcode::SLAVE_DESC, 0, &[], &mut desc)?;
        Ok(desc)
    }
}

/// Extended commands encode their length minus one in the low opcode bits.
fn encoded_len(len: usize, max: usize) -> Result<u8, Error> {
    if len == 0 || len > max {
        ringbuf_entry!(Trace::BadLength(len));
        return Err(Error::BadLength(len));
    }

    Ok((len - 1) as u8)
}

pub struct Spmi<R, D> {
    regs: R,
    delay: D,
    config: SpmiConfig,
}

impl<R: Registers, D: Delay> Spmi<R, D> {
    pub fn new(regs: R, delay: D) -> Self {
        Self::with_config(regs, delay, SpmiConfig::default())
    }

    pub fn with_config(regs: R, delay: D, config: SpmiConfig) -> Self {
        Self {
            regs,
            delay,
            config,
        }
    }

    pub fn config(&self) -> &SpmiConfig {
        &self.config
    }

    /// Gives up the controller, handing back its registers. Nothing is
    /// sent on the bus.
    pub fn release(self) -> R {
        self.regs
    }

    fn status(&self) -> StatusWord {
        StatusWord(self.regs.read32(STATUS))
    }

    /// Discards whatever an earlier, desynchronized transaction left in the
    /// reply FIFO.
    fn drain_rx(&self) {
        while !self.status().rx_empty() {
            let word = self.regs.read32(REPLY);
            ringbuf_entry!(Trace::Leftover(word));
        }
    }

    fn read_rx(&self) -> Result<u32, Error> {
        for _ in 0..self.config.rx_attempts {
            if !self.status().rx_empty() {
                return Ok(self.regs.read32(REPLY));
            }

            self.delay.delay_us(self.config.rx_delay_us);
        }

        ringbuf_entry!(Trace::RxTimeout);
        Err(Error::RxTimeout)
    }
}

impl<D: Delay> Spmi<Mmio, D> {
    /// Opens the controller described by `node`.
    ///
    /// # Safety
    ///
    /// The node's first register range must describe an SPMI controller
    /// that nothing else is driving; see [`Mmio::new`].
    pub unsafe fn from_node(
        tree: &dyn DeviceTree,
        node: &str,
        delay: D,
        config: SpmiConfig,
    ) -> Result<Self, Error> {
        if !tree.has_node(node) {
            return Err(Error::NoNode);
        }

        let base = tree.reg_base(node, 0).ok_or(Error::NoRegs)?;

        Ok(Self::with_config(Mmio::new(base), delay, config))
    }
}

impl<R: Registers, D: Delay> SpmiBus for Spmi<R, D> {
    fn raw_command(
        &self,
        addr: u8,
        cmd: u8,
        extra: u16,
        data_in: &[u8],
        data_out: &mut [u8],
    ) -> Result<Reply, Error> {
        if addr > MAX_ADDR {
            ringbuf_entry!(Trace::BadAddress(addr));
            return Err(Error::BadAddress(addr));
        }

        for len in [data_in.len(), data_out.len()] {
            if len > MAX_PAYLOAD {
                ringbuf_entry!(Trace::BadLength(len));
                return Err(Error::BadLength(len));
            }
        }

        let status = self.status();

        if !status.tx_empty() {
            ringbuf_entry!(Trace::TxBusy(status.0));
            return Err(Error::TxBusy);
        }

        self.drain_rx();

        ringbuf_entry!(Trace::Command {
            addr,
            opcode: cmd,
            extra
        });

        let sent = CommandWord::pack(extra, addr, cmd);
        self.regs.write32(CMD, sent);

        for chunk in data_in.chunks(4) {
            self.regs.write32(CMD, frame::pack_payload(chunk));
        }

        let reply = ReplyWord::unpack(self.read_rx()?);

        if reply.opcode() != cmd || reply.addr() != addr {
            ringbuf_entry!(Trace::ReplyMismatch {
                sent,
                reply: reply.0
            });
            return Err(Error::ReplyMismatch { reply: reply.0 });
        }

        for chunk in data_out.chunks_mut(4) {
            let word = self.read_rx()?;
            frame::unpack_payload(word, chunk);
        }

        let expected = frame::parity_mask(data_out.len());

        if reply.frame_parity() != expected {
            let got = reply.frame_parity();
            ringbuf_entry!(Trace::Parity { expected, got });
            return Err(Error::Parity { expected, got });
        }

        if reply.ack() {
            Ok(Reply::Ack)
        } else {
            ringbuf_entry!(Trace::Nack { addr, opcode: cmd });
            Ok(Reply::Nack)
        }
    }
}
