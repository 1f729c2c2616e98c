// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SMBus block transfers, the way the controller is reached over I2C.

use core::cell::RefCell;

use embedded_hal::blocking::i2c::{Write, WriteRead};

use crate::MAX_REGISTER_LEN;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum I2cError {
    /// The underlying bus reported a failure
    Bus,
    /// More bytes than fit in a block transfer
    TooLong(usize),
    /// Device claimed a block longer than was asked for
    Overrun { count: u8 },
}

/// Block reads and writes addressed by register, as SMBus defines them.
///
/// Both return the number of data bytes moved.
pub trait SmbusBlock {
    fn block_read(
        &self,
        addr: u8,
        reg: u8,
        buf: &mut [u8],
    ) -> Result<usize, I2cError>;

    fn block_write(
        &self,
        addr: u8,
        reg: u8,
        data: &[u8],
    ) -> Result<usize, I2cError>;
}

/// SMBus block framing on top of a plain I2C bus.
///
/// A block write sends the register, the byte count and the data.  A block
/// read sends the register, then reads the device's byte count followed by
/// that many data bytes.
pub struct HalSmbus<T> {
    bus: RefCell<T>,
}

impl<T> HalSmbus<T> {
    pub fn new(bus: T) -> Self {
        Self {
            bus: RefCell::new(bus),
        }
    }

    pub fn release(self) -> T {
        self.bus.into_inner()
    }
}

impl<T: Write + WriteRead> SmbusBlock for HalSmbus<T> {
    fn block_read(
        &self,
        addr: u8,
        reg: u8,
        buf: &mut [u8],
    ) -> Result<usize, I2cError> {
        let len = buf.len();

        if len > MAX_REGISTER_LEN {
            return Err(I2cError::TooLong(len));
        }

        let mut raw = [0u8; MAX_REGISTER_LEN + 1];

        self.bus
            .borrow_mut()
            .write_read(addr, &[reg], &mut raw[..len + 1])
            .map_err(|_| I2cError::Bus)?;

        let count = raw[0];

        if usize::from(count) > len {
            return Err(I2cError::Overrun { count });
        }

        let count = usize::from(count);
        buf[..count].copy_from_slice(&raw[1..=count]);
        Ok(count)
    }

    fn block_write(
        &self,
        addr: u8,
        reg: u8,
        data: &[u8],
    ) -> Result<usize, I2cError> {
        let len = data.len();

        if len > MAX_REGISTER_LEN {
            return Err(I2cError::TooLong(len));
        }

        let mut raw = [0u8; MAX_REGISTER_LEN + 2];
        raw[0] = reg;
        raw[1] = len as u8;
        raw[2..len + 2].copy_from_slice(data);

        Write::write(&mut *self.bus.borrow_mut(), addr, &raw[..len + 2])
            .map_err(|_| I2cError::Bus)?;

        Ok(len)
    }
}
