// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Words exchanged with the controller FIFOs.
//!
//! Every transaction is one [`CommandWord`] (plus payload words) pushed into
//! the command FIFO, answered by one [`ReplyWord`] (plus payload words) in
//! the reply FIFO. Payload words carry up to four bytes each, least
//! significant byte first.

use bitfield::bitfield;
use static_assertions::const_assert;

use crate::MAX_PAYLOAD;

// The frame parity field is 16 bits wide: one bit per payload byte.
const_assert!(MAX_PAYLOAD <= 16);

/// Opcodes for the command byte of a [`CommandWord`]. The extended and
/// register commands carry additional bits (a length or a register) in their
/// low bits.
pub mod opcode {
    pub const EXT_WRITE: u8 = 0x00;
    pub const RESET: u8 = 0x10;
    pub const SLEEP: u8 = 0x11;
    pub const SHUTDOWN: u8 = 0x12;
    pub const WAKEUP: u8 = 0x13;
    pub const SLAVE_DESC: u8 = 0x1c;
    pub const EXT_READ: u8 = 0x20;
    pub const EXT_WRITEL: u8 = 0x30;
    pub const EXT_READL: u8 = 0x38;
    pub const WRITE: u8 = 0x40;
    pub const READ: u8 = 0x60;
    pub const ZERO_WRITE: u8 = 0x80;
}

bitfield! {
    /// First word of every transaction.
    #[derive(Copy, Clone, Eq, PartialEq)]
    pub struct CommandWord(u32);
    impl Debug;
    pub u16, extra, set_extra: 31, 16;
    pub active, set_active: 15;
    pub u8, addr, set_addr: 14, 8;
    pub u8, opcode, set_opcode: 7, 0;
}

impl CommandWord {
    pub fn pack(extra: u16, addr: u8, opcode: u8) -> u32 {
        let mut word = CommandWord(0);
        word.set_extra(extra);
        word.set_active(true);
        word.set_addr(addr);
        word.set_opcode(opcode);
        word.0
    }

    pub fn unpack(word: u32) -> Self {
        CommandWord(word)
    }
}

bitfield! {
    /// First word the controller returns for a transaction. `frame_parity`
    /// has one bit set for each payload byte that was received intact.
    #[derive(Copy, Clone, Eq, PartialEq)]
    pub struct ReplyWord(u32);
    impl Debug;
    pub u16, frame_parity, set_frame_parity: 31, 16;
    pub ack, set_ack: 15;
    pub u8, addr, set_addr: 14, 8;
    pub u8, opcode, set_opcode: 7, 0;
}

impl ReplyWord {
    pub fn pack(frame_parity: u16, ack: bool, addr: u8, opcode: u8) -> u32 {
        let mut word = ReplyWord(0);
        word.set_frame_parity(frame_parity);
        word.set_ack(ack);
        word.set_addr(addr);
        word.set_opcode(opcode);
        word.0
    }

    pub fn unpack(word: u32) -> Self {
        ReplyWord(word)
    }
}

bitfield! {
    #[derive(Copy, Clone, Eq, PartialEq)]
    pub struct StatusWord(u32);
    impl Debug;
    pub rx_empty, set_rx_empty: 24;
    pub u8, rx_count, set_rx_count: 23, 16;
    pub tx_empty, set_tx_empty: 8;
    pub u8, tx_count, set_tx_count: 7, 0;
}

/// Packs up to four bytes into a FIFO word. Missing high bytes are zero.
pub fn pack_payload(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .take(4)
        .enumerate()
        .fold(0, |word, (i, &b)| word | u32::from(b) << (i * 8))
}

/// Unpacks the low `out.len()` bytes of a FIFO word.
pub fn unpack_payload(word: u32, out: &mut [u8]) {
    for (i, b) in out.iter_mut().take(4).enumerate() {
        *b = (word >> (i * 8)) as u8;
    }
}

/// Number of FIFO words needed to carry `len` payload bytes.
pub fn payload_words(len: usize) -> usize {
    len.div_ceil(4)
}

/// The frame parity a reply must carry when `len` bytes were requested.
pub fn parity_mask(len: usize) -> u16 {
    ((1u32 << len.min(MAX_PAYLOAD)) - 1) as u16
}
