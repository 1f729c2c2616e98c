// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The PD driver on top of the real SPMI controller driver, with only the
//! controller's register block and the device behind it simulated.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};

use drv_spmi::frame::{self, opcode, CommandWord, ReplyWord, StatusWord};
use drv_spmi::{Delay, Registers, Spmi};
use drv_tps6598x::{IrqState, Tps6598x, Tps6598xConfig};

const STATUS: usize = 0x00;
const CMD: usize = 0x04;
const REPLY: usize = 0x08;

const HPM: u8 = 0xe;

/// Register-level model of the controller: paged registers, with writes
/// staged until the page is selected again.
struct Device {
    page: Cell<u8>,
    regs: RefCell<HashMap<u8, Vec<u8>>>,
    staged: RefCell<Option<Vec<u8>>>,
    /// Register 0 readbacks to deliver with bad parity.
    corrupt_readbacks: Cell<u32>,
}

impl Device {
    fn new() -> Self {
        Self {
            page: Cell::new(0),
            regs: RefCell::new(HashMap::from([
                (0x03, b"APP ".to_vec()),
                (0x08, vec![0; 4]),
                (0x09, vec![0; 64]),
                (0x16, vec![0x0f; 11]),
                (0x18, vec![0; 11]),
                (0x20, vec![3]),
            ])),
            staged: RefCell::new(None),
            corrupt_readbacks: Cell::new(0),
        }
    }

    fn reg(&self, reg: u8) -> Vec<u8> {
        self.regs.borrow()[&reg].clone()
    }

    fn select(&self, page: u8) {
        if let Some(value) = self.staged.borrow_mut().take() {
            if page == self.page.get() {
                self.commit(page, value);
            }
        }
        self.page.set(page);
    }

    fn commit(&self, page: u8, value: Vec<u8>) {
        if page != 0x08 {
            self.regs.borrow_mut().insert(page, value);
            return;
        }

        let status = match &value[..] {
            b"SSPS" => {
                let state = self.reg(0x09)[0];
                self.regs.borrow_mut().insert(0x20, vec![state]);
                [0; 4]
            }
            _ => *b"!CMD",
        };
        self.regs.borrow_mut().insert(0x08, status.to_vec());
    }

    /// Runs one transaction; returns the frame parity and the read data.
    fn transact(&self, cmd: CommandWord, data_in: &[u8]) -> (u16, Vec<u8>) {
        let op = cmd.opcode();
        let offset = cmd.extra() as u8;

        if op == opcode::WAKEUP {
            return (0, vec![]);
        }

        if op & opcode::ZERO_WRITE != 0 {
            self.select(op & 0x7f);
            return (0, vec![]);
        }

        match op & 0xf0 {
            opcode::EXT_READ => {
                let len = usize::from(op & 0xf) + 1;
                let page = self.page.get();
                let out = match offset {
                    0x00 => vec![page],
                    0x1f => vec![self.reg(page).len() as u8],
                    _ => {
                        let start = usize::from(offset - 0x20);
                        self.reg(page)[start..start + len].to_vec()
                    }
                };

                let mut parity = frame::parity_mask(len);
                if offset == 0 && self.corrupt_readbacks.get() > 0 {
                    let left = self.corrupt_readbacks.get();
                    self.corrupt_readbacks.set(left - 1);
                    parity = 0;
                }
                (parity, out)
            }
            opcode::EXT_WRITE => {
                let page = self.page.get();
                let start = usize::from(offset - 0xa0);
                let mut staged = self.staged.borrow_mut();
                let value = staged.get_or_insert_with(|| self.reg(page));
                value[start..start + data_in.len()].copy_from_slice(data_in);
                (0, vec![])
            }
            _ => panic!("unexpected opcode {op:#x}"),
        }
    }
}

/// The controller's FIFOs in front of a [`Device`].
struct Controller {
    device: Device,
    tx: RefCell<Vec<u32>>,
    rx: RefCell<VecDeque<u32>>,
}

impl Controller {
    fn new(device: Device) -> Self {
        Self {
            device,
            tx: RefCell::new(vec![]),
            rx: RefCell::new(VecDeque::new()),
        }
    }

    fn run(&self) {
        let words: Vec<u32> = self.tx.borrow_mut().drain(..).collect();
        let Some((&first, payload)) = words.split_first() else {
            return;
        };

        let cmd = CommandWord::unpack(first);
        assert!(cmd.active());

        let mut data_in = vec![];
        for &word in payload {
            data_in.extend_from_slice(&word.to_le_bytes());
        }
        if cmd.opcode() & 0xf0 == opcode::EXT_WRITE {
            data_in.truncate(usize::from(cmd.opcode() & 0xf) + 1);
        }

        let (parity, data_out) = self.device.transact(cmd, &data_in);

        let mut rx = self.rx.borrow_mut();
        rx.push_back(ReplyWord::pack(parity, true, cmd.addr(), cmd.opcode()));
        rx.extend(data_out.chunks(4).map(frame::pack_payload));
    }
}

impl Registers for Controller {
    fn read32(&self, offset: usize) -> u32 {
        match offset {
            STATUS => {
                self.run();
                let mut status = StatusWord(0);
                status.set_tx_empty(true);
                status.set_rx_empty(self.rx.borrow().is_empty());
                status.set_rx_count(self.rx.borrow().len() as u8);
                status.0
            }
            REPLY => self.rx.borrow_mut().pop_front().unwrap(),
            _ => panic!("bad offset {offset:#x}"),
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        assert_eq!(offset, CMD);
        self.tx.borrow_mut().push(value);
    }
}

struct Spin;

impl Delay for Spin {
    fn delay_us(&self, _us: u32) {}
}

#[test]
fn bring_up_over_spmi() {
    let controller = Controller::new(Device::new());
    let spmi = Spmi::new(&controller, Spin);

    let hpm =
        Tps6598x::spmi(&spmi, HPM, &Spin, Tps6598xConfig::default()).unwrap();

    assert_eq!(hpm.mode(), Ok(*b"APP "));

    assert_eq!(hpm.power_up(), Ok(()));
    assert_eq!(controller.device.reg(0x20), [0]);

    let mut irqs = IrqState::default();
    hpm.disable_irqs(&mut irqs).unwrap();
    assert_eq!(irqs.int_mask1(), &[0x0f; 9]);
    assert_eq!(&controller.device.reg(0x16)[..9], &[0; 9]);
    assert_eq!(&controller.device.reg(0x18)[..9], &[0xff; 9]);

    hpm.restore_irqs(&irqs).unwrap();
    assert_eq!(controller.device.reg(0x16), [0x0f; 11]);

    hpm.shutdown();
    spmi.release();
}

#[test]
fn parity_errors_during_select_are_absorbed() {
    let controller = Controller::new(Device::new());
    let spmi = Spmi::new(&controller, Spin);
    let hpm = Tps6598x::spmi(&spmi, HPM, &Spin, Default::default()).unwrap();

    controller.device.corrupt_readbacks.set(3);
    assert_eq!(hpm.mode(), Ok(*b"APP "));
    assert_eq!(controller.device.corrupt_readbacks.get(), 0);
}

#[test]
fn long_register_round_trip() {
    let controller = Controller::new(Device::new());
    let spmi = Spmi::new(&controller, Spin);
    let hpm = Tps6598x::spmi(&spmi, HPM, &Spin, Default::default()).unwrap();

    let data: Vec<u8> = (0..50).map(|i| i * 3).collect();
    hpm.write_reg(0x09, &data).unwrap();

    let mut back = [0u8; 50];
    hpm.read_reg(0x09, &mut back).unwrap();
    assert_eq!(&back[..], &data[..]);
}

#[test]
fn rejected_command_reaches_the_caller() {
    let controller = Controller::new(Device::new());
    let spmi = Spmi::new(&controller, Spin);
    let hpm = Tps6598x::spmi(&spmi, HPM, &Spin, Default::default()).unwrap();

    assert_eq!(
        hpm.command(b"NOPE", &[], &mut []),
        Err(drv_tps6598x::Error::InvalidCommand(*b"NOPE"))
    );
}
