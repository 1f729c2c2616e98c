// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Page selection over SPMI.
//!
//! Selecting a page is a register 0 write followed by reading register 0
//! back until the device reports the page.  The write being acknowledged
//! does not mean the device has latched the page yet: until it has, reads
//! return the page with bit 7 set, or fail parity outright.  The same
//! sequence, with a different retry policy, is used to wait for the device
//! to come out of sleep.
//!
//! Everything here is pure: [`transition`] consumes what the bus reported
//! and says what to do next, leaving the bus and the delays to the caller.

use drv_spmi::{Error as SpmiError, Reply};

/// Retry budgets for one selection.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Policy {
    /// Register 0 writes to issue before giving up.
    pub write_attempts: u32,
    /// Readbacks per write before writing again.
    pub readback_attempts: u32,
    /// Delay before each readback after the first.
    pub readback_delay_us: u32,
    /// Delay before writing again after the readbacks were exhausted or the
    /// device reported another page.
    pub rewrite_delay_us: u32,
}

impl Policy {
    /// Register selection: a handful of writes, with plenty of time for
    /// each one to latch.
    pub const SELECT: Self = Self {
        write_attempts: 5,
        readback_attempts: 50,
        readback_delay_us: 100,
        rewrite_delay_us: 0,
    };

    /// Wake handshake: one readback per write, a millisecond apart.
    pub const WAKE: Self = Self {
        write_attempts: 50,
        readback_attempts: 1,
        readback_delay_us: 0,
        rewrite_delay_us: 1000,
    };
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum State {
    Idle,
    AwaitingAck { write: u32 },
    AwaitingReadback { write: u32, read: u32 },
    Done,
    Failed(Failure),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Failure {
    /// Every write and readback was spent without seeing the page.
    Exhausted,
    /// The bus failed in a way that retrying will not fix.
    Bus(SpmiError),
    /// An observation arrived that the state was not waiting for.
    OutOfOrder,
}

/// What the caller saw since the last action.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Observation {
    Start,
    /// Result of the register 0 write.
    Written(Result<Reply, SpmiError>),
    /// Result of reading register 0 back.
    ReadBack(Result<u8, SpmiError>),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Action {
    /// Wait, then write the page to register 0.
    Write { delay_us: u32 },
    /// Wait, then read register 0.
    Read { delay_us: u32 },
    Complete(Result<(), Failure>),
}

/// Steps the selection of `page`.
pub fn transition(
    policy: &Policy,
    page: u8,
    state: State,
    observation: Observation,
) -> (State, Action) {
    use Observation::*;

    match (state, observation) {
        (State::Idle, Start) => {
            (State::AwaitingAck { write: 1 }, Action::Write { delay_us: 0 })
        }

        (State::AwaitingAck { write }, Written(Ok(Reply::Ack))) => (
            State::AwaitingReadback { write, read: 1 },
            Action::Read { delay_us: 0 },
        ),
        (State::AwaitingAck { write }, Written(Ok(Reply::Nack))) => {
            rewrite(policy, write, 0)
        }
        (State::AwaitingAck { .. }, Written(Err(e))) => fail(Failure::Bus(e)),

        (State::AwaitingReadback { write, read }, ReadBack(Err(e))) => {
            if e.is_retryable() {
                reread(policy, write, read)
            } else {
                fail(Failure::Bus(e))
            }
        }
        (State::AwaitingReadback { write, read }, ReadBack(Ok(got))) => {
            if got == page {
                (State::Done, Action::Complete(Ok(())))
            } else if diverged(page, got) {
                rewrite(policy, write, policy.rewrite_delay_us)
            } else {
                reread(policy, write, read)
            }
        }

        (State::Done, _) => (State::Done, Action::Complete(Ok(()))),
        (State::Failed(f), _) => (State::Failed(f), Action::Complete(Err(f))),

        _ => fail(Failure::OutOfOrder),
    }
}

/// True when a readback names a different page altogether, rather than the
/// requested one still latching.
pub fn diverged(page: u8, got: u8) -> bool {
    got & 0x7f != page
}

fn reread(policy: &Policy, write: u32, read: u32) -> (State, Action) {
    if read < policy.readback_attempts {
        (
            State::AwaitingReadback {
                write,
                read: read + 1,
            },
            Action::Read {
                delay_us: policy.readback_delay_us,
            },
        )
    } else {
        rewrite(policy, write, policy.rewrite_delay_us)
    }
}

fn rewrite(policy: &Policy, write: u32, delay_us: u32) -> (State, Action) {
    if write < policy.write_attempts {
        (
            State::AwaitingAck { write: write + 1 },
            Action::Write { delay_us },
        )
    } else {
        fail(Failure::Exhausted)
    }
}

fn fail(failure: Failure) -> (State, Action) {
    (State::Failed(failure), Action::Complete(Err(failure)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARITY: SpmiError = SpmiError::Parity {
        expected: 1,
        got: 0,
    };

    fn step(state: State, observation: Observation) -> (State, Action) {
        transition(&Policy::SELECT, 0x14, state, observation)
    }

    #[test]
    fn happy_path() {
        let (s, a) = step(State::Idle, Observation::Start);
        assert_eq!(a, Action::Write { delay_us: 0 });

        let (s, a) = step(s, Observation::Written(Ok(Reply::Ack)));
        assert_eq!(s, State::AwaitingReadback { write: 1, read: 1 });
        assert_eq!(a, Action::Read { delay_us: 0 });

        let (s, a) = step(s, Observation::ReadBack(Ok(0x14)));
        assert_eq!(s, State::Done);
        assert_eq!(a, Action::Complete(Ok(())));
    }

    #[test]
    fn nack_writes_again_immediately() {
        let (s, a) = step(
            State::AwaitingAck { write: 2 },
            Observation::Written(Ok(Reply::Nack)),
        );
        assert_eq!(s, State::AwaitingAck { write: 3 });
        assert_eq!(a, Action::Write { delay_us: 0 });
    }

    #[test]
    fn write_failure_is_final() {
        let e = SpmiError::TxBusy;
        let (s, a) =
            step(State::AwaitingAck { write: 1 }, Observation::Written(Err(e)));
        assert_eq!(s, State::Failed(Failure::Bus(e)));
        assert_eq!(a, Action::Complete(Err(Failure::Bus(e))));

        // and stays that way
        let (_, a) = step(s, Observation::Start);
        assert_eq!(a, Action::Complete(Err(Failure::Bus(e))));
    }

    #[test]
    fn parity_and_latching_read_again() {
        let s = State::AwaitingReadback { write: 1, read: 1 };

        let (s, a) = step(s, Observation::ReadBack(Err(PARITY)));
        assert_eq!(s, State::AwaitingReadback { write: 1, read: 2 });
        assert_eq!(a, Action::Read { delay_us: 100 });

        let (s, a) = step(s, Observation::ReadBack(Ok(0x94)));
        assert_eq!(s, State::AwaitingReadback { write: 1, read: 3 });
        assert_eq!(a, Action::Read { delay_us: 100 });
    }

    #[test]
    fn divergence_writes_again() {
        let s = State::AwaitingReadback { write: 1, read: 7 };
        let (s, a) = step(s, Observation::ReadBack(Ok(0x03)));
        assert_eq!(s, State::AwaitingAck { write: 2 });
        assert_eq!(a, Action::Write { delay_us: 0 });
    }

    #[test]
    fn other_read_errors_are_final() {
        let s = State::AwaitingReadback { write: 1, read: 1 };
        let (s, _) = step(s, Observation::ReadBack(Err(SpmiError::RxTimeout)));
        assert_eq!(s, State::Failed(Failure::Bus(SpmiError::RxTimeout)));
    }

    #[test]
    fn budgets_run_out() {
        // Last readback of a write moves on to the next write...
        let s = State::AwaitingReadback { write: 4, read: 50 };
        let (s, _) = step(s, Observation::ReadBack(Ok(0x94)));
        assert_eq!(s, State::AwaitingAck { write: 5 });

        // ...unless that was the last write.
        let s = State::AwaitingReadback { write: 5, read: 50 };
        let (s, a) = step(s, Observation::ReadBack(Err(PARITY)));
        assert_eq!(s, State::Failed(Failure::Exhausted));
        assert_eq!(a, Action::Complete(Err(Failure::Exhausted)));

        let (s, _) = step(
            State::AwaitingAck { write: 5 },
            Observation::Written(Ok(Reply::Nack)),
        );
        assert_eq!(s, State::Failed(Failure::Exhausted));
    }

    #[test]
    fn wake_policy_spaces_out_writes() {
        let p = Policy::WAKE;
        let s = State::AwaitingReadback { write: 1, read: 1 };

        let (s, a) = transition(&p, 3, s, Observation::ReadBack(Ok(0)));
        assert_eq!(s, State::AwaitingAck { write: 2 });
        assert_eq!(a, Action::Write { delay_us: 1000 });

        let s = State::AwaitingReadback { write: 2, read: 1 };
        let (s, a) = transition(&p, 3, s, Observation::ReadBack(Err(PARITY)));
        assert_eq!(s, State::AwaitingAck { write: 3 });
        assert_eq!(a, Action::Write { delay_us: 1000 });
    }

    #[test]
    fn observations_out_of_order() {
        let (s, _) = step(State::Idle, Observation::ReadBack(Ok(0x14)));
        assert_eq!(s, State::Failed(Failure::OutOfOrder));

        let (s, _) = step(
            State::AwaitingAck { write: 1 },
            Observation::ReadBack(Ok(0x14)),
        );
        assert_eq!(s, State::Failed(Failure::OutOfOrder));
    }

    #[test]
    fn worst_case_step_count_is_bounded() {
        // A device that never latches: every readback says "still busy".
        let mut state = State::Idle;
        let mut obs = Observation::Start;
        let mut steps = 0;

        loop {
            let (s, a) = step(state, obs);
            state = s;
            steps += 1;
            obs = match a {
                Action::Write { .. } => Observation::Written(Ok(Reply::Ack)),
                Action::Read { .. } => Observation::ReadBack(Ok(0x94)),
                Action::Complete(r) => {
                    assert_eq!(r, Err(Failure::Exhausted));
                    break;
                }
            };
        }

        // start, then per write: one ack and fifty readbacks
        assert_eq!(steps, 1 + 5 * (1 + 50));
    }
}
