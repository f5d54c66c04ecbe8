use serde::{Deserialize, Serialize};

/// AArch64 general purpose registers as seen by the supervisor-call ABI.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Register {
    X0 = 0, // argument 0 / result code
    X1 = 1, // argument 1 / output 0
    X2 = 2,
    X3 = 3,
    X4 = 4,
    X5 = 5,
    X6 = 6,
    X7 = 7, // last argument register

    X8 = 8,   // indirect result
    X9 = 9,   // temporaries x9..x15
    X10 = 10,
    X11 = 11,
    X12 = 12,
    X13 = 13,
    X14 = 14,
    X15 = 15,
    X16 = 16, // intra-procedure scratch
    X17 = 17,
    X18 = 18, // platform register

    X19 = 19, // callee-saved x19..x28
    X20 = 20,
    X21 = 21,
    X22 = 22,
    X23 = 23,
    X24 = 24,
    X25 = 25,
    X26 = 26,
    X27 = 27,
    X28 = 28,

    Fp = 29, // frame pointer
    Lr = 30, // link register
}

impl Register {
    pub const NUM_GPRS: usize = 31;
    pub const NUM_ARGS: usize = 8;

    pub fn index(self) -> usize {
        self as usize
    }
}

impl From<Register> for usize {
    fn from(r: Register) -> usize {
        r as usize
    }
}
