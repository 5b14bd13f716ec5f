// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! C2: the logic engine (spec §4.2).

mod engine;
mod op;
mod state;

pub use engine::{
    HardwareRefresh, LogicEngine, LogicError, LogicFunction, OutputBinding, K_OPS_PER_FN, K_VCHAN,
    MAX_FUNCTIONS, MAX_OPS_PER_TICK,
};
pub use op::{OpKind, OperandSource, Operation};
pub use state::{C_MAX, H_MAX, T_MAX};
