// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operation primitives: the three op families from spec §3, plus the
//! stateful ops that close over timer/counter/hysteresis/edge state.

use pmu_types::ChannelId;

/// An operand is either a channel reference (resolved through C1) or an
/// immediate float constant (spec §3).
#[derive(Clone, Copy, Debug)]
pub enum OperandSource {
    Channel(ChannelId),
    Immediate(f64),
}

impl OperandSource {
    pub fn imm(v: f64) -> Self {
        OperandSource::Immediate(v)
    }
}

/// One primitive step (spec §3). Three operand sources plus an output
/// vchannel index; `op_kind` selects which of `a`, `b`, `c` are used and
/// how.
#[derive(Clone, Copy, Debug)]
pub struct Operation {
    pub op_kind: OpKind,
    pub a: OperandSource,
    pub b: OperandSource,
    pub c: OperandSource,
    pub output: u16,
}

impl Operation {
    pub fn new(op_kind: OpKind, a: OperandSource, b: OperandSource, c: OperandSource, output: u16) -> Self {
        Operation { op_kind, a, b, c, output }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    // Boolean family (operands thresholded at 0.5, spec §3)
    And,
    Or,
    Not,
    Xor,
    Set,
    Reset,
    // Comparison family (epsilon-tolerant equality)
    Gt,
    Lt,
    Eq,
    Neq,
    Gte,
    Lte,
    // Arithmetic family
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Min,
    Max,
    Abs,
    Clamp,
    // Stateful family
    EdgeRising,
    EdgeFalling,
    Hysteresis,
    Toggle,
    /// Increments a latched counter on each rising edge of operand `a`;
    /// output is true once the count reaches threshold `b`. Backed by
    /// the C_MAX counter pool (spec §3 "Counter state blocks").
    Count,
}

impl OpKind {
    /// Operations whose evaluation needs per-instance latched state
    /// beyond the single-sample operand values (timers are driven
    /// through the engine's explicit `start_timer`/`timer_expired` API,
    /// not through an op, per spec §4.2).
    pub fn is_stateful(self) -> bool {
        matches!(self, OpKind::Hysteresis | OpKind::Toggle | OpKind::Count)
    }

    /// Edge ops need the channel's previous-tick value but carry no
    /// latched state of their own.
    pub fn is_edge(self) -> bool {
        matches!(self, OpKind::EdgeRising | OpKind::EdgeFalling)
    }
}
