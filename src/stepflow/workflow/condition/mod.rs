// SPDX-License-Identifier: MIT

//! Edge predicates for graph routing
//!
//! Predicates are small, side-effect-free expressions over the payload:
//! - `complexity == 'low'`
//! - `confidence > 0.8`
//! - `tags contains 'urgent' and not reviewed`

mod ast;
mod evaluator;
mod parser;

pub use ast::{CompareOp, Expression, Literal};
pub use evaluator::evaluate;
pub use parser::{parse, ConditionError};
