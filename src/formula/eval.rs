use super::{Formula, Node, Operator, Width};
use crate::{
    error::{EngineError, Result},
    util::{mask, sign_extend},
};
use std::collections::HashMap;

// Division and remainder by zero follow SMT-LIB bitvector semantics so that
// folded constants agree with the solver.
pub(super) fn apply(op: Operator, args: &[u64], arg_width: Width, width: Width) -> u64 {
    let m = mask(arg_width);
    let signed = |v: u64| sign_extend(v, arg_width) as i64;

    let result = match op {
        Operator::Add => args.iter().fold(0_u64, |acc, v| acc.wrapping_add(*v)),
        Operator::Mul => args.iter().fold(1_u64, |acc, v| acc.wrapping_mul(*v)),
        Operator::And => args.iter().fold(u64::MAX, |acc, v| acc & v),
        Operator::Or => args.iter().fold(0, |acc, v| acc | v),
        Operator::Xor => args.iter().fold(0, |acc, v| acc ^ v),
        Operator::Sub => args[0].wrapping_sub(args[1]),
        Operator::UDiv => match args[1] & m {
            0 => m,
            d => (args[0] & m) / d,
        },
        Operator::URem => match args[1] & m {
            0 => args[0],
            d => (args[0] & m) % d,
        },
        Operator::SDiv => match signed(args[1]) {
            0 if signed(args[0]) < 0 => 1,
            0 => m,
            d => signed(args[0]).wrapping_div(d) as u64,
        },
        Operator::SRem => match signed(args[1]) {
            0 => args[0],
            d => signed(args[0]).wrapping_rem(d) as u64,
        },
        Operator::Shl => match args[1] & m {
            s if s >= arg_width as u64 => 0,
            s => args[0] << s,
        },
        Operator::Lshr => match args[1] & m {
            s if s >= arg_width as u64 => 0,
            s => (args[0] & m) >> s,
        },
        Operator::Ashr => {
            let shift = (args[1] & m).min(arg_width as u64 - 1);
            (signed(args[0]) >> shift) as u64
        }
        Operator::Neg => args[0].wrapping_neg(),
        Operator::Not => !args[0],
        Operator::Eq => u64::from(args[0] & m == args[1] & m),
        Operator::Ult => u64::from(args[0] & m < args[1] & m),
        Operator::Ule => u64::from(args[0] & m <= args[1] & m),
        Operator::Slt => u64::from(signed(args[0]) < signed(args[1])),
        Operator::Sle => u64::from(signed(args[0]) <= signed(args[1])),
        Operator::ZeroExt => args[0] & m,
        Operator::SignExt => sign_extend(args[0], arg_width),
    };

    result & mask(width)
}

impl Formula {
    /// Concrete value of the formula. `leaf` supplies values for
    /// identifiers, markers and memory reads; `None` means the leaf is not
    /// concrete.
    pub fn evaluate<F>(&self, leaf: &mut F) -> Option<u64>
    where
        F: FnMut(&Formula) -> Option<u64>,
    {
        let mut cache = HashMap::new();
        self.evaluate_cached(leaf, &mut cache)
    }

    fn evaluate_cached<F>(&self, leaf: &mut F, cache: &mut HashMap<*const Node, u64>) -> Option<u64>
    where
        F: FnMut(&Formula) -> Option<u64>,
    {
        if let Some(value) = cache.get(&self.key()) {
            return Some(*value);
        }

        let value = match self.node() {
            Node::Const { value, .. } => *value,
            Node::Id { .. } | Node::Marker { .. } | Node::Mem { .. } => {
                leaf(self)? & mask(self.width())
            }
            Node::Op { op, args, width } => {
                let values = args
                    .iter()
                    .map(|a| a.evaluate_cached(leaf, cache))
                    .collect::<Option<Vec<_>>>()?;
                apply(*op, &values, args[0].width(), *width)
            }
            Node::Slice { arg, lo, hi } => (arg.evaluate_cached(leaf, cache)? >> lo) & mask(hi - lo),
            Node::Compose { parts, .. } => {
                let mut value = 0;
                let mut offset = 0;
                for part in parts {
                    let v = part.evaluate_cached(leaf, cache)?;
                    if offset < 64 {
                        value |= v << offset;
                    }
                    offset += part.width();
                }
                value
            }
            Node::Cond {
                cond,
                then,
                otherwise,
            } => {
                if cond.evaluate_cached(leaf, cache)? != 0 {
                    then.evaluate_cached(leaf, cache)?
                } else {
                    otherwise.evaluate_cached(leaf, cache)?
                }
            }
        };

        cache.insert(self.key(), value);
        Some(value)
    }

    /// Evaluates under a binding of identifier names; any other leaf is a
    /// non-concrete value.
    pub fn evaluate_with(&self, bindings: &HashMap<String, u64>) -> Result<u64> {
        let mut missing = None;
        let value = self.evaluate(&mut |leaf| {
            let value = leaf.as_id().and_then(|name| bindings.get(name).copied());
            if value.is_none() && missing.is_none() {
                missing = Some(leaf.to_string());
            }
            value
        });

        value.ok_or_else(|| {
            EngineError::UnsupportedExpression(format!(
                "{} is not concrete",
                missing.unwrap_or_else(|| self.to_string())
            ))
        })
    }
}
