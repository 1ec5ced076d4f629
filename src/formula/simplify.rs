use super::{eval::apply, Formula, Node, Operator, Width};
use crate::util::mask;

impl Formula {
    /// Canonicalizing constructor for every operator node.
    ///
    /// `width` is the result width; it only differs from the operand width
    /// for comparisons (always 1) and extensions.
    pub fn operation(op: Operator, args: Vec<Formula>, width: Width) -> Formula {
        debug_assert!(!args.is_empty(), "operator {:?} without operands", op);

        let width = if op.is_comparison() { 1 } else { width };

        if let Some(values) = args.iter().map(|a| a.as_const()).collect::<Option<Vec<_>>>() {
            return Formula::constant(apply(op, &values, args[0].width(), width), width);
        }

        if op.is_associative() {
            return associative(op, args, width);
        }

        match (op, args.as_slice()) {
            (Operator::Sub, [a, b]) => {
                if a == b {
                    return Formula::constant(0, width);
                }
                if let Some(c) = b.as_const() {
                    return Formula::add(a.clone(), Formula::constant(c.wrapping_neg(), width));
                }
            }
            (Operator::Neg, [a]) | (Operator::Not, [a]) => {
                if let Node::Op {
                    op: inner,
                    args: nested,
                    ..
                } = a.node()
                {
                    if *inner == op {
                        return nested[0].clone();
                    }
                }
            }
            (Operator::Shl, [a, b]) | (Operator::Lshr, [a, b]) | (Operator::Ashr, [a, b]) => {
                match b.as_const() {
                    Some(0) => return a.clone(),
                    // a << c == a * 2^c, one canonical form for scaled indices
                    Some(c) if op == Operator::Shl && c < width as u64 => {
                        return Formula::mul(a.clone(), Formula::constant(1 << c, width))
                    }
                    Some(c) if c >= width as u64 && op != Operator::Ashr => {
                        return Formula::constant(0, width)
                    }
                    _ => {}
                }
            }
            (Operator::Eq, [a, b]) | (Operator::Ule, [a, b]) | (Operator::Sle, [a, b])
                if a == b =>
            {
                return Formula::constant(1, 1)
            }
            (Operator::Ult, [a, b]) | (Operator::Slt, [a, b]) if a == b => {
                return Formula::constant(0, 1)
            }
            (Operator::ZeroExt, [a]) | (Operator::SignExt, [a]) => {
                if a.width() == width {
                    return a.clone();
                }
                if let Node::Op {
                    op: inner,
                    args: nested,
                    ..
                } = a.node()
                {
                    if *inner == op {
                        return Formula::operation(op, vec![nested[0].clone()], width);
                    }
                }
            }
            _ => {}
        }

        Formula::from_node(Node::Op { op, args, width })
    }

    pub fn add(a: Formula, b: Formula) -> Formula {
        binary(Operator::Add, a, b)
    }

    pub fn sub(a: Formula, b: Formula) -> Formula {
        binary(Operator::Sub, a, b)
    }

    pub fn mul(a: Formula, b: Formula) -> Formula {
        binary(Operator::Mul, a, b)
    }

    pub fn and(a: Formula, b: Formula) -> Formula {
        binary(Operator::And, a, b)
    }

    pub fn or(a: Formula, b: Formula) -> Formula {
        binary(Operator::Or, a, b)
    }

    pub fn xor(a: Formula, b: Formula) -> Formula {
        binary(Operator::Xor, a, b)
    }

    pub fn udiv(a: Formula, b: Formula) -> Formula {
        binary(Operator::UDiv, a, b)
    }

    pub fn urem(a: Formula, b: Formula) -> Formula {
        binary(Operator::URem, a, b)
    }

    pub fn sdiv(a: Formula, b: Formula) -> Formula {
        binary(Operator::SDiv, a, b)
    }

    pub fn srem(a: Formula, b: Formula) -> Formula {
        binary(Operator::SRem, a, b)
    }

    pub fn shl(a: Formula, b: Formula) -> Formula {
        binary(Operator::Shl, a, b)
    }

    pub fn lshr(a: Formula, b: Formula) -> Formula {
        binary(Operator::Lshr, a, b)
    }

    pub fn ashr(a: Formula, b: Formula) -> Formula {
        binary(Operator::Ashr, a, b)
    }

    pub fn eq(a: Formula, b: Formula) -> Formula {
        binary(Operator::Eq, a, b)
    }

    pub fn ult(a: Formula, b: Formula) -> Formula {
        binary(Operator::Ult, a, b)
    }

    pub fn slt(a: Formula, b: Formula) -> Formula {
        binary(Operator::Slt, a, b)
    }

    pub fn ule(a: Formula, b: Formula) -> Formula {
        binary(Operator::Ule, a, b)
    }

    pub fn sle(a: Formula, b: Formula) -> Formula {
        binary(Operator::Sle, a, b)
    }

    pub fn neg(a: Formula) -> Formula {
        let width = a.width();
        Formula::operation(Operator::Neg, vec![a], width)
    }

    pub fn not(a: Formula) -> Formula {
        let width = a.width();
        Formula::operation(Operator::Not, vec![a], width)
    }

    pub fn zero_extend(a: Formula, width: Width) -> Formula {
        debug_assert!(width >= a.width());
        Formula::operation(Operator::ZeroExt, vec![a], width)
    }

    pub fn sign_extend(a: Formula, width: Width) -> Formula {
        debug_assert!(width >= a.width());
        Formula::operation(Operator::SignExt, vec![a], width)
    }

    pub fn slice(arg: Formula, lo: Width, hi: Width) -> Formula {
        debug_assert!(lo < hi && hi <= arg.width(), "slice {}:{} of {}", lo, hi, arg);

        if lo == 0 && hi == arg.width() {
            return arg;
        }

        match arg.node() {
            Node::Const { value, .. } => Formula::constant(value >> lo, hi - lo),
            Node::Slice { arg: inner, lo: base, .. } => {
                Formula::slice(inner.clone(), base + lo, base + hi)
            }
            Node::Compose { parts, .. } => {
                let mut selected = Vec::new();
                let mut offset = 0;
                for part in parts {
                    let (start, end) = (offset, offset + part.width());
                    if end > lo && start < hi {
                        selected.push(Formula::slice(
                            part.clone(),
                            lo.max(start) - start,
                            hi.min(end) - start,
                        ));
                    }
                    offset = end;
                }
                Formula::compose(selected)
            }
            Node::Op {
                op: Operator::ZeroExt,
                args,
                ..
            } => {
                let inner = &args[0];
                let inner_width = inner.width();
                if hi <= inner_width {
                    Formula::slice(inner.clone(), lo, hi)
                } else if lo >= inner_width {
                    Formula::constant(0, hi - lo)
                } else {
                    Formula::zero_extend(Formula::slice(inner.clone(), lo, inner_width), hi - lo)
                }
            }
            _ => Formula::from_node(Node::Slice { arg, lo, hi }),
        }
    }

    /// Concatenation of `parts`, least significant first.
    pub fn compose(parts: Vec<Formula>) -> Formula {
        let mut merged: Vec<Formula> = Vec::with_capacity(parts.len());

        for part in flatten_compose(parts) {
            match merged.last().and_then(|last| merge_adjacent(last, &part)) {
                Some(joined) => {
                    merged.pop();
                    merged.push(joined);
                }
                None => merged.push(part),
            }
        }

        match merged.len() {
            0 => panic!("composition without parts"),
            1 => merged.remove(0),
            2 if merged[1].as_const() == Some(0) => {
                let width = merged[0].width() + merged[1].width();
                Formula::zero_extend(merged.remove(0), width)
            }
            _ => {
                let width = merged.iter().map(Formula::width).sum();
                debug_assert!(width <= super::MAX_WIDTH);
                Formula::from_node(Node::Compose {
                    parts: merged,
                    width,
                })
            }
        }
    }

    pub fn cond(cond: Formula, then: Formula, otherwise: Formula) -> Formula {
        debug_assert_eq!(then.width(), otherwise.width());

        match cond.as_const() {
            Some(0) => otherwise,
            Some(_) => then,
            None if then == otherwise => then,
            None => Formula::from_node(Node::Cond {
                cond,
                then,
                otherwise,
            }),
        }
    }
}

fn binary(op: Operator, a: Formula, b: Formula) -> Formula {
    debug_assert_eq!(a.width(), b.width(), "{:?} over {} and {}", op, a, b);
    let width = a.width();
    Formula::operation(op, vec![a, b], width)
}

fn neutral(op: Operator, width: Width) -> u64 {
    match op {
        Operator::Mul => 1,
        Operator::And => mask(width),
        _ => 0,
    }
}

fn absorbing(op: Operator, width: Width) -> Option<u64> {
    match op {
        Operator::Mul | Operator::And => Some(0),
        Operator::Or => Some(mask(width)),
        _ => None,
    }
}

fn associative(op: Operator, args: Vec<Formula>, width: Width) -> Formula {
    let mut operands = Vec::with_capacity(args.len());
    for arg in args {
        match arg.node() {
            Node::Op {
                op: inner,
                args: nested,
                ..
            } if *inner == op => operands.extend(nested.iter().cloned()),
            _ => operands.push(arg),
        }
    }

    let mut constant: Option<u64> = None;
    let mut rest = Vec::with_capacity(operands.len());
    for operand in operands {
        match operand.as_const() {
            Some(v) => {
                constant = Some(match constant {
                    Some(c) => apply(op, &[c, v], width, width),
                    None => v,
                })
            }
            None => rest.push(operand),
        }
    }

    rest.sort();
    match op {
        Operator::And | Operator::Or => rest.dedup(),
        Operator::Xor => rest = cancel_pairs(rest),
        _ => {}
    }

    if let Some(c) = constant {
        if absorbing(op, width) == Some(c) {
            return Formula::constant(c, width);
        }
        if c != neutral(op, width) {
            rest.push(Formula::constant(c, width));
        }
    }

    match rest.len() {
        0 => Formula::constant(neutral(op, width), width),
        1 => rest.remove(0),
        _ => Formula::from_node(Node::Op {
            op,
            args: rest,
            width,
        }),
    }
}

// a ^ a = 0 on a sorted operand list
fn cancel_pairs(sorted: Vec<Formula>) -> Vec<Formula> {
    let mut out: Vec<Formula> = Vec::with_capacity(sorted.len());
    for operand in sorted {
        if out.last() == Some(&operand) {
            out.pop();
        } else {
            out.push(operand);
        }
    }
    out
}

fn flatten_compose(parts: Vec<Formula>) -> Vec<Formula> {
    let mut flat = Vec::with_capacity(parts.len());
    for part in parts {
        match part.node() {
            Node::Compose { parts: nested, .. } => flat.extend(nested.iter().cloned()),
            _ => flat.push(part),
        }
    }
    flat
}

fn merge_adjacent(low: &Formula, high: &Formula) -> Option<Formula> {
    match (low.node(), high.node()) {
        (
            Node::Const {
                value: lv,
                width: lw,
            },
            Node::Const {
                value: hv,
                width: hw,
            },
        ) if lw + hw <= super::MAX_WIDTH => Some(Formula::constant(lv | (hv << lw), lw + hw)),
        (
            Node::Slice {
                arg: la,
                lo: llo,
                hi: lhi,
            },
            Node::Slice {
                arg: ha,
                lo: hlo,
                hi: hhi,
            },
        ) if la == ha && lhi == hlo => Some(Formula::slice(la.clone(), *llo, *hhi)),
        _ => None,
    }
}
