use super::{Model, OracleError, SmtOracle};
use crate::formula::{Formula, Node, Operator};
use std::{collections::HashMap, time::Duration};
use z3_solver::{
    ast::{Ast, Bool, BV},
    Config, Context, Params, SatResult, Solver as Z3Solver,
};

#[derive(Clone, Copy, Debug, Default)]
pub struct Z3Oracle;

impl Z3Oracle {
    pub fn new() -> Self {
        Self
    }
}

impl SmtOracle for Z3Oracle {
    fn name() -> &'static str {
        "Z3"
    }

    fn check_impl(
        &mut self,
        assertions: &[Formula],
        timeout: Duration,
    ) -> Result<Option<Model>, OracleError> {
        let config = Config::new();
        let ctx = Context::new(&config);
        let solver = Z3Solver::new(&ctx);

        let mut params = Params::new(&ctx);
        params.set_u32("timeout", timeout.as_millis().clamp(1, u32::MAX as u128) as u32);
        solver.set_params(&params);

        let mut translator = Z3Translator::new(&ctx);
        for assertion in assertions {
            let bv = translator.translate(assertion)?;
            solver.assert(&translator.is_true(&bv));
        }

        match solver.check() {
            SatResult::Sat => {
                let model = solver.get_model().ok_or(OracleError::SatUnknown)?;

                Ok(Some(
                    translator
                        .variables
                        .iter()
                        .filter_map(|(name, bv)| {
                            model
                                .eval(bv, true)
                                .and_then(|value| value.as_u64())
                                .map(|value| (name.clone(), value))
                        })
                        .collect(),
                ))
            }
            SatResult::Unsat => Ok(None),
            SatResult::Unknown => match solver.get_reason_unknown() {
                Some(reason) if reason.contains("timeout") || reason.contains("canceled") => {
                    Err(OracleError::Timeout)
                }
                _ => Err(OracleError::SatUnknown),
            },
        }
    }
}

/// Translates formulas into bitvector terms. One bit results of
/// comparisons are bitvectors of width 1, memory reads become free
/// variables named after the read.
struct Z3Translator<'ctx> {
    ctx: &'ctx Context,
    variables: HashMap<String, BV<'ctx>>,
    cache: HashMap<Formula, BV<'ctx>>,
}

impl<'ctx> Z3Translator<'ctx> {
    fn new(ctx: &'ctx Context) -> Self {
        Self {
            ctx,
            variables: HashMap::new(),
            cache: HashMap::new(),
        }
    }

    fn is_true(&self, bv: &BV<'ctx>) -> Bool<'ctx> {
        bv._eq(&BV::from_u64(self.ctx, 1, 1))
    }

    fn bit(&self, b: Bool<'ctx>) -> BV<'ctx> {
        b.ite(&BV::from_u64(self.ctx, 1, 1), &BV::from_u64(self.ctx, 0, 1))
    }

    fn variable(&mut self, name: String, width: u32) -> BV<'ctx> {
        let ctx = self.ctx;
        self.variables
            .entry(name.clone())
            .or_insert_with(|| BV::new_const(ctx, name, width))
            .clone()
    }

    fn translate(&mut self, formula: &Formula) -> Result<BV<'ctx>, OracleError> {
        if let Some(done) = self.cache.get(formula) {
            return Ok(done.clone());
        }

        let result = match formula.node() {
            Node::Const { value, width } => BV::from_u64(self.ctx, *value, *width),
            Node::Id { name, width } => self.variable(name.clone(), *width),
            Node::Mem { width, .. } => self.variable(formula.to_string(), *width),
            Node::Marker { .. } => {
                return Err(OracleError::Unsupported(format!(
                    "taint marker {}",
                    formula
                )))
            }
            Node::Slice { arg, lo, hi } => self.translate(arg)?.extract(hi - 1, *lo),
            Node::Compose { parts, .. } => {
                let mut result = self.translate(&parts[0])?;
                for part in &parts[1..] {
                    result = self.translate(part)?.concat(&result);
                }
                result
            }
            Node::Cond {
                cond,
                then,
                otherwise,
            } => {
                let cond = self.translate(cond)?;
                let then = self.translate(then)?;
                let otherwise = self.translate(otherwise)?;
                self.is_true(&cond).ite(&then, &otherwise)
            }
            Node::Op { op, args, width } => {
                let args = args
                    .iter()
                    .map(|a| self.translate(a))
                    .collect::<Result<Vec<_>, _>>()?;
                self.operation(*op, &args, *width)
            }
        };

        self.cache.insert(formula.clone(), result.clone());

        Ok(result)
    }

    #[rustfmt::skip]
    fn operation(&self, op: Operator, args: &[BV<'ctx>], width: u32) -> BV<'ctx> {
        let fold = |f: fn(&BV<'ctx>, &BV<'ctx>) -> BV<'ctx>| {
            args[1..].iter().fold(args[0].clone(), |acc, a| f(&acc, a))
        };

        match op {
            Operator::Add => fold(BV::bvadd),
            Operator::Mul => fold(BV::bvmul),
            Operator::And => fold(BV::bvand),
            Operator::Or => fold(BV::bvor),
            Operator::Xor => fold(BV::bvxor),
            Operator::Sub => args[0].bvsub(&args[1]),
            Operator::UDiv => args[0].bvudiv(&args[1]),
            Operator::URem => args[0].bvurem(&args[1]),
            Operator::SDiv => args[0].bvsdiv(&args[1]),
            Operator::SRem => args[0].bvsrem(&args[1]),
            Operator::Shl => args[0].bvshl(&args[1]),
            Operator::Lshr => args[0].bvlshr(&args[1]),
            Operator::Ashr => args[0].bvashr(&args[1]),
            Operator::Neg => args[0].bvneg(),
            Operator::Not => args[0].bvnot(),
            Operator::Eq => self.bit(args[0]._eq(&args[1])),
            Operator::Ult => self.bit(args[0].bvult(&args[1])),
            Operator::Slt => self.bit(args[0].bvslt(&args[1])),
            Operator::Ule => self.bit(args[0].bvule(&args[1])),
            Operator::Sle => self.bit(args[0].bvsle(&args[1])),
            Operator::ZeroExt => args[0].zero_ext(width - args[0].get_size()),
            Operator::SignExt => args[0].sign_ext(width - args[0].get_size()),
        }
    }
}
