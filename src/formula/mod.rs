//! Immutable symbolic expressions over fixed-width bitvectors.
//!
//! A [`Formula`] is a reference counted expression tree. Formulas are only
//! ever built through the canonicalizing constructors in this module, so
//! two formulas denoting the same expression modulo operand order of
//! commutative operators compare equal and hash identically.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    rc::Rc,
};

mod eval;
mod simplify;

pub type Width = u32;

pub const MAX_WIDTH: Width = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operator {
    Add,
    Mul,
    And,
    Or,
    Xor,
    Sub,
    UDiv,
    URem,
    SDiv,
    SRem,
    Shl,
    Lshr,
    Ashr,
    Neg,
    Not,
    Eq,
    Ult,
    Slt,
    Ule,
    Sle,
    ZeroExt,
    SignExt,
}

impl Operator {
    /// Commutative and associative, stored as a flat sorted operand list.
    pub fn is_associative(self) -> bool {
        matches!(
            self,
            Operator::Add | Operator::Mul | Operator::And | Operator::Or | Operator::Xor
        )
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Operator::Eq | Operator::Ult | Operator::Slt | Operator::Ule | Operator::Sle
        )
    }

    pub fn is_unary(self) -> bool {
        matches!(
            self,
            Operator::Neg | Operator::Not | Operator::ZeroExt | Operator::SignExt
        )
    }

    fn symbol(self) -> &'static str {
        match self {
            Operator::Add => "+",
            Operator::Mul => "*",
            Operator::And => "&",
            Operator::Or => "|",
            Operator::Xor => "^",
            Operator::Sub => "-",
            Operator::UDiv => "udiv",
            Operator::URem => "umod",
            Operator::SDiv => "sdiv",
            Operator::SRem => "smod",
            Operator::Shl => "<<",
            Operator::Lshr => ">>",
            Operator::Ashr => "a>>",
            Operator::Neg => "-",
            Operator::Not => "~",
            Operator::Eq => "==",
            Operator::Ult => "<u",
            Operator::Slt => "<s",
            Operator::Ule => "<=u",
            Operator::Sle => "<=s",
            Operator::ZeroExt => "zeroExt",
            Operator::SignExt => "signExt",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Node {
    Const {
        value: u64,
        width: Width,
    },
    /// Registers and free input variables.
    Id {
        name: String,
        width: Width,
    },
    /// Opaque one bit taint marker.
    Marker {
        id: u64,
    },
    Mem {
        address: Formula,
        width: Width,
    },
    Op {
        op: Operator,
        args: Vec<Formula>,
        width: Width,
    },
    /// Bits `lo..hi` of `arg`, `hi` exclusive.
    Slice {
        arg: Formula,
        lo: Width,
        hi: Width,
    },
    /// Concatenation, least significant part first.
    Compose {
        parts: Vec<Formula>,
        width: Width,
    },
    Cond {
        cond: Formula,
        then: Formula,
        otherwise: Formula,
    },
}

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Formula(Rc<Node>);

impl Formula {
    fn from_node(node: Node) -> Self {
        Self(Rc::new(node))
    }

    pub fn node(&self) -> &Node {
        &self.0
    }

    pub fn constant(value: u64, width: Width) -> Self {
        debug_assert!(width > 0 && width <= MAX_WIDTH, "invalid width {}", width);
        Self::from_node(Node::Const {
            value: value & crate::util::mask(width),
            width,
        })
    }

    pub fn id(name: impl Into<String>, width: Width) -> Self {
        debug_assert!(width > 0 && width <= MAX_WIDTH, "invalid width {}", width);
        Self::from_node(Node::Id {
            name: name.into(),
            width,
        })
    }

    pub fn marker(id: u64) -> Self {
        Self::from_node(Node::Marker { id })
    }

    pub fn mem(address: Formula, width: Width) -> Self {
        debug_assert!(width % 8 == 0, "memory access of {} bits", width);
        Self::from_node(Node::Mem { address, width })
    }

    pub fn width(&self) -> Width {
        match self.node() {
            Node::Const { width, .. }
            | Node::Id { width, .. }
            | Node::Mem { width, .. }
            | Node::Op { width, .. }
            | Node::Compose { width, .. } => *width,
            Node::Marker { .. } => 1,
            Node::Slice { lo, hi, .. } => hi - lo,
            Node::Cond { then, .. } => then.width(),
        }
    }

    pub fn as_const(&self) -> Option<u64> {
        match self.node() {
            Node::Const { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn is_const(&self) -> bool {
        self.as_const().is_some()
    }

    pub fn as_id(&self) -> Option<&str> {
        match self.node() {
            Node::Id { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn as_mem(&self) -> Option<(&Formula, Width)> {
        match self.node() {
            Node::Mem { address, width } => Some((address, *width)),
            _ => None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(
            self.node(),
            Node::Const { .. } | Node::Id { .. } | Node::Marker { .. }
        )
    }

    pub fn children(&self) -> Vec<&Formula> {
        match self.node() {
            Node::Const { .. } | Node::Id { .. } | Node::Marker { .. } => vec![],
            Node::Mem { address, .. } => vec![address],
            Node::Op { args, .. } => args.iter().collect(),
            Node::Slice { arg, .. } => vec![arg],
            Node::Compose { parts, .. } => parts.iter().collect(),
            Node::Cond {
                cond,
                then,
                otherwise,
            } => vec![cond, then, otherwise],
        }
    }

    /// Same node kind over new children, re-canonicalized.
    pub fn rebuild(&self, children: Vec<Formula>) -> Formula {
        let mut children = children.into_iter();
        let mut next = || children.next().expect("child count preserved");

        match self.node() {
            Node::Const { .. } | Node::Id { .. } | Node::Marker { .. } => self.clone(),
            Node::Mem { width, .. } => Formula::mem(next(), *width),
            Node::Op { op, args, width } => {
                let args = (0..args.len()).map(|_| next()).collect();
                Formula::operation(*op, args, *width)
            }
            Node::Slice { lo, hi, .. } => Formula::slice(next(), *lo, *hi),
            Node::Compose { parts, .. } => {
                let parts = (0..parts.len()).map(|_| next()).collect();
                Formula::compose(parts)
            }
            Node::Cond { .. } => {
                let cond = next();
                let then = next();
                Formula::cond(cond, then, next())
            }
        }
    }

    fn key(&self) -> *const Node {
        Rc::as_ptr(&self.0)
    }

    /// Bottom-up rewrite: children are transformed first, the node is
    /// rebuilt from them and then handed to `f`. Shared sub-trees are
    /// visited once.
    pub fn transform<F>(&self, f: &mut F) -> Formula
    where
        F: FnMut(Formula) -> Formula,
    {
        let mut cache = HashMap::new();
        self.transform_cached(f, &mut cache)
    }

    fn transform_cached<F>(&self, f: &mut F, cache: &mut HashMap<*const Node, Formula>) -> Formula
    where
        F: FnMut(Formula) -> Formula,
    {
        if let Some(done) = cache.get(&self.key()) {
            return done.clone();
        }

        let rebuilt = if self.is_leaf() {
            self.clone()
        } else {
            let children = self
                .children()
                .into_iter()
                .map(|c| c.transform_cached(f, cache))
                .collect();
            self.rebuild(children)
        };
        let result = f(rebuilt);

        cache.insert(self.key(), result.clone());
        result
    }

    /// Top-down replacement of whole sub-formulas.
    pub fn substitute(&self, replacements: &HashMap<Formula, Formula>) -> Formula {
        if replacements.is_empty() {
            return self.clone();
        }
        let mut cache = HashMap::new();
        self.substitute_cached(replacements, &mut cache)
    }

    fn substitute_cached(
        &self,
        replacements: &HashMap<Formula, Formula>,
        cache: &mut HashMap<*const Node, Formula>,
    ) -> Formula {
        if let Some(done) = cache.get(&self.key()) {
            return done.clone();
        }

        let result = if let Some(replacement) = replacements.get(self) {
            replacement.clone()
        } else if self.is_leaf() {
            self.clone()
        } else {
            let children = self
                .children()
                .into_iter()
                .map(|c| c.substitute_cached(replacements, cache))
                .collect();
            self.rebuild(children)
        };

        cache.insert(self.key(), result.clone());
        result
    }

    /// Pre-order walk over distinct sub-formulas. Returning `false` from
    /// `f` skips the children of the current node.
    pub fn visit<F>(&self, f: &mut F)
    where
        F: FnMut(&Formula) -> bool,
    {
        let mut seen = HashSet::new();
        let mut stack = vec![self];

        while let Some(current) = stack.pop() {
            if !seen.insert(current.key()) {
                continue;
            }
            if f(current) {
                stack.extend(current.children().into_iter().rev());
            }
        }
    }

    pub fn any<F>(&self, mut predicate: F) -> bool
    where
        F: FnMut(&Formula) -> bool,
    {
        let mut found = false;
        self.visit(&mut |f| {
            if !found && predicate(f) {
                found = true;
            }
            !found
        });
        found
    }

    pub fn contains(&self, needle: &Formula) -> bool {
        self.any(|f| f == needle)
    }

    pub fn has_marker(&self) -> bool {
        self.any(|f| matches!(f.node(), Node::Marker { .. }))
    }

    /// Names of all identifiers occurring in the formula, sorted.
    pub fn identifiers(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.visit(&mut |f| {
            if let Some(name) = f.as_id() {
                names.push(name.to_string());
            }
            true
        });
        names.sort();
        names.dedup();
        names
    }

    /// All memory dereferences, including those nested in addresses.
    pub fn memory_reads(&self) -> Vec<Formula> {
        let mut reads = Vec::new();
        self.visit(&mut |f| {
            if f.as_mem().is_some() {
                reads.push(f.clone());
            }
            true
        });
        reads
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node() {
            Node::Const { value, .. } => write!(f, "{:#x}", value),
            Node::Id { name, .. } => write!(f, "{}", name),
            Node::Marker { id } => write!(f, "taint_{}", id),
            Node::Mem { address, width } => write!(f, "@{}[{}]", width, address),
            Node::Op { op, args, width } => match op {
                Operator::Neg | Operator::Not => write!(f, "{}{}", op.symbol(), args[0]),
                Operator::ZeroExt | Operator::SignExt => {
                    write!(f, "{}_{}({})", op.symbol(), width, args[0])
                }
                _ => {
                    write!(f, "(")?;
                    for (i, arg) in args.iter().enumerate() {
                        if i > 0 {
                            write!(f, " {} ", op.symbol())?;
                        }
                        write!(f, "{}", arg)?;
                    }
                    write!(f, ")")
                }
            },
            Node::Slice { arg, lo, hi } => write!(f, "{}[{}:{}]", arg, lo, hi),
            Node::Compose { parts, .. } => {
                write!(f, "{{")?;
                let mut offset = 0;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} {} {}", part, offset, offset + part.width())?;
                    offset += part.width();
                }
                write!(f, "}}")
            }
            Node::Cond {
                cond,
                then,
                otherwise,
            } => write!(f, "({}?({},{}))", cond, then, otherwise),
        }
    }
}

impl fmt::Debug for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
