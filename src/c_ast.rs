// Copyright 2025 Cornell University
// released under MIT License

//! Syntax trees for the C statements attached to CFA edges, and the
//! structural comparison used by `MATCH { ... }` triggers.
//!
//! Patterns are parsed with the same grammar as edge statements. The two
//! wildcard forms only make sense in patterns:
//! - `$?` matches any single sub-tree and records nothing
//! - `$N` matches any single sub-tree and records its rendered text as
//!   transition capture `N`

use std::fmt;

use pest::iterators::Pairs;
use pest::pratt_parser::PrattParser;
use pest::Parser;
use pest_derive::Parser;
use rustc_hash::FxHashMap;

#[derive(Parser)]
#[grammar = "c_ast.pest"]
struct CParser;

lazy_static::lazy_static! {
    static ref PRATT_PARSER: PrattParser<Rule> = {
        use pest::pratt_parser::{Assoc::*, Op};
        use Rule::*;

        // Precedence is defined lowest to highest
        PrattParser::new()
            .op(Op::infix(assign, Right))
            .op(Op::infix(lor, Left))
            .op(Op::infix(land, Left))
            .op(Op::infix(bor, Left))
            .op(Op::infix(bxor, Left))
            .op(Op::infix(band, Left))
            .op(Op::infix(eq, Left) | Op::infix(neq, Left))
            .op(Op::infix(lt, Left) | Op::infix(gt, Left) | Op::infix(le, Left) | Op::infix(ge, Left))
            .op(Op::infix(shl, Left) | Op::infix(shr, Left))
            .op(Op::infix(add, Left) | Op::infix(sub, Left))
            .op(Op::infix(mul, Left) | Op::infix(div, Left) | Op::infix(rem, Left))
            .op(Op::prefix(neg) | Op::prefix(not) | Op::prefix(bnot) | Op::prefix(deref) | Op::prefix(addr))
            .op(Op::postfix(call) | Op::postfix(index) | Op::postfix(arrow) | Op::postfix(member))
    };
}

/// Placeholder that matches an arbitrary sub-tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Joker {
    Any,
    Capture(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
    Deref,
    AddrOf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Or,
    And,
    BitOr,
    BitXor,
    BitAnd,
    Equal,
    NotEqual,
    Less,
    Greater,
    LessEqual,
    GreaterEqual,
    ShiftLeft,
    ShiftRight,
    Plus,
    Minus,
    Times,
    Divide,
    Modulo,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CExpr {
    Id(String),
    /// Integer literals are compared by value, so `0x10` and `16` are the same node
    IntLit(i64),
    CharLit(String),
    StringLit(String),
    Unary(UnaryOp, Box<CExpr>),
    Binary(BinaryOp, Box<CExpr>, Box<CExpr>),
    Assign(Box<CExpr>, Box<CExpr>),
    Call(Box<CExpr>, Vec<CExpr>),
    Index(Box<CExpr>, Box<CExpr>),
    Member {
        base: Box<CExpr>,
        field: String,
        arrow: bool,
    },
    Joker(Joker),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CStatement {
    Expr(CExpr),
    Decl {
        ty: String,
        pointer_depth: usize,
        name: String,
        init: Option<CExpr>,
    },
    Return(Option<CExpr>),
}

/// Parses a single C statement (the trailing `;` is optional).
pub fn parse_statement(text: &str) -> Result<CStatement, String> {
    let mut pairs = CParser::parse(Rule::statement_input, text).map_err(|e| e.to_string())?;
    let statement = pairs
        .next()
        .ok_or_else(|| "empty statement".to_string())?;
    let inner = statement
        .into_inner()
        .next()
        .ok_or_else(|| "empty statement".to_string())?;

    match inner.as_rule() {
        Rule::expr_stmt => {
            let expr = inner
                .into_inner()
                .next()
                .ok_or_else(|| "missing expression".to_string())?;
            Ok(CStatement::Expr(parse_expr(expr.into_inner())?))
        }
        Rule::return_stmt => {
            let value = inner
                .into_inner()
                .find(|p| p.as_rule() == Rule::expr)
                .map(|p| parse_expr(p.into_inner()))
                .transpose()?;
            Ok(CStatement::Return(value))
        }
        Rule::declaration => {
            let mut ty = String::new();
            let mut pointer_depth = 0;
            let mut name = String::new();
            let mut init = None;
            for pair in inner.into_inner() {
                match pair.as_rule() {
                    Rule::decl_type => {
                        ty = pair.as_str().split_whitespace().collect::<Vec<_>>().join(" ")
                    }
                    Rule::pointer => pointer_depth += 1,
                    Rule::ident => name = pair.as_str().to_string(),
                    Rule::expr => init = Some(parse_expr(pair.into_inner())?),
                    rule => unreachable!("declaration: unexpected rule {:?}", rule),
                }
            }
            Ok(CStatement::Decl {
                ty,
                pointer_depth,
                name,
                init,
            })
        }
        rule => unreachable!("statement: unexpected rule {:?}", rule),
    }
}

fn parse_int_literal(text: &str) -> Result<i64, String> {
    let digits = text.trim_end_matches(['u', 'U', 'l', 'L']);
    let parsed = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        i64::from_str_radix(hex, 16)
    } else {
        digits.parse::<i64>()
    };
    parsed.map_err(|e| format!("invalid integer literal `{}`: {}", text, e))
}

fn parse_expr(pairs: Pairs<Rule>) -> Result<CExpr, String> {
    PRATT_PARSER
        .map_primary(|primary| match primary.as_rule() {
            Rule::ident => Ok(CExpr::Id(primary.as_str().to_string())),
            Rule::int_lit => parse_int_literal(primary.as_str()).map(CExpr::IntLit),
            Rule::char_lit => Ok(CExpr::CharLit(primary.as_str().to_string())),
            Rule::string_lit => Ok(CExpr::StringLit(primary.as_str().to_string())),
            Rule::joker_any => Ok(CExpr::Joker(Joker::Any)),
            Rule::joker_num => primary.as_str()[1..]
                .parse::<u32>()
                .map(|n| CExpr::Joker(Joker::Capture(n)))
                .map_err(|e| format!("invalid capture `{}`: {}", primary.as_str(), e)),
            // parenthesised sub-expression
            Rule::expr => parse_expr(primary.into_inner()),
            rule => unreachable!("CExpr::parse expected atom, found {:?}", rule),
        })
        .map_infix(|lhs, op, rhs| {
            let (lhs, rhs) = (Box::new(lhs?), Box::new(rhs?));
            let op = match op.as_rule() {
                Rule::assign => return Ok(CExpr::Assign(lhs, rhs)),
                Rule::lor => BinaryOp::Or,
                Rule::land => BinaryOp::And,
                Rule::bor => BinaryOp::BitOr,
                Rule::bxor => BinaryOp::BitXor,
                Rule::band => BinaryOp::BitAnd,
                Rule::eq => BinaryOp::Equal,
                Rule::neq => BinaryOp::NotEqual,
                Rule::lt => BinaryOp::Less,
                Rule::gt => BinaryOp::Greater,
                Rule::le => BinaryOp::LessEqual,
                Rule::ge => BinaryOp::GreaterEqual,
                Rule::shl => BinaryOp::ShiftLeft,
                Rule::shr => BinaryOp::ShiftRight,
                Rule::add => BinaryOp::Plus,
                Rule::sub => BinaryOp::Minus,
                Rule::mul => BinaryOp::Times,
                Rule::div => BinaryOp::Divide,
                Rule::rem => BinaryOp::Modulo,
                rule => unreachable!("CExpr::parse expected infix operation, found {:?}", rule),
            };
            Ok(CExpr::Binary(op, lhs, rhs))
        })
        .map_prefix(|op, arg| {
            let op = match op.as_rule() {
                Rule::neg => UnaryOp::Neg,
                Rule::not => UnaryOp::Not,
                Rule::bnot => UnaryOp::BitNot,
                Rule::deref => UnaryOp::Deref,
                Rule::addr => UnaryOp::AddrOf,
                rule => unreachable!("CExpr::parse expected prefix operation, found {:?}", rule),
            };
            Ok(CExpr::Unary(op, Box::new(arg?)))
        })
        .map_postfix(|base, op| {
            let base = Box::new(base?);
            match op.as_rule() {
                Rule::call => {
                    let args = op
                        .into_inner()
                        .map(|arg| parse_expr(arg.into_inner()))
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(CExpr::Call(base, args))
                }
                Rule::index => {
                    let idx = op
                        .into_inner()
                        .next()
                        .ok_or_else(|| "missing index expression".to_string())?;
                    Ok(CExpr::Index(base, Box::new(parse_expr(idx.into_inner())?)))
                }
                Rule::arrow | Rule::member => {
                    let arrow = op.as_rule() == Rule::arrow;
                    let field = op
                        .into_inner()
                        .next()
                        .map(|f| f.as_str().to_string())
                        .ok_or_else(|| "missing field name".to_string())?;
                    Ok(CExpr::Member { base, field, arrow })
                }
                rule => unreachable!("CExpr::parse expected postfix operation, found {:?}", rule),
            }
        })
        .parse(pairs)
}

/// Captures collected while comparing a pattern against a concrete tree
pub type Captures = FxHashMap<u32, String>;

impl CStatement {
    /// Structurally compares the pattern `self` against `actual`.
    /// On success the captures of the pattern are added to `captures`;
    /// on failure `captures` is left untouched.
    pub fn matches(&self, actual: &CStatement, captures: &mut Captures) -> bool {
        let mut local = Captures::default();
        let matched = match (self, actual) {
            // a lone wildcard stands for the whole statement
            (CStatement::Expr(CExpr::Joker(joker)), _) => {
                bind(*joker, actual.to_string().trim_end_matches(';'), &mut local);
                true
            }
            (CStatement::Expr(p), CStatement::Expr(a)) => p.compare(a, &mut local),
            (CStatement::Return(p), CStatement::Return(a)) => compare_opt(p, a, &mut local),
            (
                CStatement::Decl {
                    ty: p_ty,
                    pointer_depth: p_depth,
                    name: p_name,
                    init: p_init,
                },
                CStatement::Decl {
                    ty: a_ty,
                    pointer_depth: a_depth,
                    name: a_name,
                    init: a_init,
                },
            ) => {
                p_ty == a_ty
                    && p_depth == a_depth
                    && p_name == a_name
                    && compare_opt(p_init, a_init, &mut local)
            }
            _ => false,
        };
        if matched {
            captures.extend(local);
        }
        matched
    }
}

fn compare_opt(pattern: &Option<CExpr>, actual: &Option<CExpr>, captures: &mut Captures) -> bool {
    match (pattern, actual) {
        (None, None) => true,
        (Some(p), Some(a)) => p.compare(a, captures),
        _ => false,
    }
}

fn bind(joker: Joker, text: &str, captures: &mut Captures) {
    if let Joker::Capture(n) = joker {
        captures.insert(n, text.to_string());
    }
}

impl CExpr {
    fn compare(&self, actual: &CExpr, captures: &mut Captures) -> bool {
        use CExpr::*;
        match (self, actual) {
            (CExpr::Joker(joker), _) => {
                bind(*joker, &actual.to_string(), captures);
                true
            }
            (Id(p), Id(a)) => p == a,
            (IntLit(p), IntLit(a)) => p == a,
            (CharLit(p), CharLit(a)) => p == a,
            (StringLit(p), StringLit(a)) => p == a,
            (Unary(p_op, p), Unary(a_op, a)) => p_op == a_op && p.compare(a, captures),
            (Binary(p_op, p_lhs, p_rhs), Binary(a_op, a_lhs, a_rhs)) => {
                p_op == a_op && p_lhs.compare(a_lhs, captures) && p_rhs.compare(a_rhs, captures)
            }
            (Assign(p_lhs, p_rhs), Assign(a_lhs, a_rhs)) => {
                p_lhs.compare(a_lhs, captures) && p_rhs.compare(a_rhs, captures)
            }
            (Call(p_fn, p_args), Call(a_fn, a_args)) => {
                p_args.len() == a_args.len()
                    && p_fn.compare(a_fn, captures)
                    && p_args
                        .iter()
                        .zip(a_args)
                        .all(|(p, a)| p.compare(a, captures))
            }
            (Index(p_base, p_idx), Index(a_base, a_idx)) => {
                p_base.compare(a_base, captures) && p_idx.compare(a_idx, captures)
            }
            (
                Member {
                    base: p_base,
                    field: p_field,
                    arrow: p_arrow,
                },
                Member {
                    base: a_base,
                    field: a_field,
                    arrow: a_arrow,
                },
            ) => p_field == a_field && p_arrow == a_arrow && p_base.compare(a_base, captures),
            _ => false,
        }
    }

    /// Binding strength used to decide where parentheses are needed when rendering
    fn precedence(&self) -> u8 {
        match self {
            CExpr::Assign(..) => 1,
            CExpr::Binary(op, ..) => op.precedence(),
            CExpr::Unary(..) => 13,
            CExpr::Call(..) | CExpr::Index(..) | CExpr::Member { .. } => 14,
            _ => 15,
        }
    }

    fn fmt_operand(&self, f: &mut fmt::Formatter<'_>, min: u8) -> fmt::Result {
        if self.precedence() < min {
            write!(f, "({})", self)
        } else {
            write!(f, "{}", self)
        }
    }
}

impl BinaryOp {
    fn precedence(&self) -> u8 {
        use BinaryOp::*;
        match self {
            Or => 2,
            And => 3,
            BitOr => 4,
            BitXor => 5,
            BitAnd => 6,
            Equal | NotEqual => 7,
            Less | Greater | LessEqual | GreaterEqual => 8,
            ShiftLeft | ShiftRight => 9,
            Plus | Minus => 10,
            Times | Divide | Modulo => 11,
        }
    }
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnaryOp::Neg => "-",
            UnaryOp::Not => "!",
            UnaryOp::BitNot => "~",
            UnaryOp::Deref => "*",
            UnaryOp::AddrOf => "&",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use BinaryOp::*;
        let s = match self {
            Or => "||",
            And => "&&",
            BitOr => "|",
            BitXor => "^",
            BitAnd => "&",
            Equal => "==",
            NotEqual => "!=",
            Less => "<",
            Greater => ">",
            LessEqual => "<=",
            GreaterEqual => ">=",
            ShiftLeft => "<<",
            ShiftRight => ">>",
            Plus => "+",
            Minus => "-",
            Times => "*",
            Divide => "/",
            Modulo => "%",
        };
        write!(f, "{}", s)
    }
}

/// Canonical rendering, independent of the original spelling and spacing
impl fmt::Display for CExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CExpr::Id(name) => write!(f, "{}", name),
            CExpr::IntLit(value) => write!(f, "{}", value),
            CExpr::CharLit(text) | CExpr::StringLit(text) => write!(f, "{}", text),
            CExpr::Joker(Joker::Any) => write!(f, "$?"),
            CExpr::Joker(Joker::Capture(n)) => write!(f, "${}", n),
            CExpr::Unary(op, arg) => {
                write!(f, "{}", op)?;
                arg.fmt_operand(f, 13)
            }
            CExpr::Binary(op, lhs, rhs) => {
                let prec = op.precedence();
                lhs.fmt_operand(f, prec)?;
                write!(f, " {} ", op)?;
                // left associative: an equally strong rhs needs parentheses
                rhs.fmt_operand(f, prec + 1)
            }
            CExpr::Assign(lhs, rhs) => {
                lhs.fmt_operand(f, 2)?;
                write!(f, " = ")?;
                rhs.fmt_operand(f, 1)
            }
            CExpr::Call(callee, args) => {
                callee.fmt_operand(f, 14)?;
                write!(f, "(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            CExpr::Index(base, idx) => {
                base.fmt_operand(f, 14)?;
                write!(f, "[{}]", idx)
            }
            CExpr::Member { base, field, arrow } => {
                base.fmt_operand(f, 14)?;
                write!(f, "{}{}", if *arrow { "->" } else { "." }, field)
            }
        }
    }
}

impl fmt::Display for CStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CStatement::Expr(expr) => write!(f, "{};", expr),
            CStatement::Return(None) => write!(f, "return;"),
            CStatement::Return(Some(expr)) => write!(f, "return {};", expr),
            CStatement::Decl {
                ty,
                pointer_depth,
                name,
                init,
            } => {
                write!(f, "{} {}{}", ty, "*".repeat(*pointer_depth), name)?;
                if let Some(init) = init {
                    write!(f, " = {}", init)?;
                }
                write!(f, ";")
            }
        }
    }
}
