//! Parsed expression tree.

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchOp {
    Eq,
    Neq,
    Re,
    Nre,
}

#[derive(Debug, Clone)]
pub struct LabelMatcher {
    pub name: String,
    pub op: MatchOp,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct VectorSelector {
    pub name: String,
    pub matchers: Vec<LabelMatcher>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    And,
    Or,
    Unless,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AggOp {
    Sum,
    Avg,
    Min,
    Max,
    Count,
    Stddev,
    Stdvar,
    Topk,
    Bottomk,
    Quantile,
    CountValues,
}

#[derive(Debug, Clone)]
pub enum Expr {
    NumberLiteral(f64),
    VectorSelector(VectorSelector),
    RangeSelector {
        selector: VectorSelector,
        duration_secs: f64,
    },
    UnaryExpr {
        negate: bool,
        expr: Box<Expr>,
    },
    BinaryExpr {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    AggregateExpr {
        op: AggOp,
        expr: Box<Expr>,
        group_labels: Vec<String>,
        without: bool,
        /// Parameter for `topk`/`bottomk`/`quantile`/`count_values`.
        param: Option<Box<Expr>>,
    },
    FunctionCall {
        name: String,
        args: Vec<Expr>,
    },
}
