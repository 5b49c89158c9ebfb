/*!
# Typed Expression Trees

Model parameter expressions are compiled into a small typed tree evaluated
against the per-chain node values. Identifiers are resolved once at build
time: data references are constant-folded away, node references become
[`Expr::Site`] (or [`Expr::Elem`] for one component of a vector-valued site),
so evaluation during sampling never touches a symbol table.
*/

/// Index of a site (node) in the compiled graph.
pub type SiteId = usize;

/// A node value in one chain's state: scalar for most sites, a fixed-length
/// vector for simplex-valued (Dirichlet) sites.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(f64),
    Vector(Vec<f64>),
}

impl Value {
    /// Returns the scalar payload, or `None` for vector values.
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Value::Scalar(x) => Some(*x),
            Value::Vector(_) => None,
        }
    }

    /// Number of scalar components.
    pub fn dim(&self) -> usize {
        match self {
            Value::Scalar(_) => 1,
            Value::Vector(v) => v.len(),
        }
    }

    /// Flattens this value into scalar components.
    pub fn components(&self) -> Vec<f64> {
        match self {
            Value::Scalar(x) => vec![*x],
            Value::Vector(v) => v.clone(),
        }
    }
}

/// Binary arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

/// Unary functions available inside model expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryFn {
    Neg,
    Sqrt,
    Exp,
    Log,
    Abs,
}

impl UnaryFn {
    /// Looks up a function by its name in the model language.
    pub fn from_name(name: &str) -> Option<UnaryFn> {
        match name {
            "sqrt" => Some(UnaryFn::Sqrt),
            "exp" => Some(UnaryFn::Exp),
            "log" => Some(UnaryFn::Log),
            "abs" => Some(UnaryFn::Abs),
            _ => None,
        }
    }

    pub fn apply(&self, x: f64) -> f64 {
        match self {
            UnaryFn::Neg => -x,
            UnaryFn::Sqrt => x.sqrt(),
            UnaryFn::Exp => x.exp(),
            UnaryFn::Log => x.ln(),
            UnaryFn::Abs => x.abs(),
        }
    }
}

/// A compiled expression. All symbols are resolved; evaluation only needs
/// the current chain state and the graph (for lazy deterministic sites).
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A literal or constant-folded data value.
    Const(f64),
    /// A constant-folded data array, e.g. Dirichlet concentrations.
    ConstVec(Vec<f64>),
    /// The value of another site.
    Site(SiteId),
    /// One component (0-based) of a vector-valued site.
    Elem(SiteId, usize),
    Unary(UnaryFn, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Collects every site referenced directly by this expression.
    pub fn referenced_sites(&self, out: &mut Vec<SiteId>) {
        match self {
            Expr::Const(_) | Expr::ConstVec(_) => {}
            Expr::Site(id) | Expr::Elem(id, _) => out.push(*id),
            Expr::Unary(_, a) => a.referenced_sites(out),
            Expr::Binary(_, a, b) => {
                a.referenced_sites(out);
                b.referenced_sites(out);
            }
        }
    }

    /// True if this expression is exactly a bare reference to `site`.
    pub fn is_ref_to(&self, site: SiteId) -> bool {
        matches!(self, Expr::Site(id) if *id == site)
    }
}

pub fn apply_binop(op: BinOp, a: f64, b: f64) -> f64 {
    match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        BinOp::Pow => a.powf(b),
    }
}
