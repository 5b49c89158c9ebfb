/*!
# Model Language Parser

Parses the BUGS-flavoured model text into a raw AST using the Pest parser
generator. This is a purely syntactic pass: identifiers are not resolved and
loops are not unrolled here; both happen in [`crate::graph`] where the data
bindings are available.

## Example

```rust
use gibbsgraph::parser::parse_model;

let ast = parse_model(
    "model {
        theta ~ dnorm(0, 1.0e-2)
        x ~ dnorm(theta, 1)
    }",
)
.unwrap();
assert_eq!(ast.stmts.len(), 2);
```
*/

use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;

use crate::error::BuildError;
use crate::expr::BinOp;

#[derive(Parser)]
#[grammar = "model.pest"]
struct ModelParser;

/// An unresolved expression as written in the model text.
#[derive(Debug, Clone, PartialEq)]
pub enum RawExpr {
    Number(f64),
    Ident(String),
    /// `name[index]`
    Index(String, Box<RawExpr>),
    /// Unary minus.
    Neg(Box<RawExpr>),
    Binary(BinOp, Box<RawExpr>, Box<RawExpr>),
    /// `name(args...)` calls, e.g. `sqrt` and `pow`.
    Call(String, Vec<RawExpr>),
}

/// The left-hand side of a relation: a bare name or one indexed element.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetRef {
    pub name: String,
    pub index: Option<RawExpr>,
}

/// One statement of the model body.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `target ~ dist(args...)`
    Stochastic {
        target: TargetRef,
        dist: String,
        args: Vec<RawExpr>,
    },
    /// `target <- expr`
    Deterministic { target: TargetRef, expr: RawExpr },
    /// `for (var in from:to) { body }`
    For {
        var: String,
        from: RawExpr,
        to: RawExpr,
        body: Vec<Stmt>,
    },
}

/// A parsed model body.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelAst {
    pub stmts: Vec<Stmt>,
}

/// Parses model source text into an AST.
pub fn parse_model(source: &str) -> Result<ModelAst, BuildError> {
    let mut pairs = ModelParser::parse(Rule::model, source)
        .map_err(|e| BuildError::Parse(e.to_string()))?;
    let model = pairs.next().expect("grammar yields exactly one model pair");
    let mut stmts = Vec::new();
    for inner in model.into_inner() {
        match inner.as_rule() {
            Rule::EOI => {}
            _ => stmts.push(build_stmt(inner)?),
        }
    }
    Ok(ModelAst { stmts })
}

fn build_stmt(pair: Pair<Rule>) -> Result<Stmt, BuildError> {
    match pair.as_rule() {
        Rule::for_loop => {
            let mut inner = pair.into_inner();
            let var = inner.next().expect("loop variable").as_str().to_string();
            let from = build_expr(inner.next().expect("loop lower bound"))?;
            let to = build_expr(inner.next().expect("loop upper bound"))?;
            let body = inner.map(build_stmt).collect::<Result<Vec<_>, _>>()?;
            Ok(Stmt::For {
                var,
                from,
                to,
                body,
            })
        }
        Rule::stochastic => {
            let mut inner = pair.into_inner();
            let target = build_target(inner.next().expect("relation target"))?;
            let dist = inner.next().expect("distribution name").as_str().to_string();
            let args = match inner.next() {
                Some(list) => build_arg_list(list)?,
                None => Vec::new(),
            };
            Ok(Stmt::Stochastic { target, dist, args })
        }
        Rule::deterministic => {
            let mut inner = pair.into_inner();
            let target = build_target(inner.next().expect("relation target"))?;
            let expr = build_expr(inner.next().expect("relation expression"))?;
            Ok(Stmt::Deterministic { target, expr })
        }
        other => unreachable!("unexpected statement rule {other:?}"),
    }
}

fn build_target(pair: Pair<Rule>) -> Result<TargetRef, BuildError> {
    let mut inner = pair.into_inner();
    let name = inner.next().expect("target name").as_str().to_string();
    let index = inner.next().map(build_expr).transpose()?;
    Ok(TargetRef { name, index })
}

fn build_arg_list(pair: Pair<Rule>) -> Result<Vec<RawExpr>, BuildError> {
    pair.into_inner().map(build_expr).collect()
}

fn build_expr(pair: Pair<Rule>) -> Result<RawExpr, BuildError> {
    match pair.as_rule() {
        Rule::expr | Rule::term => build_binary_chain(pair),
        Rule::neg => {
            let inner = pair.into_inner().next().expect("negated operand");
            Ok(RawExpr::Neg(Box::new(build_expr(inner)?)))
        }
        Rule::power => {
            let mut inner = pair.into_inner();
            let base = build_expr(inner.next().expect("power base"))?;
            match inner.next() {
                Some(exponent) => Ok(RawExpr::Binary(
                    BinOp::Pow,
                    Box::new(base),
                    Box::new(build_expr(exponent)?),
                )),
                None => Ok(base),
            }
        }
        Rule::number => {
            let text = pair.as_str();
            let value: f64 = text
                .parse()
                .map_err(|_| BuildError::Parse(format!("invalid number literal '{text}'")))?;
            Ok(RawExpr::Number(value))
        }
        Rule::call => {
            let mut inner = pair.into_inner();
            let name = inner.next().expect("function name").as_str().to_string();
            let args = match inner.next() {
                Some(list) => build_arg_list(list)?,
                None => Vec::new(),
            };
            Ok(RawExpr::Call(name, args))
        }
        Rule::indexed => {
            let mut inner = pair.into_inner();
            let name = inner.next().expect("array name").as_str().to_string();
            let index = build_expr(inner.next().expect("index expression"))?;
            Ok(RawExpr::Index(name, Box::new(index)))
        }
        Rule::ident => Ok(RawExpr::Ident(pair.as_str().to_string())),
        other => unreachable!("unexpected expression rule {other:?}"),
    }
}

/// Left-folds `operand (op operand)*` pairs into a binary tree.
fn build_binary_chain(pair: Pair<Rule>) -> Result<RawExpr, BuildError> {
    let mut inner = pair.into_inner();
    let mut acc = build_expr(inner.next().expect("leading operand"))?;
    while let Some(op_pair) = inner.next() {
        let op = match op_pair.as_str() {
            "+" => BinOp::Add,
            "-" => BinOp::Sub,
            "*" => BinOp::Mul,
            "/" => BinOp::Div,
            other => unreachable!("unexpected operator '{other}'"),
        };
        let rhs = build_expr(inner.next().expect("trailing operand"))?;
        acc = RawExpr::Binary(op, Box::new(acc), Box::new(rhs));
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scalar_relations() {
        let ast = parse_model(
            "model {
                theta ~ dnorm(2.3, 4.0)
                x ~ dnorm(theta, 1.5625)
            }",
        )
        .unwrap();
        assert_eq!(ast.stmts.len(), 2);
        match &ast.stmts[0] {
            Stmt::Stochastic { target, dist, args } => {
                assert_eq!(target.name, "theta");
                assert!(target.index.is_none());
                assert_eq!(dist, "dnorm");
                assert_eq!(args, &[RawExpr::Number(2.3), RawExpr::Number(4.0)]);
            }
            other => panic!("expected stochastic relation, got {other:?}"),
        }
    }

    #[test]
    fn parses_loops_and_indexing() {
        let ast = parse_model(
            "model {
                for (i in 1:N) {
                    mu[i] <- alpha + beta * w[i]
                    y[i] ~ dnorm(mu[i], tau)
                }
            }",
        )
        .unwrap();
        match &ast.stmts[0] {
            Stmt::For { var, body, .. } => {
                assert_eq!(var, "i");
                assert_eq!(body.len(), 2);
                assert!(matches!(body[0], Stmt::Deterministic { .. }));
            }
            other => panic!("expected for loop, got {other:?}"),
        }
    }

    #[test]
    fn parses_operator_precedence() {
        let ast = parse_model("model { tau <- 1 / (sigma * sigma) }").unwrap();
        match &ast.stmts[0] {
            Stmt::Deterministic { expr, .. } => match expr {
                RawExpr::Binary(BinOp::Div, lhs, rhs) => {
                    assert_eq!(**lhs, RawExpr::Number(1.0));
                    assert!(matches!(**rhs, RawExpr::Binary(BinOp::Mul, _, _)));
                }
                other => panic!("expected division, got {other:?}"),
            },
            other => panic!("expected deterministic relation, got {other:?}"),
        }
    }

    #[test]
    fn parses_power_and_unary_minus() {
        let ast = parse_model("model { v <- -sigma ^ 2 }").unwrap();
        match &ast.stmts[0] {
            // `-sigma^2` binds the minus outside the power, as in R.
            Stmt::Deterministic { expr, .. } => {
                assert!(matches!(expr, RawExpr::Neg(_)));
            }
            other => panic!("expected deterministic relation, got {other:?}"),
        }
    }

    #[test]
    fn parses_comments_and_calls() {
        let ast = parse_model(
            "model {
                # precision from a half-width
                tau <- pow(width, -2)
                s <- sqrt(v)
            }",
        )
        .unwrap();
        assert_eq!(ast.stmts.len(), 2);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(matches!(
            parse_model("model { theta ~ }"),
            Err(BuildError::Parse(_))
        ));
        assert!(matches!(
            parse_model("theta ~ dnorm(0, 1)"),
            Err(BuildError::Parse(_))
        ));
    }
}
