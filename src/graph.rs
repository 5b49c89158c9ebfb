/*!
# Model Graph Builder

Compiles a parsed model plus concrete data bindings into an immutable
directed acyclic graph of *sites*. Loops are unrolled against the bound data
sizes, every identifier is resolved (data references are constant-folded),
a topological order is computed, and each unobserved stochastic site gets an
update kernel assigned once, up front.

The resulting [`Graph`] is read-only and shared by reference across all
chains; per-chain mutable state lives in the sampler.

## Example

```rust
use gibbsgraph::graph::{DataBindings, Graph};

let data = DataBindings::new().scalar("x", 3.1);
let graph = Graph::compile(
    "model {
        theta ~ dnorm(2.3, 4.0)
        x ~ dnorm(theta, 1.5625)
    }",
    &data,
)
.unwrap();
assert_eq!(graph.len(), 2);
assert_eq!(graph.sweep_order().len(), 1); // only theta is sampled
```
*/

use std::collections::{BTreeSet, HashMap};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use rand::rngs::SmallRng;

use crate::classify::classify;
use crate::dist::{self, Family};
use crate::error::{BuildError, RunError};
use crate::expr::{apply_binop, BinOp, Expr, SiteId, UnaryFn, Value};
use crate::kernel::KernelKind;
use crate::parser::{parse_model, ModelAst, RawExpr, Stmt, TargetRef};

/// Numeric inputs supplied alongside the model text: scalars, vectors, and
/// indexed lookup arrays (e.g. group membership).
#[derive(Debug, Clone, Default)]
pub struct DataBindings {
    scalars: HashMap<String, f64>,
    vectors: HashMap<String, Vec<f64>>,
}

impl DataBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scalar(mut self, name: &str, value: f64) -> Self {
        self.scalars.insert(name.to_string(), value);
        self
    }

    pub fn vector(mut self, name: &str, values: impl Into<Vec<f64>>) -> Self {
        self.vectors.insert(name.to_string(), values.into());
        self
    }

    pub fn get_scalar(&self, name: &str) -> Option<f64> {
        self.scalars.get(name).copied()
    }

    pub fn get_vector(&self, name: &str) -> Option<&[f64]> {
        self.vectors.get(name).map(|v| v.as_slice())
    }

    fn binds(&self, name: &str) -> bool {
        self.scalars.contains_key(name) || self.vectors.contains_key(name)
    }
}

/// What a site is and how it behaves during sampling.
#[derive(Debug, Clone)]
pub enum Role {
    /// A sampled or observed quantity with a distribution.
    Stochastic {
        family: Family,
        params: Vec<Expr>,
        /// Update kernel, selected once at build time. `None` for observed
        /// sites, which are never updated.
        kernel: Option<KernelKind>,
        /// Fixed value from the data bindings, if observed.
        observed: Option<Value>,
    },
    /// A pure function of parent sites, recomputed whenever read.
    Deterministic { expr: Expr },
}

/// One node of the compiled graph.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub role: Role,
    /// Scalar components carried by this site (1 except for simplex sites).
    pub dim: usize,
    /// Stochastic sites whose parameters reference this site, directly or
    /// through deterministic intermediates. This is the likelihood side of
    /// the site's Markov blanket.
    pub children: Vec<SiteId>,
}

impl Node {
    /// True for stochastic sites that are actually sampled.
    pub fn is_sampled(&self) -> bool {
        matches!(
            self.role,
            Role::Stochastic { observed: None, .. }
        )
    }

    pub fn is_observed(&self) -> bool {
        matches!(
            self.role,
            Role::Stochastic {
                observed: Some(_),
                ..
            }
        )
    }

    pub fn is_deterministic(&self) -> bool {
        matches!(self.role, Role::Deterministic { .. })
    }

    pub fn family(&self) -> Option<Family> {
        match &self.role {
            Role::Stochastic { family, .. } => Some(*family),
            Role::Deterministic { .. } => None,
        }
    }

    pub fn params(&self) -> &[Expr] {
        match &self.role {
            Role::Stochastic { params, .. } => params,
            Role::Deterministic { .. } => &[],
        }
    }

    pub fn kernel(&self) -> Option<KernelKind> {
        match &self.role {
            Role::Stochastic { kernel, .. } => *kernel,
            Role::Deterministic { .. } => None,
        }
    }
}

/// The compiled, immutable model graph.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<Node>,
    index: HashMap<String, SiteId>,
    topo: Vec<SiteId>,
    sweep: Vec<SiteId>,
}

impl Graph {
    /// Parses and builds in one step.
    pub fn compile(source: &str, data: &DataBindings) -> Result<Graph, BuildError> {
        let ast = parse_model(source)?;
        Graph::build(&ast, data)
    }

    /// Builds the graph from a parsed model and data bindings. All build
    /// errors are fatal; no partial graph is returned.
    pub fn build(ast: &ModelAst, data: &DataBindings) -> Result<Graph, BuildError> {
        Builder::new(data).build(ast)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: SiteId) -> &Node {
        &self.nodes[id]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Looks a site up by its flattened name, e.g. `"y[3]"` or `"theta"`.
    pub fn site(&self, name: &str) -> Option<SiteId> {
        self.index.get(name).copied()
    }

    /// All sites, parents before children.
    pub fn topo_order(&self) -> &[SiteId] {
        &self.topo
    }

    /// The sites updated once per sweep: unobserved stochastic sites in
    /// topological order.
    pub fn sweep_order(&self) -> &[SiteId] {
        &self.sweep
    }

    /// Evaluates an expression against a chain state. Deterministic sites
    /// are recomputed on the fly, never read from stale storage.
    pub(crate) fn eval_raw(&self, expr: &Expr, state: &[Value]) -> Result<Value, String> {
        match expr {
            Expr::Const(x) => Ok(Value::Scalar(*x)),
            Expr::ConstVec(v) => Ok(Value::Vector(v.clone())),
            Expr::Site(id) => match &self.nodes[*id].role {
                Role::Deterministic { expr } => self.eval_raw(expr, state),
                Role::Stochastic { .. } => Ok(state[*id].clone()),
            },
            Expr::Elem(id, k) => match &state[*id] {
                Value::Vector(v) => v
                    .get(*k)
                    .map(|x| Value::Scalar(*x))
                    .ok_or_else(|| format!("component {} out of range", k + 1)),
                Value::Scalar(_) => Err(format!(
                    "site '{}' is scalar but was indexed",
                    self.nodes[*id].name
                )),
            },
            Expr::Unary(f, a) => Ok(Value::Scalar(f.apply(self.eval_scalar_raw(a, state)?))),
            Expr::Binary(op, a, b) => Ok(Value::Scalar(apply_binop(
                *op,
                self.eval_scalar_raw(a, state)?,
                self.eval_scalar_raw(b, state)?,
            ))),
        }
    }

    fn eval_scalar_raw(&self, expr: &Expr, state: &[Value]) -> Result<f64, String> {
        self.eval_raw(expr, state)?
            .as_scalar()
            .ok_or_else(|| "vector value used in scalar context".to_string())
    }

    /// Evaluates a site's distribution parameters against a chain state.
    pub fn eval_params(&self, site: SiteId, state: &[Value]) -> Result<Vec<Value>, RunError> {
        let node = &self.nodes[site];
        node.params()
            .iter()
            .map(|p| {
                self.eval_raw(p, state).map_err(|detail| RunError::InvalidParameter {
                    node: node.name.clone(),
                    detail,
                })
            })
            .collect()
    }

    /// Current value of a site, recomputing deterministic sites lazily.
    pub fn site_value(&self, site: SiteId, state: &[Value]) -> Result<Value, RunError> {
        match &self.nodes[site].role {
            Role::Deterministic { expr } => {
                self.eval_raw(expr, state).map_err(|detail| RunError::InvalidParameter {
                    node: self.nodes[site].name.clone(),
                    detail,
                })
            }
            Role::Stochastic { .. } => Ok(state[site].clone()),
        }
    }

    /// Log-density of the site's own prior at its current value.
    pub fn log_prior(&self, site: SiteId, state: &[Value]) -> Result<f64, RunError> {
        let node = &self.nodes[site];
        let family = node
            .family()
            .expect("log_prior is only defined for stochastic sites");
        let params = self.eval_params(site, state)?;
        dist::log_prob(family, &state[site], &params).map_err(|detail| {
            RunError::InvalidParameter {
                node: node.name.clone(),
                detail,
            }
        })
    }

    /// Summed log-likelihood contribution of every stochastic child of the
    /// site, evaluated at the current state.
    pub fn children_log_likelihood(&self, site: SiteId, state: &[Value]) -> Result<f64, RunError> {
        let mut total = 0.0;
        for &child in &self.nodes[site].children {
            let child_node = &self.nodes[child];
            let family = child_node
                .family()
                .expect("children lists contain only stochastic sites");
            let params = self.eval_params(child, state)?;
            total += dist::log_prob(family, &state[child], &params).map_err(|detail| {
                RunError::InvalidParameter {
                    node: child_node.name.clone(),
                    detail,
                }
            })?;
        }
        Ok(total)
    }

    /// Unnormalized log-posterior of one site: its log-prior plus its
    /// children's log-likelihood. This is the Metropolis target.
    pub fn log_posterior(&self, site: SiteId, state: &[Value]) -> Result<f64, RunError> {
        let lp = self.log_prior(site, state)?;
        if lp == f64::NEG_INFINITY {
            // Out of support; children cannot rescue the proposal and may
            // not even be evaluable there.
            return Ok(f64::NEG_INFINITY);
        }
        Ok(lp + self.children_log_likelihood(site, state)?)
    }

    /// True if `expr` depends on `site`, directly or through deterministic
    /// intermediates.
    pub fn expr_depends_on(&self, expr: &Expr, site: SiteId) -> bool {
        expr_depends_on(&self.nodes, expr, site)
    }

    /// Builds one chain's initial state: observed sites take their data
    /// values, sampled sites take explicit initial values when supplied and
    /// independent prior draws otherwise (in topological order, parents
    /// before children).
    pub fn init_state(
        &self,
        rng: &mut SmallRng,
        explicit: Option<&HashMap<String, Value>>,
    ) -> Result<Vec<Value>, RunError> {
        if let Some(map) = explicit {
            for name in map.keys() {
                match self.site(name) {
                    Some(id) if self.nodes[id].is_sampled() => {}
                    Some(_) => {
                        return Err(RunError::BadInitialValue {
                            node: name.clone(),
                            detail: "not a sampled stochastic node".to_string(),
                        })
                    }
                    None => {
                        return Err(RunError::BadInitialValue {
                            node: name.clone(),
                            detail: "no such node".to_string(),
                        })
                    }
                }
            }
        }

        let mut state = vec![Value::Scalar(f64::NAN); self.nodes.len()];
        for &id in &self.topo {
            let node = &self.nodes[id];
            match &node.role {
                Role::Deterministic { .. } => {} // recomputed lazily on read
                Role::Stochastic {
                    family,
                    observed,
                    ..
                } => {
                    if let Some(v) = observed {
                        state[id] = v.clone();
                        continue;
                    }
                    if let Some(v) = explicit.and_then(|m| m.get(&node.name)) {
                        if v.dim() != node.dim {
                            return Err(RunError::BadInitialValue {
                                node: node.name.clone(),
                                detail: format!(
                                    "expected {} component(s), got {}",
                                    node.dim,
                                    v.dim()
                                ),
                            });
                        }
                        state[id] = v.clone();
                        continue;
                    }
                    let params = self.eval_params(id, &state)?;
                    state[id] = dist::sample(*family, &params, rng).map_err(|detail| {
                        RunError::InvalidParameter {
                            node: node.name.clone(),
                            detail,
                        }
                    })?;
                }
            }
        }
        Ok(state)
    }
}

// ── Builder ─────────────────────────────────────────────────────────

/// A declaration after loop unrolling: concrete site name, grounded
/// expressions (loop variables substituted by their values).
enum FlatDecl {
    Stochastic {
        name: String,
        base: String,
        index: Option<i64>,
        dist: String,
        args: Vec<RawExpr>,
    },
    Deterministic {
        name: String,
        expr: RawExpr,
    },
}

struct Builder<'a> {
    data: &'a DataBindings,
    decls: Vec<FlatDecl>,
    index: HashMap<String, SiteId>,
}

impl<'a> Builder<'a> {
    fn new(data: &'a DataBindings) -> Self {
        Self {
            data,
            decls: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn build(mut self, ast: &ModelAst) -> Result<Graph, BuildError> {
        let mut env = HashMap::new();
        self.unroll(&ast.stmts, &mut env)?;

        // Pass A: register every site so later expressions can reference
        // earlier-or-later declarations (the language is order-free).
        let mut nodes = Vec::with_capacity(self.decls.len());
        for decl in &self.decls {
            let (name, node) = match decl {
                FlatDecl::Stochastic {
                    name,
                    base,
                    index,
                    dist,
                    args,
                } => {
                    let family = Family::from_name(dist).ok_or_else(|| {
                        BuildError::UnsupportedDistribution { name: dist.clone() }
                    })?;
                    if args.len() != family.arity() {
                        return Err(BuildError::Parse(format!(
                            "{dist} expects {} parameter(s), got {}",
                            family.arity(),
                            args.len()
                        )));
                    }
                    let dim = if family.is_vector_valued() {
                        self.dirichlet_dim(name, args)?
                    } else {
                        1
                    };
                    let observed = self.observed_value(base, *index, dim)?;
                    (
                        name.clone(),
                        Node {
                            name: name.clone(),
                            role: Role::Stochastic {
                                family,
                                params: Vec::new(),
                                kernel: None,
                                observed,
                            },
                            dim,
                            children: Vec::new(),
                        },
                    )
                }
                FlatDecl::Deterministic { name, .. } => (
                    name.clone(),
                    Node {
                        name: name.clone(),
                        role: Role::Deterministic {
                            expr: Expr::Const(f64::NAN),
                        },
                        dim: 1,
                        children: Vec::new(),
                    },
                ),
            };
            if self.index.insert(name.clone(), nodes.len()).is_some() {
                return Err(BuildError::DuplicateNode { name });
            }
            nodes.push(node);
        }

        // Pass B: compile expressions now that every site is known.
        let decls = std::mem::take(&mut self.decls);
        for (id, decl) in decls.iter().enumerate() {
            match decl {
                FlatDecl::Stochastic { args, .. } => {
                    let params = args
                        .iter()
                        .map(|a| self.compile_expr(a, &nodes))
                        .collect::<Result<Vec<_>, _>>()?;
                    if let Role::Stochastic { params: slot, .. } = &mut nodes[id].role {
                        *slot = params;
                    }
                }
                FlatDecl::Deterministic { expr, .. } => {
                    let compiled = self.compile_expr(expr, &nodes)?;
                    nodes[id].role = Role::Deterministic { expr: compiled };
                }
            }
        }

        // Topological order over parent→child edges via petgraph.
        let mut dag = DiGraph::<SiteId, ()>::new();
        for id in 0..nodes.len() {
            dag.add_node(id);
        }
        for (id, node) in nodes.iter().enumerate() {
            let mut parents = Vec::new();
            match &node.role {
                Role::Stochastic { params, .. } => {
                    for p in params {
                        p.referenced_sites(&mut parents);
                    }
                }
                Role::Deterministic { expr } => expr.referenced_sites(&mut parents),
            }
            parents.sort_unstable();
            parents.dedup();
            for parent in parents {
                dag.add_edge(NodeIndex::new(parent), NodeIndex::new(id), ());
            }
        }
        let topo = match toposort(&dag, None) {
            Ok(order) => order.into_iter().map(|ix| ix.index()).collect::<Vec<_>>(),
            Err(cycle) => {
                let name = nodes[cycle.node_id().index()].name.clone();
                return Err(BuildError::CyclicDependency { name });
            }
        };

        // Children: the stochastic Markov blanket below each site.
        let mut children: Vec<BTreeSet<SiteId>> = vec![BTreeSet::new(); nodes.len()];
        for (child, node) in nodes.iter().enumerate() {
            if node.is_deterministic() {
                continue;
            }
            let mut ancestors = BTreeSet::new();
            for p in node.params() {
                collect_stochastic_refs(&nodes, p, &mut ancestors);
            }
            for parent in ancestors {
                if parent != child {
                    children[parent].insert(child);
                }
            }
        }
        for (id, set) in children.into_iter().enumerate() {
            nodes[id].children = set.into_iter().collect();
        }

        // Kernel selection, cached on each sampled site.
        for id in 0..nodes.len() {
            if !nodes[id].is_sampled() {
                continue;
            }
            let kernel = classify(id, &nodes);
            if let Role::Stochastic { kernel: slot, .. } = &mut nodes[id].role {
                *slot = Some(kernel);
            }
        }

        let sweep = topo
            .iter()
            .copied()
            .filter(|&id| nodes[id].is_sampled())
            .collect();
        Ok(Graph {
            nodes,
            index: self.index,
            topo,
            sweep,
        })
    }

    /// Unrolls statements, substituting loop variables into expressions.
    fn unroll(
        &mut self,
        stmts: &[Stmt],
        env: &mut HashMap<String, i64>,
    ) -> Result<(), BuildError> {
        for stmt in stmts {
            match stmt {
                Stmt::For {
                    var,
                    from,
                    to,
                    body,
                } => {
                    let lo = self.const_int(&ground(from, env), &format!("loop bound of '{var}'"))?;
                    let hi = self.const_int(&ground(to, env), &format!("loop bound of '{var}'"))?;
                    for i in lo..=hi {
                        env.insert(var.clone(), i);
                        self.unroll(body, env)?;
                    }
                    env.remove(var);
                }
                Stmt::Stochastic { target, dist, args } => {
                    let (name, index) = self.flat_target(target, env)?;
                    self.decls.push(FlatDecl::Stochastic {
                        name,
                        base: target.name.clone(),
                        index,
                        dist: dist.clone(),
                        args: args.iter().map(|a| ground(a, env)).collect(),
                    });
                }
                Stmt::Deterministic { target, expr } => {
                    let (name, _) = self.flat_target(target, env)?;
                    self.decls.push(FlatDecl::Deterministic {
                        name,
                        expr: ground(expr, env),
                    });
                }
            }
        }
        Ok(())
    }

    fn flat_target(
        &self,
        target: &TargetRef,
        env: &HashMap<String, i64>,
    ) -> Result<(String, Option<i64>), BuildError> {
        match &target.index {
            None => Ok((target.name.clone(), None)),
            Some(raw) => {
                let i = self.const_int(&ground(raw, env), &format!("index of '{}'", target.name))?;
                Ok((format!("{}[{}]", target.name, i), Some(i)))
            }
        }
    }

    /// Evaluates a build-time-constant expression: numbers, data scalars,
    /// and indexed data lookups with constant indices.
    fn const_eval(&self, raw: &RawExpr, context: &str) -> Result<f64, BuildError> {
        match raw {
            RawExpr::Number(x) => Ok(*x),
            RawExpr::Ident(name) => self.data.get_scalar(name).ok_or_else(|| {
                if self.index.contains_key(name) {
                    BuildError::NonConstantIndex {
                        context: context.to_string(),
                    }
                } else {
                    BuildError::UnknownSymbol { name: name.clone() }
                }
            }),
            RawExpr::Index(name, idx) => {
                let i = self.const_int(idx, context)?;
                let v = self
                    .data
                    .get_vector(name)
                    .ok_or_else(|| BuildError::UnknownSymbol { name: name.clone() })?;
                if i < 1 || i as usize > v.len() {
                    return Err(BuildError::DimensionMismatch {
                        name: name.clone(),
                        expected: i.max(1) as usize,
                        actual: v.len(),
                    });
                }
                Ok(v[i as usize - 1])
            }
            RawExpr::Neg(a) => Ok(-self.const_eval(a, context)?),
            RawExpr::Binary(op, a, b) => Ok(apply_binop(
                *op,
                self.const_eval(a, context)?,
                self.const_eval(b, context)?,
            )),
            RawExpr::Call(name, args) => {
                let f = UnaryFn::from_name(name).ok_or_else(|| BuildError::UnknownSymbol {
                    name: name.clone(),
                })?;
                if args.len() != 1 {
                    return Err(BuildError::Parse(format!(
                        "{name} expects 1 argument, got {}",
                        args.len()
                    )));
                }
                Ok(f.apply(self.const_eval(&args[0], context)?))
            }
        }
    }

    fn const_int(&self, raw: &RawExpr, context: &str) -> Result<i64, BuildError> {
        let x = self.const_eval(raw, context)?;
        if x.fract() != 0.0 {
            return Err(BuildError::NonConstantIndex {
                context: format!("{context} (non-integer value {x})"),
            });
        }
        Ok(x as i64)
    }

    /// A Dirichlet site's dimensionality comes from its concentration
    /// vector, which must name a data array.
    fn dirichlet_dim(&self, site: &str, args: &[RawExpr]) -> Result<usize, BuildError> {
        match &args[0] {
            RawExpr::Ident(name) => {
                if let Some(v) = self.data.get_vector(name) {
                    Ok(v.len())
                } else {
                    Err(BuildError::UnknownSymbol { name: name.clone() })
                }
            }
            _ => Err(BuildError::Parse(format!(
                "ddirch concentration for '{site}' must name a data vector"
            ))),
        }
    }

    /// If the declaration's base name is bound in the data, the site is
    /// observed and takes its value from the binding.
    fn observed_value(
        &self,
        base: &str,
        index: Option<i64>,
        dim: usize,
    ) -> Result<Option<Value>, BuildError> {
        if !self.data.binds(base) {
            return Ok(None);
        }
        match index {
            Some(i) => {
                let v = self
                    .data
                    .get_vector(base)
                    .ok_or_else(|| BuildError::DimensionMismatch {
                        name: base.to_string(),
                        expected: i.max(1) as usize,
                        actual: 1,
                    })?;
                if i < 1 || i as usize > v.len() {
                    return Err(BuildError::DimensionMismatch {
                        name: base.to_string(),
                        expected: i.max(1) as usize,
                        actual: v.len(),
                    });
                }
                Ok(Some(Value::Scalar(v[i as usize - 1])))
            }
            None => {
                if let Some(x) = self.data.get_scalar(base) {
                    Ok(Some(Value::Scalar(x)))
                } else {
                    let v = self.data.get_vector(base).expect("binds() checked");
                    if v.len() != dim {
                        return Err(BuildError::DimensionMismatch {
                            name: base.to_string(),
                            expected: dim,
                            actual: v.len(),
                        });
                    }
                    if dim == 1 {
                        Ok(Some(Value::Scalar(v[0])))
                    } else {
                        Ok(Some(Value::Vector(v.to_vec())))
                    }
                }
            }
        }
    }

    /// Resolves identifiers and folds data references into constants.
    fn compile_expr(&self, raw: &RawExpr, nodes: &[Node]) -> Result<Expr, BuildError> {
        match raw {
            RawExpr::Number(x) => Ok(Expr::Const(*x)),
            RawExpr::Ident(name) => {
                if let Some(&id) = self.index.get(name) {
                    Ok(Expr::Site(id))
                } else if let Some(x) = self.data.get_scalar(name) {
                    Ok(Expr::Const(x))
                } else if let Some(v) = self.data.get_vector(name) {
                    Ok(Expr::ConstVec(v.to_vec()))
                } else {
                    Err(BuildError::UnknownSymbol { name: name.clone() })
                }
            }
            RawExpr::Index(name, idx) => {
                let i = self.const_int(idx, &format!("index into '{name}'"))?;
                if let Some(&id) = self.index.get(&format!("{name}[{i}]")) {
                    return Ok(Expr::Site(id));
                }
                if let Some(&id) = self.index.get(name.as_str()) {
                    // One component of a vector-valued site.
                    let dim = nodes[id].dim;
                    if i < 1 || i as usize > dim {
                        return Err(BuildError::DimensionMismatch {
                            name: name.clone(),
                            expected: i.max(1) as usize,
                            actual: dim,
                        });
                    }
                    return Ok(Expr::Elem(id, i as usize - 1));
                }
                if let Some(v) = self.data.get_vector(name) {
                    if i < 1 || i as usize > v.len() {
                        return Err(BuildError::DimensionMismatch {
                            name: name.clone(),
                            expected: i.max(1) as usize,
                            actual: v.len(),
                        });
                    }
                    return Ok(Expr::Const(v[i as usize - 1]));
                }
                Err(BuildError::UnknownSymbol { name: name.clone() })
            }
            RawExpr::Neg(a) => Ok(Expr::Unary(
                UnaryFn::Neg,
                Box::new(self.compile_expr(a, nodes)?),
            )),
            RawExpr::Binary(op, a, b) => Ok(Expr::Binary(
                *op,
                Box::new(self.compile_expr(a, nodes)?),
                Box::new(self.compile_expr(b, nodes)?),
            )),
            RawExpr::Call(name, args) => {
                if name == "pow" {
                    if args.len() != 2 {
                        return Err(BuildError::Parse(format!(
                            "pow expects 2 arguments, got {}",
                            args.len()
                        )));
                    }
                    return Ok(Expr::Binary(
                        BinOp::Pow,
                        Box::new(self.compile_expr(&args[0], nodes)?),
                        Box::new(self.compile_expr(&args[1], nodes)?),
                    ));
                }
                let f = UnaryFn::from_name(name).ok_or_else(|| BuildError::UnknownSymbol {
                    name: name.clone(),
                })?;
                if args.len() != 1 {
                    return Err(BuildError::Parse(format!(
                        "{name} expects 1 argument, got {}",
                        args.len()
                    )));
                }
                Ok(Expr::Unary(f, Box::new(self.compile_expr(&args[0], nodes)?)))
            }
        }
    }
}

/// Substitutes loop variables with their current integer values.
fn ground(raw: &RawExpr, env: &HashMap<String, i64>) -> RawExpr {
    match raw {
        RawExpr::Number(_) => raw.clone(),
        RawExpr::Ident(name) => match env.get(name) {
            Some(&i) => RawExpr::Number(i as f64),
            None => raw.clone(),
        },
        RawExpr::Index(name, idx) => RawExpr::Index(name.clone(), Box::new(ground(idx, env))),
        RawExpr::Neg(a) => RawExpr::Neg(Box::new(ground(a, env))),
        RawExpr::Binary(op, a, b) => {
            RawExpr::Binary(*op, Box::new(ground(a, env)), Box::new(ground(b, env)))
        }
        RawExpr::Call(name, args) => RawExpr::Call(
            name.clone(),
            args.iter().map(|a| ground(a, env)).collect(),
        ),
    }
}

/// True if `expr` depends on `site`, directly or through deterministic
/// intermediates. Shared with the kernel classifier, which runs before the
/// `Graph` value exists.
pub(crate) fn expr_depends_on(nodes: &[Node], expr: &Expr, site: SiteId) -> bool {
    let mut refs = Vec::new();
    expr.referenced_sites(&mut refs);
    for id in refs {
        if id == site {
            return true;
        }
        if let Role::Deterministic { expr: det } = &nodes[id].role {
            if expr_depends_on(nodes, det, site) {
                return true;
            }
        }
    }
    false
}

/// Expands an expression's references into the set of stochastic sites it
/// depends on, looking through deterministic intermediates.
fn collect_stochastic_refs(nodes: &[Node], expr: &Expr, out: &mut BTreeSet<SiteId>) {
    let mut refs = Vec::new();
    expr.referenced_sites(&mut refs);
    for id in refs {
        match &nodes[id].role {
            Role::Deterministic { expr } => collect_stochastic_refs(nodes, expr, out),
            Role::Stochastic { .. } => {
                out.insert(id);
            }
        }
    }
}
