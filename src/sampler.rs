/*!
# Sampling Orchestrator

Runs independent Gibbs chains over a compiled [`Graph`], in parallel via
Rayon. Each chain owns its RNG (seeded as `seed + chain index`), its state
vector, and its Metropolis step sizes, so runs are bit-for-bit reproducible
for a fixed configuration regardless of thread scheduling.

A sweep updates every unobserved stochastic site once, in topological
order. Draws recorded after burn-in (and thinning) land in one
[`SampleTrace`] per chain; chain failures are carried per-chain in the
[`RunReport`] instead of tearing down sibling chains.

## Example

```rust
use gibbsgraph::graph::{DataBindings, Graph};
use gibbsgraph::sampler::{GibbsSampler, RunConfig};

let data = DataBindings::new().scalar("x", 3.1);
let graph = Graph::compile(
    "model {
        theta ~ dnorm(2.3, 4.0)
        x ~ dnorm(theta, 1.5625)
    }",
    &data,
)
.unwrap();
let config = RunConfig {
    n_chains: 2,
    n_iterations: 200,
    burn_in: 50,
    ..RunConfig::default()
};
let report = GibbsSampler::new(&graph, config).unwrap().run();
assert_eq!(report.traces().len(), 2);
```
*/

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use ndarray::{s, Array2, ArrayView1};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::error::RunError;
use crate::expr::{SiteId, Value};
use crate::graph::Graph;
use crate::kernel::{update_site, StepSize, UpdateCtx};

/// How each chain's sampled sites are initialized.
#[derive(Debug, Clone)]
pub enum InitPolicy {
    /// Independent draws from each site's prior, parents first.
    FromPrior,
    /// One map per chain, `node name -> value`. Sites missing from a map
    /// fall back to prior draws.
    Explicit(Vec<HashMap<String, Value>>),
}

/// Run configuration. `n_iterations` counts total sweeps per chain; the
/// first `burn_in` are discarded and every `thin`-th of the rest is
/// retained.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub n_chains: usize,
    pub n_iterations: usize,
    /// Must be strictly smaller than `n_iterations`.
    pub burn_in: usize,
    /// Keep every `thin`-th post-burn-in sweep (1 keeps everything).
    pub thin: usize,
    /// Chain `i` uses RNG seed `seed + i`.
    pub seed: u64,
    /// Nodes to record. `None` records every sampled site. Vector-valued
    /// sites expand to per-component columns (`p[1]`, `p[2]`, ...);
    /// deterministic sites may be monitored by name.
    pub monitors: Option<Vec<String>>,
    pub init: InitPolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            n_chains: 4,
            n_iterations: 5_000,
            burn_in: 1_000,
            thin: 1,
            seed: 0,
            monitors: None,
            init: InitPolicy::FromPrior,
        }
    }
}

/// Retained draws of one chain: rows are kept sweeps, columns are monitored
/// scalar components.
#[derive(Debug, Clone)]
pub struct SampleTrace {
    components: Arc<Vec<String>>,
    draws: Array2<f64>,
    /// Lifetime Metropolis acceptance rate per adaptively-updated site.
    acceptance: Vec<(String, f64)>,
}

impl SampleTrace {
    /// Column labels, e.g. `["theta", "p[1]", "p[2]"]`.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    pub fn draws(&self) -> &Array2<f64> {
        &self.draws
    }

    /// Number of retained draws.
    pub fn len(&self) -> usize {
        self.draws.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.draws.nrows() == 0
    }

    /// One component's retained draws, by label.
    pub fn column(&self, component: &str) -> Option<ArrayView1<'_, f64>> {
        let k = self.components.iter().position(|c| c == component)?;
        Some(self.draws.column(k))
    }

    /// `(site name, acceptance rate)` for every Metropolis-updated site.
    pub fn acceptance_rates(&self) -> &[(String, f64)] {
        &self.acceptance
    }

    /// Builds a synthetic trace for diagnostics tests.
    #[cfg(test)]
    pub(crate) fn from_raw(components: Vec<String>, draws: Array2<f64>) -> Self {
        Self {
            components: Arc::new(components),
            draws,
            acceptance: Vec::new(),
        }
    }
}

/// Per-chain outcomes of a run. A failed chain does not invalidate its
/// siblings' traces.
#[derive(Debug)]
pub struct RunReport {
    chains: Vec<Result<SampleTrace, RunError>>,
}

impl RunReport {
    /// Traces of the chains that completed.
    pub fn traces(&self) -> Vec<&SampleTrace> {
        self.chains.iter().filter_map(|c| c.as_ref().ok()).collect()
    }

    /// Errors of the chains that failed.
    pub fn failures(&self) -> Vec<&RunError> {
        self.chains.iter().filter_map(|c| c.as_ref().err()).collect()
    }

    /// `(chain index, outcome)` in chain order.
    pub fn chains(&self) -> &[Result<SampleTrace, RunError>] {
        &self.chains
    }

    /// All traces, or the first chain failure.
    pub fn expect_complete(self) -> Result<Vec<SampleTrace>, RunError> {
        self.chains.into_iter().collect()
    }
}

/// Cooperative cancellation flag, checked at sweep boundaries. Cancelled
/// chains return the draws retained so far.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// One monitored scalar column.
struct MonitorComponent {
    site: SiteId,
    /// 0-based component of a vector-valued site.
    elem: Option<usize>,
    label: String,
}

/// The Gibbs-sweep sampler over a compiled graph.
pub struct GibbsSampler<'a> {
    graph: &'a Graph,
    config: RunConfig,
    monitors: Vec<MonitorComponent>,
    labels: Arc<Vec<String>>,
}

impl<'a> GibbsSampler<'a> {
    /// Validates the configuration and resolves monitor names up front.
    pub fn new(graph: &'a Graph, config: RunConfig) -> Result<Self, RunError> {
        if config.n_chains == 0 {
            return Err(RunError::InvalidConfig {
                detail: "n_chains must be at least 1".to_string(),
            });
        }
        if config.n_iterations == 0 {
            return Err(RunError::InvalidConfig {
                detail: "n_iterations must be at least 1".to_string(),
            });
        }
        if config.burn_in >= config.n_iterations {
            return Err(RunError::InvalidConfig {
                detail: format!(
                    "burn_in ({}) must be smaller than n_iterations ({})",
                    config.burn_in, config.n_iterations
                ),
            });
        }
        if config.thin == 0 {
            return Err(RunError::InvalidConfig {
                detail: "thin must be at least 1".to_string(),
            });
        }
        if let InitPolicy::Explicit(maps) = &config.init {
            if maps.len() != config.n_chains {
                return Err(RunError::InvalidConfig {
                    detail: format!(
                        "expected {} initial-value map(s), got {}",
                        config.n_chains,
                        maps.len()
                    ),
                });
            }
        }
        let monitors = resolve_monitors(graph, config.monitors.as_deref())?;
        let labels = Arc::new(monitors.iter().map(|m| m.label.clone()).collect());
        Ok(Self {
            graph,
            config,
            monitors,
            labels,
        })
    }

    /// Runs all chains in parallel.
    pub fn run(&self) -> RunReport {
        self.run_inner(None, None)
    }

    /// Runs all chains with one terminal progress bar per chain.
    pub fn run_with_progress(&self) -> RunReport {
        let multi = MultiProgress::new();
        self.run_inner(Some(&multi), None)
    }

    /// Runs all chains, stopping early (with partial traces) once the token
    /// is cancelled.
    pub fn run_cancellable(&self, token: &CancelToken) -> RunReport {
        self.run_inner(None, Some(token))
    }

    fn run_inner(&self, multi: Option<&MultiProgress>, token: Option<&CancelToken>) -> RunReport {
        let total = self.config.n_iterations;
        let style = ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .expect("static progress template")
            .progress_chars("##-");

        let chains = (0..self.config.n_chains)
            .into_par_iter()
            .map(|chain| {
                let pb = multi.map(|m| {
                    let pb = m.add(ProgressBar::new(total as u64));
                    pb.set_prefix(format!("Chain {chain}"));
                    pb.set_style(style.clone());
                    pb
                });
                let result = self.run_chain(chain, pb.as_ref(), token);
                if let Some(pb) = pb {
                    match &result {
                        Ok(_) => pb.finish_with_message("done"),
                        Err(e) => pb.abandon_with_message(format!("failed: {e}")),
                    }
                }
                result
            })
            .collect();
        RunReport { chains }
    }

    fn run_chain(
        &self,
        chain: usize,
        pb: Option<&ProgressBar>,
        token: Option<&CancelToken>,
    ) -> Result<SampleTrace, RunError> {
        let cfg = &self.config;
        let mut rng = SmallRng::seed_from_u64(cfg.seed.wrapping_add(chain as u64));
        let explicit = match &cfg.init {
            InitPolicy::FromPrior => None,
            InitPolicy::Explicit(maps) => Some(&maps[chain]),
        };
        let mut state = self.graph.init_state(&mut rng, explicit)?;
        let mut steps: HashMap<SiteId, StepSize> = HashMap::new();

        let total = cfg.n_iterations;
        let kept_sweeps = total - cfg.burn_in;
        let rows = (kept_sweeps + cfg.thin - 1) / cfg.thin;
        let mut draws = Array2::zeros((rows, self.monitors.len()));
        let mut recorded = 0usize;

        for sweep in 0..total {
            if token.is_some_and(|t| t.is_cancelled()) {
                break;
            }
            let ctx = UpdateCtx {
                chain,
                iteration: sweep,
                adapting: sweep < cfg.burn_in,
            };
            for &site in self.graph.sweep_order() {
                update_site(self.graph, site, &mut state, &mut steps, &mut rng, &ctx)?;
            }
            if sweep >= cfg.burn_in && (sweep - cfg.burn_in) % cfg.thin == 0 {
                for (col, monitor) in self.monitors.iter().enumerate() {
                    draws[[recorded, col]] = self.monitor_value(monitor, &state)?;
                }
                recorded += 1;
            }
            if let Some(pb) = pb {
                pb.inc(1);
            }
        }

        if recorded < rows {
            draws = draws.slice(s![..recorded, ..]).to_owned();
        }
        let mut acceptance: Vec<(String, f64)> = steps
            .iter()
            .map(|(&site, s)| (self.graph.node(site).name.clone(), s.acceptance_rate()))
            .collect();
        acceptance.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(SampleTrace {
            components: Arc::clone(&self.labels),
            draws,
            acceptance,
        })
    }

    fn monitor_value(&self, monitor: &MonitorComponent, state: &[Value]) -> Result<f64, RunError> {
        let value = self.graph.site_value(monitor.site, state)?;
        match monitor.elem {
            None => value.as_scalar().ok_or_else(|| RunError::InvalidParameter {
                node: monitor.label.clone(),
                detail: "expected scalar value".to_string(),
            }),
            Some(k) => match &value {
                Value::Vector(v) => Ok(v[k]),
                Value::Scalar(_) => Err(RunError::InvalidParameter {
                    node: monitor.label.clone(),
                    detail: "expected vector value".to_string(),
                }),
            },
        }
    }
}

/// Expands a site into its monitored scalar columns.
fn expand_site(graph: &Graph, site: SiteId, out: &mut Vec<MonitorComponent>) {
    let node = graph.node(site);
    if node.dim == 1 {
        out.push(MonitorComponent {
            site,
            elem: None,
            label: node.name.clone(),
        });
    } else {
        for k in 0..node.dim {
            out.push(MonitorComponent {
                site,
                elem: Some(k),
                label: format!("{}[{}]", node.name, k + 1),
            });
        }
    }
}

fn resolve_monitors(
    graph: &Graph,
    monitors: Option<&[String]>,
) -> Result<Vec<MonitorComponent>, RunError> {
    let mut out = Vec::new();
    match monitors {
        None => {
            for &site in graph.topo_order() {
                if graph.node(site).is_sampled() {
                    expand_site(graph, site, &mut out);
                }
            }
        }
        Some(names) => {
            for name in names {
                if let Some(site) = graph.site(name) {
                    if graph.node(site).is_observed() {
                        return Err(RunError::InvalidConfig {
                            detail: format!("monitor '{name}' is an observed node"),
                        });
                    }
                    expand_site(graph, site, &mut out);
                    continue;
                }
                // `p[2]`: one component of a vector-valued site.
                if let Some((base, k)) = split_indexed(name) {
                    if let Some(site) = graph.site(base) {
                        let dim = graph.node(site).dim;
                        if dim > 1 && k >= 1 && k <= dim {
                            out.push(MonitorComponent {
                                site,
                                elem: Some(k - 1),
                                label: name.clone(),
                            });
                            continue;
                        }
                    }
                }
                return Err(RunError::InvalidConfig {
                    detail: format!("unknown monitor '{name}'"),
                });
            }
        }
    }
    if out.is_empty() {
        return Err(RunError::InvalidConfig {
            detail: "nothing to monitor".to_string(),
        });
    }
    Ok(out)
}

/// Splits `"p[2]"` into `("p", 2)`.
fn split_indexed(name: &str) -> Option<(&str, usize)> {
    let open = name.find('[')?;
    let inner = name.get(open + 1..name.len() - 1)?;
    if !name.ends_with(']') {
        return None;
    }
    let k: usize = inner.parse().ok()?;
    Some((&name[..open], k))
}
