/*!
Declarative Gibbs sampling for directed graphical models.

A model is written in a small BUGS-flavoured language, compiled against
data bindings into a static site graph, and sampled with per-site kernels:
closed-form conjugate updates where the structure allows, adaptive
Metropolis otherwise. Chains run in parallel and are summarized with
Gelman-Rubin diagnostics.

```rust
use gibbsgraph::graph::{DataBindings, Graph};
use gibbsgraph::sampler::{GibbsSampler, RunConfig};
use gibbsgraph::stats::gelman_rubin;

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
    n_chains: 3,
    n_iterations: 1_000,
    burn_in: 200,
    ..RunConfig::default()
};
let traces = GibbsSampler::new(&graph, config)
    .unwrap()
    .run()
    .expect_complete()
    .unwrap();

let refs: Vec<_> = traces.iter().collect();
let rhat = gelman_rubin(&refs, "theta").unwrap();
assert!(rhat.point < 1.2);
```
*/

pub mod classify;
pub mod dist;
pub mod error;
pub mod expr;
pub mod graph;
pub mod io;
pub mod kernel;
pub mod parser;
pub mod sampler;
pub mod stats;

pub use error::{BuildError, DiagError, RunError};
pub use expr::Value;
pub use graph::{DataBindings, Graph};
pub use kernel::KernelKind;
pub use sampler::{CancelToken, GibbsSampler, InitPolicy, RunConfig, RunReport, SampleTrace};
pub use stats::{gelman_rubin, gelman_rubin_all, summarize_all, summary_table, GelmanRubin, Summary};
