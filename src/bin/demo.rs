//! A small end-to-end demo: a hierarchical normal model with an unknown
//! precision, sampled with four parallel chains, then summarized.

use std::error::Error;

use gibbsgraph::graph::{DataBindings, Graph};
use gibbsgraph::sampler::{GibbsSampler, RunConfig};
use gibbsgraph::stats::{gelman_rubin_all, summary_table};

const MODEL: &str = "model {
    mu ~ dnorm(0, 1.0e-4)
    tau ~ dgamma(0.5, 0.5)
    for (i in 1:10) {
        y[i] ~ dnorm(mu, tau)
    }
    sigma <- 1 / sqrt(tau)
}";

fn main() -> Result<(), Box<dyn Error>> {
    let data = DataBindings::new().vector(
        "y",
        vec![4.8, 5.3, 4.1, 5.9, 5.2, 4.4, 5.7, 5.0, 4.6, 5.5],
    );
    let graph = Graph::compile(MODEL, &data)?;
    println!(
        "Compiled {} sites, {} sampled per sweep",
        graph.len(),
        graph.sweep_order().len()
    );

    let config = RunConfig {
        n_chains: 4,
        n_iterations: 10_000,
        burn_in: 2_000,
        seed: 42,
        monitors: Some(vec![
            "mu".to_string(),
            "tau".to_string(),
            "sigma".to_string(),
        ]),
        ..RunConfig::default()
    };
    let traces = GibbsSampler::new(&graph, config)?
        .run_with_progress()
        .expect_complete()?;

    let refs: Vec<_> = traces.iter().collect();
    println!("\n{}", summary_table(&refs)?);
    for (component, rhat) in gelman_rubin_all(&refs)? {
        println!(
            "{component}: rhat = {:.4} (upper {:.4})",
            rhat.point, rhat.upper
        );
    }
    Ok(())
}
