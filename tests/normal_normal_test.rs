use approx::assert_abs_diff_eq;
use gibbsgraph::graph::{DataBindings, Graph};
use gibbsgraph::sampler::{GibbsSampler, RunConfig, SampleTrace};
use gibbsgraph::stats::{gelman_rubin, summarize};

/// theta ~ N(2.3, sd 0.5) with one observation x = 3.1 ~ N(theta, sd 0.8),
/// expressed with precisions 1/0.25 and 1/0.64.
const MODEL: &str = "model {
    theta ~ dnorm(2.3, 4.0)
    x ~ dnorm(theta, 1.5625)
}";

fn run(seed: u64) -> Vec<SampleTrace> {
    let data = DataBindings::new().scalar("x", 3.1);
    let graph = Graph::compile(MODEL, &data).expect("model should compile");
    // 5,000 retained draws per chain after burn-in.
    let config = RunConfig {
        n_chains: 3,
        n_iterations: 6_000,
        burn_in: 1_000,
        seed,
        ..RunConfig::default()
    };
    GibbsSampler::new(&graph, config)
        .expect("config should validate")
        .run()
        .expect_complete()
        .expect("all chains should finish")
}

#[test]
fn posterior_mean_matches_conjugate_closed_form() {
    let traces = run(42);
    let refs: Vec<&SampleTrace> = traces.iter().collect();

    // Precision-weighted average of the prior mean and the observation.
    let prior_prec: f64 = 1.0 / 0.25;
    let lik_prec: f64 = 1.0 / 0.64;
    let expected = (prior_prec * 2.3 + lik_prec * 3.1) / (prior_prec + lik_prec);
    let expected_sd = (prior_prec + lik_prec).recip().sqrt();

    let summary = summarize(&refs, "theta").expect("theta is monitored");
    assert_abs_diff_eq!(summary.mean, expected, epsilon = 0.02);
    assert_abs_diff_eq!(summary.sd, expected_sd, epsilon = 0.02);
    assert_abs_diff_eq!(summary.quantiles[2], expected, epsilon = 0.03);
}

#[test]
fn chains_converge_under_gelman_rubin() {
    let traces = run(42);
    let refs: Vec<&SampleTrace> = traces.iter().collect();
    let rhat = gelman_rubin(&refs, "theta").expect("three chains available");
    assert!(rhat.point >= 1.0);
    assert!(rhat.point <= 1.05, "rhat = {}", rhat.point);
    assert!(rhat.upper >= rhat.point);
}

#[test]
fn runs_are_bit_identical_for_a_fixed_seed() {
    let a = run(1234);
    let b = run(1234);
    assert_eq!(a.len(), b.len());
    for (ta, tb) in a.iter().zip(b.iter()) {
        assert_eq!(ta.components(), tb.components());
        assert_eq!(ta.draws(), tb.draws());
    }
}

#[test]
fn different_seeds_decorrelate_runs() {
    let a = run(1);
    let b = run(2);
    assert_ne!(a[0].draws(), b[0].draws());
}

#[test]
fn random_intercepts_shrink_toward_their_groups() {
    // Two groups with clearly separated observations; each intercept's
    // posterior should land near its own group mean.
    let data = DataBindings::new()
        .vector("y", vec![0.9, 1.1, 1.0, 9.0, 9.2, 8.8])
        .vector("g", vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
    let graph = Graph::compile(
        "model {
            for (j in 1:2) { b[j] ~ dnorm(0, 1.0e-4) }
            for (i in 1:6) { y[i] ~ dnorm(b[g[i]], 4.0) }
        }",
        &data,
    )
    .expect("model should compile");
    let config = RunConfig {
        n_chains: 2,
        n_iterations: 4_000,
        burn_in: 500,
        seed: 9,
        ..RunConfig::default()
    };
    let traces = GibbsSampler::new(&graph, config)
        .expect("config should validate")
        .run()
        .expect_complete()
        .expect("all chains should finish");
    let refs: Vec<&SampleTrace> = traces.iter().collect();

    let b1 = summarize(&refs, "b[1]").expect("b[1] is monitored");
    let b2 = summarize(&refs, "b[2]").expect("b[2] is monitored");
    assert_abs_diff_eq!(b1.mean, 1.0, epsilon = 0.1);
    assert_abs_diff_eq!(b2.mean, 9.0, epsilon = 0.1);
}
