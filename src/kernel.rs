/*!
# Sampler Kernel Library

Per-site update rules. Conjugate kernels collect sufficient statistics from
the site's stochastic children and draw once from the closed-form posterior;
latent discrete sites draw exactly from their full conditional by
enumerating the finite support; the generic kernel is a random-walk
Metropolis step whose scale adapts during warm-up toward a 20-40%
acceptance rate.

All kernels mutate exactly one site of the chain state and leave the rest
untouched. Deterministic sites are never updated here; they are recomputed
lazily whenever an expression reads them.
*/

use std::collections::HashMap;

use rand::rngs::SmallRng;
use rand::Rng;
use rand_distr::{Beta, Distribution, Gamma, Normal, StandardNormal};

use crate::dist::{self, Family};
use crate::error::RunError;
use crate::expr::{SiteId, Value};
use crate::graph::Graph;

/// The update rule selected for a sampled site, chosen once at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelKind {
    /// Normal prior + Normal children in the mean position.
    ConjugateNormal,
    /// Beta prior + Bernoulli/Binomial children.
    ConjugateBeta,
    /// Dirichlet prior + Categorical children.
    ConjugateDirichlet,
    /// Gamma prior + Normal children in the precision position.
    ConjugateGamma,
    /// Latent discrete site: exact full-conditional draw over the finite
    /// support (Bernoulli, Binomial, Categorical).
    DiscreteEnumeration,
    /// Generic random-walk Metropolis with warm-up step adaptation.
    MetropolisAdaptive,
}

/// Concentration of the Dirichlet proposal used by the Metropolis kernel
/// on simplex-valued sites.
const DIRICHLET_PROPOSAL_CONC: f64 = 60.0;

/// Adaptive step-size state for one Metropolis-updated site.
#[derive(Debug, Clone)]
pub struct StepSize {
    step: f64,
    accepted: u64,
    proposed: u64,
    window_accepted: u32,
    window_proposed: u32,
}

impl StepSize {
    /// Proposals per adaptation window.
    const WINDOW: u32 = 50;
    const TARGET_LOW: f64 = 0.2;
    const TARGET_HIGH: f64 = 0.4;

    pub fn new(step: f64) -> Self {
        Self {
            step,
            accepted: 0,
            proposed: 0,
            window_accepted: 0,
            window_proposed: 0,
        }
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    /// Lifetime acceptance rate, for run reporting.
    pub fn acceptance_rate(&self) -> f64 {
        if self.proposed == 0 {
            f64::NAN
        } else {
            self.accepted as f64 / self.proposed as f64
        }
    }

    /// Records one proposal outcome. During warm-up the step is rescaled at
    /// window boundaries; afterwards it is frozen so the post-warm-up chain
    /// is a fixed Markov kernel.
    fn record(&mut self, accepted: bool, adapting: bool) {
        self.proposed += 1;
        if accepted {
            self.accepted += 1;
        }
        if !adapting {
            return;
        }
        self.window_proposed += 1;
        if accepted {
            self.window_accepted += 1;
        }
        if self.window_proposed == Self::WINDOW {
            let rate = self.window_accepted as f64 / self.window_proposed as f64;
            if rate > Self::TARGET_HIGH {
                self.step *= 1.1;
            } else if rate < Self::TARGET_LOW {
                self.step *= 0.9;
            }
            self.window_proposed = 0;
            self.window_accepted = 0;
        }
    }
}

impl Default for StepSize {
    fn default() -> Self {
        Self::new(1.0)
    }
}

/// Context threaded through kernel calls so failures can name the chain and
/// iteration that produced them.
#[derive(Debug, Clone, Copy)]
pub struct UpdateCtx {
    pub chain: usize,
    pub iteration: usize,
    /// True during burn-in, when Metropolis step sizes may still adapt.
    pub adapting: bool,
}

/// Applies the site's cached kernel once, drawing a new value in place.
pub fn update_site(
    graph: &Graph,
    site: SiteId,
    state: &mut [Value],
    steps: &mut HashMap<SiteId, StepSize>,
    rng: &mut SmallRng,
    ctx: &UpdateCtx,
) -> Result<(), RunError> {
    let kernel = graph
        .node(site)
        .kernel()
        .expect("sweep order contains only sampled sites");
    match kernel {
        KernelKind::ConjugateNormal => conjugate_normal(graph, site, state, rng, ctx),
        KernelKind::ConjugateBeta => conjugate_beta(graph, site, state, rng, ctx),
        KernelKind::ConjugateDirichlet => conjugate_dirichlet(graph, site, state, rng, ctx),
        KernelKind::ConjugateGamma => conjugate_gamma(graph, site, state, rng, ctx),
        KernelKind::DiscreteEnumeration => discrete_enumeration(graph, site, state, rng, ctx),
        KernelKind::MetropolisAdaptive => metropolis(graph, site, state, steps, rng, ctx),
    }
}

fn invalid(graph: &Graph, site: SiteId, detail: impl Into<String>) -> RunError {
    RunError::InvalidParameter {
        node: graph.node(site).name.clone(),
        detail: detail.into(),
    }
}

fn diverged(graph: &Graph, site: SiteId, ctx: &UpdateCtx) -> RunError {
    RunError::SamplingDiverged {
        node: graph.node(site).name.clone(),
        chain: ctx.chain,
        iteration: ctx.iteration,
    }
}

fn scalar_param(graph: &Graph, site: SiteId, params: &[Value], k: usize) -> Result<f64, RunError> {
    params[k]
        .as_scalar()
        .ok_or_else(|| invalid(graph, site, format!("parameter {} must be scalar", k + 1)))
}

/// Normal prior N(m0, t0) with Normal children: the posterior precision is
/// `t0 + sum(tau_c)` and the posterior mean is the precision-weighted
/// average of the prior mean and the child values.
fn conjugate_normal(
    graph: &Graph,
    site: SiteId,
    state: &mut [Value],
    rng: &mut SmallRng,
    ctx: &UpdateCtx,
) -> Result<(), RunError> {
    let params = graph.eval_params(site, state)?;
    let m0 = scalar_param(graph, site, &params, 0)?;
    let t0 = scalar_param(graph, site, &params, 1)?;
    if !(t0 > 0.0) {
        return Err(invalid(graph, site, format!("prior precision must be > 0, got {t0}")));
    }

    let mut precision = t0;
    let mut weighted = t0 * m0;
    for &child in &graph.node(site).children {
        let child_params = graph.eval_params(child, state)?;
        let tau = scalar_param(graph, child, &child_params, 1)?;
        if !(tau > 0.0) {
            return Err(invalid(
                graph,
                child,
                format!("likelihood precision must be > 0, got {tau}"),
            ));
        }
        let y = state[child]
            .as_scalar()
            .ok_or_else(|| invalid(graph, child, "expected scalar value"))?;
        precision += tau;
        weighted += tau * y;
    }

    let mean = weighted / precision;
    let normal = Normal::new(mean, precision.sqrt().recip())
        .map_err(|e| invalid(graph, site, e.to_string()))?;
    let draw: f64 = normal.sample(rng);
    if !draw.is_finite() {
        return Err(diverged(graph, site, ctx));
    }
    state[site] = Value::Scalar(draw);
    Ok(())
}

/// Beta(a, b) prior with Bernoulli/Binomial children: add successes to `a`
/// and failures to `b`.
fn conjugate_beta(
    graph: &Graph,
    site: SiteId,
    state: &mut [Value],
    rng: &mut SmallRng,
    ctx: &UpdateCtx,
) -> Result<(), RunError> {
    let params = graph.eval_params(site, state)?;
    let mut a = scalar_param(graph, site, &params, 0)?;
    let mut b = scalar_param(graph, site, &params, 1)?;
    if !(a > 0.0 && b > 0.0) {
        return Err(invalid(graph, site, format!("shape parameters must be > 0, got ({a}, {b})")));
    }

    for &child in &graph.node(site).children {
        let y = state[child]
            .as_scalar()
            .ok_or_else(|| invalid(graph, child, "expected scalar value"))?;
        match graph.node(child).family() {
            Some(Family::Bern) => {
                a += y;
                b += 1.0 - y;
            }
            Some(Family::Bin) => {
                let child_params = graph.eval_params(child, state)?;
                let n = scalar_param(graph, child, &child_params, 1)?;
                a += y;
                b += n - y;
            }
            _ => unreachable!("classifier admits only Bernoulli/Binomial children"),
        }
    }

    let beta = Beta::new(a, b).map_err(|e| invalid(graph, site, e.to_string()))?;
    let draw: f64 = beta.sample(rng);
    if !draw.is_finite() {
        return Err(diverged(graph, site, ctx));
    }
    state[site] = Value::Scalar(draw);
    Ok(())
}

/// Dirichlet(alpha) prior with categorical children: add one to the
/// concentration of each observed category and redraw the simplex.
fn conjugate_dirichlet(
    graph: &Graph,
    site: SiteId,
    state: &mut [Value],
    rng: &mut SmallRng,
    ctx: &UpdateCtx,
) -> Result<(), RunError> {
    let params = graph.eval_params(site, state)?;
    let mut alpha = match &params[0] {
        Value::Vector(v) => v.clone(),
        Value::Scalar(_) => {
            return Err(invalid(graph, site, "concentration parameter must be a vector"))
        }
    };

    for &child in &graph.node(site).children {
        let y = state[child]
            .as_scalar()
            .ok_or_else(|| invalid(graph, child, "expected scalar value"))?;
        let k = y as usize;
        if y.fract() != 0.0 || k < 1 || k > alpha.len() {
            return Err(invalid(
                graph,
                child,
                format!("category {y} outside 1..={}", alpha.len()),
            ));
        }
        alpha[k - 1] += 1.0;
    }

    let draw = dist::sample_dirichlet(&alpha, rng).map_err(|_| diverged(graph, site, ctx))?;
    state[site] = Value::Vector(draw);
    Ok(())
}

/// Gamma(shape, rate) prior as the precision of Normal children: shape
/// gains n/2, rate gains half the sum of squared residuals.
fn conjugate_gamma(
    graph: &Graph,
    site: SiteId,
    state: &mut [Value],
    rng: &mut SmallRng,
    ctx: &UpdateCtx,
) -> Result<(), RunError> {
    let params = graph.eval_params(site, state)?;
    let mut shape = scalar_param(graph, site, &params, 0)?;
    let mut rate = scalar_param(graph, site, &params, 1)?;
    if !(shape > 0.0 && rate > 0.0) {
        return Err(invalid(
            graph,
            site,
            format!("shape/rate must be > 0, got ({shape}, {rate})"),
        ));
    }

    for &child in &graph.node(site).children {
        let child_params = graph.eval_params(child, state)?;
        let mu = scalar_param(graph, child, &child_params, 0)?;
        let y = state[child]
            .as_scalar()
            .ok_or_else(|| invalid(graph, child, "expected scalar value"))?;
        let residual = y - mu;
        shape += 0.5;
        rate += 0.5 * residual * residual;
    }

    let gamma = Gamma::new(shape, rate.recip()).map_err(|e| invalid(graph, site, e.to_string()))?;
    let draw: f64 = gamma.sample(rng);
    if !(draw > 0.0) || !draw.is_finite() {
        return Err(diverged(graph, site, ctx));
    }
    state[site] = Value::Scalar(draw);
    Ok(())
}

/// Exact full-conditional draw for a latent discrete site: evaluate the
/// unnormalized log-posterior at every support point, normalize, sample.
fn discrete_enumeration(
    graph: &Graph,
    site: SiteId,
    state: &mut [Value],
    rng: &mut SmallRng,
    ctx: &UpdateCtx,
) -> Result<(), RunError> {
    let params = graph.eval_params(site, state)?;
    let family = graph
        .node(site)
        .family()
        .expect("sweep order contains only stochastic sites");
    let support: Vec<f64> = match family {
        Family::Bern => vec![0.0, 1.0],
        Family::Cat => {
            let k = match &params[0] {
                Value::Vector(v) => v.len(),
                Value::Scalar(_) => 1,
            };
            (1..=k).map(|c| c as f64).collect()
        }
        Family::Bin => {
            let n = scalar_param(graph, site, &params, 1)?;
            if n < 0.0 || n.fract() != 0.0 {
                return Err(invalid(
                    graph,
                    site,
                    format!("trial count must be a non-negative integer, got {n}"),
                ));
            }
            (0..=n as u64).map(|c| c as f64).collect()
        }
        _ => unreachable!("classifier enumerates only discrete families"),
    };

    let original = state[site].clone();
    let mut log_weights = Vec::with_capacity(support.len());
    let mut max_lp = f64::NEG_INFINITY;
    for &v in &support {
        state[site] = Value::Scalar(v);
        let lp = match graph.log_posterior(site, state) {
            Ok(lp) => lp,
            Err(e) => {
                state[site] = original;
                return Err(e);
            }
        };
        if lp.is_nan() {
            state[site] = original;
            return Err(diverged(graph, site, ctx));
        }
        max_lp = max_lp.max(lp);
        log_weights.push(lp);
    }
    // Zero mass everywhere means the conditional does not exist.
    if !max_lp.is_finite() {
        state[site] = original;
        return Err(diverged(graph, site, ctx));
    }

    let total: f64 = log_weights.iter().map(|lp| (lp - max_lp).exp()).sum();
    let r = rng.gen::<f64>() * total;
    let mut cum = 0.0;
    for (lp, &v) in log_weights.iter().zip(support.iter()) {
        cum += (lp - max_lp).exp();
        if r < cum {
            state[site] = Value::Scalar(v);
            return Ok(());
        }
    }
    // Rounding slack lands on the last support point.
    state[site] = Value::Scalar(support[support.len() - 1]);
    Ok(())
}

/// Random-walk Metropolis on a scalar site, or a Dirichlet-proposal
/// Metropolis-Hastings move on a simplex site. The acceptance ratio is
/// computed in log space over the site's prior plus its children's
/// likelihood contributions.
fn metropolis(
    graph: &Graph,
    site: SiteId,
    state: &mut [Value],
    steps: &mut HashMap<SiteId, StepSize>,
    rng: &mut SmallRng,
    ctx: &UpdateCtx,
) -> Result<(), RunError> {
    let current = state[site].clone();
    let current_lp = graph.log_posterior(site, state)?;
    if current_lp.is_nan() {
        return Err(diverged(graph, site, ctx));
    }

    match current {
        Value::Scalar(x) => {
            let step = steps.entry(site).or_default().step();
            let noise: f64 = StandardNormal.sample(rng);
            let proposal = x + step * noise;

            state[site] = Value::Scalar(proposal);
            let proposal_lp = graph.log_posterior(site, state)?;
            if proposal_lp.is_nan() {
                return Err(diverged(graph, site, ctx));
            }

            // Symmetric proposal, so the q terms cancel.
            let accept = proposal_lp > f64::NEG_INFINITY
                && rng.gen::<f64>().ln() < proposal_lp - current_lp;
            if !accept {
                state[site] = Value::Scalar(x);
            }
            steps.entry(site).or_default().record(accept, ctx.adapting);
        }
        Value::Vector(ref x) => {
            // Dirichlet proposal centred at the current simplex point; the
            // move is asymmetric, so both q terms enter the ratio.
            let forward_alpha: Vec<f64> = x
                .iter()
                .map(|&c| c.max(1e-6) * DIRICHLET_PROPOSAL_CONC)
                .collect();
            let proposal = dist::sample_dirichlet(&forward_alpha, rng)
                .map_err(|_| diverged(graph, site, ctx))?;
            let backward_alpha: Vec<f64> = proposal
                .iter()
                .map(|&c| c.max(1e-6) * DIRICHLET_PROPOSAL_CONC)
                .collect();

            let log_q_forward = dirichlet_lp(&proposal, &forward_alpha);
            let log_q_backward = dirichlet_lp(x, &backward_alpha);

            state[site] = Value::Vector(proposal);
            let proposal_lp = graph.log_posterior(site, state)?;
            if proposal_lp.is_nan() {
                return Err(diverged(graph, site, ctx));
            }

            let log_accept_ratio =
                (proposal_lp + log_q_backward) - (current_lp + log_q_forward);
            let accept =
                proposal_lp > f64::NEG_INFINITY && rng.gen::<f64>().ln() < log_accept_ratio;
            if !accept {
                state[site] = current;
            }
            steps.entry(site).or_default().record(accept, ctx.adapting);
        }
    }
    Ok(())
}

fn dirichlet_lp(x: &[f64], alpha: &[f64]) -> f64 {
    let mut lp = dist::ln_gamma(alpha.iter().sum());
    for (&xi, &ai) in x.iter().zip(alpha.iter()) {
        lp += (ai - 1.0) * xi.ln() - dist::ln_gamma(ai);
    }
    lp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DataBindings;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;

    fn run_updates(
        graph: &Graph,
        site: SiteId,
        state: &mut [Value],
        rng: &mut SmallRng,
        n: usize,
    ) -> Vec<f64> {
        let mut steps = HashMap::new();
        let mut draws = Vec::with_capacity(n);
        for iteration in 0..n {
            let ctx = UpdateCtx {
                chain: 0,
                iteration,
                adapting: false,
            };
            update_site(graph, site, state, &mut steps, rng, &ctx).unwrap();
            draws.push(state[site].as_scalar().unwrap());
        }
        draws
    }

    #[test]
    fn conjugate_normal_matches_closed_form() {
        // theta ~ N(2.3, sd 0.5), one observation x = 3.1 with sd 0.8.
        let data = DataBindings::new().scalar("x", 3.1);
        let graph = Graph::compile(
            "model {
                theta ~ dnorm(2.3, 4.0)
                x ~ dnorm(theta, 1.5625)
            }",
            &data,
        )
        .unwrap();
        let theta = graph.site("theta").unwrap();
        let mut rng = SmallRng::seed_from_u64(42);
        let mut state = graph.init_state(&mut rng, None).unwrap();

        let draws = run_updates(&graph, theta, &mut state, &mut rng, 50_000);

        let post_prec = 4.0 + 1.5625;
        let post_mean = (4.0 * 2.3 + 1.5625 * 3.1) / post_prec;
        let n = draws.len() as f64;
        let mean = draws.iter().sum::<f64>() / n;
        let var = draws.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
        assert_abs_diff_eq!(mean, post_mean, epsilon = 0.01);
        assert_abs_diff_eq!(var, post_prec.recip(), epsilon = 0.01);
    }

    #[test]
    fn conjugate_beta_counts_successes() {
        let data = DataBindings::new().vector("z", vec![1.0, 1.0, 1.0, 0.0]);
        let graph = Graph::compile(
            "model {
                p ~ dbeta(2, 2)
                for (i in 1:4) { z[i] ~ dbern(p) }
            }",
            &data,
        )
        .unwrap();
        let p = graph.site("p").unwrap();
        let mut rng = SmallRng::seed_from_u64(7);
        let mut state = graph.init_state(&mut rng, None).unwrap();

        let draws = run_updates(&graph, p, &mut state, &mut rng, 50_000);

        // Posterior is Beta(2+3, 2+1); its mean is 5/8.
        let mean = draws.iter().sum::<f64>() / draws.len() as f64;
        assert_abs_diff_eq!(mean, 5.0 / 8.0, epsilon = 0.01);
        assert!(draws.iter().all(|&x| (0.0..=1.0).contains(&x)));
    }

    #[test]
    fn conjugate_dirichlet_stays_on_simplex() {
        let data = DataBindings::new()
            .vector("alpha", vec![1.0, 1.0, 1.0])
            .vector("z", vec![1.0, 1.0, 2.0, 3.0, 3.0, 3.0]);
        let graph = Graph::compile(
            "model {
                p ~ ddirch(alpha)
                for (i in 1:6) { z[i] ~ dcat(p) }
            }",
            &data,
        )
        .unwrap();
        let p = graph.site("p").unwrap();
        let mut rng = SmallRng::seed_from_u64(3);
        let mut state = graph.init_state(&mut rng, None).unwrap();
        let mut steps = HashMap::new();

        let mut mean = [0.0f64; 3];
        let n = 20_000;
        for iteration in 0..n {
            let ctx = UpdateCtx {
                chain: 0,
                iteration,
                adapting: false,
            };
            update_site(&graph, p, &mut state, &mut steps, &mut rng, &ctx).unwrap();
            let v = match &state[p] {
                Value::Vector(v) => v.clone(),
                other => panic!("expected vector, got {other:?}"),
            };
            assert_abs_diff_eq!(v.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
            for (m, x) in mean.iter_mut().zip(v.iter()) {
                *m += x / n as f64;
            }
        }
        // Posterior Dirichlet(1+2, 1+1, 1+3) has mean (3, 2, 4)/9.
        assert_abs_diff_eq!(mean[0], 3.0 / 9.0, epsilon = 0.02);
        assert_abs_diff_eq!(mean[1], 2.0 / 9.0, epsilon = 0.02);
        assert_abs_diff_eq!(mean[2], 4.0 / 9.0, epsilon = 0.02);
    }

    #[test]
    fn latent_bernoulli_moves_and_tracks_its_conditional() {
        // y = 1.0 is equidistant from both arms (0 and 2), so the
        // likelihood cancels and the conditional equals the prior.
        let data = DataBindings::new().scalar("y", 1.0);
        let graph = Graph::compile(
            "model {
                z ~ dbern(0.3)
                y ~ dnorm(2 * z, 1)
            }",
            &data,
        )
        .unwrap();
        let z = graph.site("z").unwrap();
        assert_eq!(graph.node(z).kernel(), Some(KernelKind::DiscreteEnumeration));
        let mut rng = SmallRng::seed_from_u64(13);
        let mut state = graph.init_state(&mut rng, None).unwrap();

        let draws = run_updates(&graph, z, &mut state, &mut rng, 20_000);

        assert!(draws.iter().any(|&x| x == 0.0), "site never left 1");
        assert!(draws.iter().any(|&x| x == 1.0), "site never left 0");
        let mean = draws.iter().sum::<f64>() / draws.len() as f64;
        assert_abs_diff_eq!(mean, 0.3, epsilon = 0.02);
    }

    #[test]
    fn latent_bernoulli_weighs_in_its_likelihood() {
        // y = 2.0 sits on the z = 1 arm; the conditional odds are the
        // prior odds times exp(2), i.e. P(z=1) = 0.3e^2 / (0.3e^2 + 0.7).
        let data = DataBindings::new().scalar("y", 2.0);
        let graph = Graph::compile(
            "model {
                z ~ dbern(0.3)
                y ~ dnorm(2 * z, 1)
            }",
            &data,
        )
        .unwrap();
        let z = graph.site("z").unwrap();
        let mut rng = SmallRng::seed_from_u64(29);
        let mut state = graph.init_state(&mut rng, None).unwrap();

        let draws = run_updates(&graph, z, &mut state, &mut rng, 20_000);

        let expected = 0.3 * 2.0f64.exp() / (0.3 * 2.0f64.exp() + 0.7);
        let mean = draws.iter().sum::<f64>() / draws.len() as f64;
        assert_abs_diff_eq!(mean, expected, epsilon = 0.02);
    }

    #[test]
    fn latent_categorical_recovers_its_prior_frequencies() {
        let data = DataBindings::new().vector("p", vec![0.2, 0.3, 0.5]);
        let graph = Graph::compile("model { c ~ dcat(p) }", &data).unwrap();
        let c = graph.site("c").unwrap();
        let mut rng = SmallRng::seed_from_u64(41);
        let mut state = graph.init_state(&mut rng, None).unwrap();

        let draws = run_updates(&graph, c, &mut state, &mut rng, 30_000);

        let n = draws.len() as f64;
        for (k, p) in [(1.0, 0.2), (2.0, 0.3), (3.0, 0.5)] {
            let freq = draws.iter().filter(|&&x| x == k).count() as f64 / n;
            assert_abs_diff_eq!(freq, p, epsilon = 0.02);
        }
    }

    #[test]
    fn metropolis_reaches_uniform_posterior_support() {
        // sigma ~ U(0, 10) with data pulling it near 1; every retained
        // value must stay inside the support.
        let data = DataBindings::new().vector("y", vec![-1.0, 0.5, 1.2, -0.7]);
        let graph = Graph::compile(
            "model {
                sigma ~ dunif(0, 10)
                tau <- 1 / (sigma * sigma)
                for (i in 1:4) { y[i] ~ dnorm(0, tau) }
            }",
            &data,
        )
        .unwrap();
        let sigma = graph.site("sigma").unwrap();
        let mut rng = SmallRng::seed_from_u64(11);
        let mut state = graph.init_state(&mut rng, None).unwrap();
        let mut steps = HashMap::new();

        let mut moved = false;
        let first = state[sigma].as_scalar().unwrap();
        for iteration in 0..2_000 {
            let ctx = UpdateCtx {
                chain: 0,
                iteration,
                adapting: iteration < 500,
            };
            update_site(&graph, sigma, &mut state, &mut steps, &mut rng, &ctx).unwrap();
            let x = state[sigma].as_scalar().unwrap();
            assert!((0.0..=10.0).contains(&x), "left the prior support: {x}");
            moved |= x != first;
        }
        assert!(moved, "chain never accepted a proposal");
        let rate = steps[&sigma].acceptance_rate();
        assert!(rate > 0.05 && rate < 0.95, "degenerate acceptance rate {rate}");
    }

    #[test]
    fn step_size_adapts_toward_target_band() {
        let mut s = StepSize::new(1.0);
        // 50 straight rejections during warm-up shrink the step.
        for _ in 0..50 {
            s.record(false, true);
        }
        assert!(s.step() < 1.0);
        // 50 straight acceptances grow it again.
        for _ in 0..50 {
            s.record(true, true);
        }
        assert!(s.step() > 0.9);
        // Frozen outside warm-up.
        let frozen = s.step();
        for _ in 0..200 {
            s.record(true, false);
        }
        assert_eq!(s.step(), frozen);
    }

    #[test]
    fn invalid_precision_is_reported_not_nan() {
        // tau is fixed at a negative value through a deterministic site.
        let data = DataBindings::new().scalar("x", 1.0);
        let graph = Graph::compile(
            "model {
                tau <- 0 - 2
                theta ~ dnorm(0, 1)
                x ~ dnorm(theta, tau)
            }",
            &data,
        )
        .unwrap();
        let theta = graph.site("theta").unwrap();
        let mut rng = SmallRng::seed_from_u64(5);
        let mut state = graph.init_state(&mut rng, None).unwrap();
        let mut steps = HashMap::new();
        let ctx = UpdateCtx {
            chain: 0,
            iteration: 0,
            adapting: false,
        };
        let err = update_site(&graph, theta, &mut state, &mut steps, &mut rng, &ctx).unwrap_err();
        assert!(matches!(err, RunError::InvalidParameter { .. }));
    }
}
