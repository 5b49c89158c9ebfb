/*!
# Convergence Diagnostics & Posterior Summaries

Gelman-Rubin potential scale reduction over the retained traces of
parallel chains, plus pooled posterior summaries (mean, sd, quantiles)
with a plain-text table renderer.

Diagnostics are pure functions of the traces; they never touch the graph
or the sampler, so partial traces from a cancelled run work too.
*/

use std::fmt::Write as _;

use ndarray::prelude::*;

use crate::error::DiagError;
use crate::sampler::SampleTrace;

/// Potential scale reduction factor for one monitored component.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GelmanRubin {
    /// Point estimate, floored at 1.0.
    pub point: f64,
    /// Upper bound inflated by the sampling variability of the chain
    /// means; never below `point`.
    pub upper: f64,
}

impl GelmanRubin {
    /// The conventional convergence check at a given threshold,
    /// e.g. `1.05` or `1.1`.
    pub fn converged(&self, threshold: f64) -> bool {
        self.point <= threshold
    }
}

/// Gelman-Rubin statistic for one component across chains.
///
/// Chains of unequal length (e.g. after cancellation) are truncated to the
/// shortest before comparing. Requires at least two chains with at least
/// two retained draws each.
pub fn gelman_rubin(traces: &[&SampleTrace], component: &str) -> Result<GelmanRubin, DiagError> {
    if traces.len() < 2 {
        return Err(DiagError::InsufficientChains {
            actual: traces.len(),
        });
    }
    let columns = traces
        .iter()
        .map(|t| {
            t.column(component).ok_or_else(|| DiagError::UnknownComponent {
                component: component.to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let m = columns.iter().map(|c| c.len()).min().unwrap_or(0);
    if m < 2 {
        return Err(DiagError::EmptyTrace {
            component: component.to_string(),
        });
    }

    let n_chains = columns.len() as f64;
    let n = m as f64;

    let chain_means: Vec<f64> = columns
        .iter()
        .map(|c| c.slice(s![..m]).sum() / n)
        .collect();
    // Within-chain variance: mean of the per-chain sample variances.
    let within = columns
        .iter()
        .zip(chain_means.iter())
        .map(|(c, &mean)| c.slice(s![..m]).mapv(|x| (x - mean).powi(2)).sum() / (n - 1.0))
        .sum::<f64>()
        / n_chains;

    let grand_mean = chain_means.iter().sum::<f64>() / n_chains;
    // Between-chain variance: n times the variance of the chain means.
    let between = n
        * chain_means
            .iter()
            .map(|x| (x - grand_mean).powi(2))
            .sum::<f64>()
        / (n_chains - 1.0);

    // Frozen chains (all draws equal) have within == 0. Agreement across
    // chains is clean convergence; disagreement is the worst possible
    // mixing failure and must be surfaced, not rounded down to 1.0.
    let eps = f64::EPSILON * grand_mean.abs().max(1.0);
    if within <= eps {
        return if between <= eps {
            Ok(GelmanRubin {
                point: 1.0,
                upper: 1.0,
            })
        } else {
            Ok(GelmanRubin {
                point: f64::INFINITY,
                upper: f64::INFINITY,
            })
        };
    }

    let pooled = (n - 1.0) / n * within + between / n;
    let point = (pooled / within).sqrt().max(1.0);
    let upper = ((pooled + between / (n * n_chains)) / within).sqrt().max(point);
    Ok(GelmanRubin { point, upper })
}

/// Gelman-Rubin for every monitored component, in trace column order.
pub fn gelman_rubin_all(traces: &[&SampleTrace]) -> Result<Vec<(String, GelmanRubin)>, DiagError> {
    let first = traces.first().ok_or(DiagError::InsufficientChains { actual: 0 })?;
    first
        .components()
        .iter()
        .map(|c| gelman_rubin(traces, c).map(|r| (c.clone(), r)))
        .collect()
}

/// Pooled posterior summary of one monitored component.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub component: String,
    pub mean: f64,
    pub sd: f64,
    /// 2.5%, 25%, 50%, 75%, and 97.5% quantiles.
    pub quantiles: [f64; 5],
}

const SUMMARY_PROBS: [f64; 5] = [0.025, 0.25, 0.5, 0.75, 0.975];

/// Summarizes one component over the pooled draws of all chains.
pub fn summarize(traces: &[&SampleTrace], component: &str) -> Result<Summary, DiagError> {
    let mut pooled = Vec::new();
    for trace in traces {
        let col = trace
            .column(component)
            .ok_or_else(|| DiagError::UnknownComponent {
                component: component.to_string(),
            })?;
        pooled.extend(col.iter().copied());
    }
    if pooled.is_empty() {
        return Err(DiagError::EmptyTrace {
            component: component.to_string(),
        });
    }

    let n = pooled.len() as f64;
    let mean = pooled.iter().sum::<f64>() / n;
    let sd = if pooled.len() > 1 {
        (pooled.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
    } else {
        0.0
    };

    pooled.sort_by(|a, b| a.total_cmp(b));
    let quantiles = SUMMARY_PROBS.map(|p| quantile_sorted(&pooled, p));
    Ok(Summary {
        component: component.to_string(),
        mean,
        sd,
        quantiles,
    })
}

/// Summaries for every monitored component, in trace column order.
pub fn summarize_all(traces: &[&SampleTrace]) -> Result<Vec<Summary>, DiagError> {
    let first = traces.first().ok_or(DiagError::InsufficientChains { actual: 0 })?;
    first
        .components()
        .iter()
        .map(|c| summarize(traces, c))
        .collect()
}

/// Linear-interpolation quantile of an ascending-sorted slice.
fn quantile_sorted(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let rank = p * (n - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + frac * (sorted[hi] - sorted[lo])
}

/// Renders summaries plus R-hat as an aligned plain-text table.
pub fn summary_table(traces: &[&SampleTrace]) -> Result<String, DiagError> {
    let summaries = summarize_all(traces)?;
    let rhats: Vec<Option<GelmanRubin>> = if traces.len() >= 2 {
        summaries
            .iter()
            .map(|s| gelman_rubin(traces, &s.component).ok())
            .collect()
    } else {
        vec![None; summaries.len()]
    };

    let name_width = summaries
        .iter()
        .map(|s| s.component.len())
        .chain(["node".len()])
        .max()
        .unwrap_or(4);

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:name_width$}  {:>10}  {:>10}  {:>10}  {:>10}  {:>10}  {:>6}",
        "node", "mean", "sd", "2.5%", "50%", "97.5%", "rhat"
    );
    for (summary, rhat) in summaries.iter().zip(rhats.iter()) {
        let rhat_text = match rhat {
            Some(r) => format!("{:.3}", r.point),
            None => "-".to_string(),
        };
        let _ = writeln!(
            out,
            "{:name_width$}  {:>10.4}  {:>10.4}  {:>10.4}  {:>10.4}  {:>10.4}  {:>6}",
            summary.component,
            summary.mean,
            summary.sd,
            summary.quantiles[0],
            summary.quantiles[2],
            summary.quantiles[4],
            rhat_text
        );
    }
    Ok(out)
}
