/*!
# Node Classifier & Kernel Selector

Decides, once per sampled site at build time, whether a closed-form
conjugate update exists or the generic adaptive Metropolis kernel must be
used. The decision is cached on the node, so it is never re-derived during
sweeps.

Conjugacy is recognized structurally: a site qualifies only when *every*
stochastic child uses it in the algebraic position the closed form requires
(e.g. exactly as a Normal mean, with a precision that does not feed back
into the site). Anything more entangled falls back to Metropolis, which is
always correct, just slower to mix.
*/

use crate::dist::Family;
use crate::expr::SiteId;
use crate::graph::{expr_depends_on, Node, Role};
use crate::kernel::KernelKind;

/// Selects the update kernel for a sampled stochastic site.
pub fn classify(site: SiteId, nodes: &[Node]) -> KernelKind {
    let node = &nodes[site];
    let family = match &node.role {
        Role::Stochastic { family, .. } => *family,
        Role::Deterministic { .. } => unreachable!("only stochastic sites are classified"),
    };

    match family {
        Family::Norm if all_children_normal_in_mean(site, nodes) => KernelKind::ConjugateNormal,
        Family::Beta if all_children_bernoulli_like(site, nodes) => KernelKind::ConjugateBeta,
        Family::Dirch if all_children_categorical(site, nodes) => KernelKind::ConjugateDirichlet,
        Family::Gamma if all_children_normal_in_precision(site, nodes) => {
            KernelKind::ConjugateGamma
        }
        // Latent discrete sites have a finite support, so their full
        // conditional is computed exactly by enumeration. A continuous
        // random-walk proposal would be off-support almost surely.
        Family::Bern | Family::Bin | Family::Cat => KernelKind::DiscreteEnumeration,
        _ => KernelKind::MetropolisAdaptive,
    }
}

/// Normal prior, Normal likelihood with known precision: every child must
/// be `dnorm(<this site>, tau)` where `tau` does not depend on this site.
fn all_children_normal_in_mean(site: SiteId, nodes: &[Node]) -> bool {
    nodes[site].children.iter().all(|&c| {
        let child = &nodes[c];
        child.family() == Some(Family::Norm)
            && child.params()[0].is_ref_to(site)
            && !expr_depends_on(nodes, &child.params()[1], site)
    })
}

/// Beta prior feeding Bernoulli/Binomial success probabilities.
fn all_children_bernoulli_like(site: SiteId, nodes: &[Node]) -> bool {
    nodes[site].children.iter().all(|&c| {
        let child = &nodes[c];
        match child.family() {
            Some(Family::Bern) => child.params()[0].is_ref_to(site),
            Some(Family::Bin) => {
                child.params()[0].is_ref_to(site)
                    && !expr_depends_on(nodes, &child.params()[1], site)
            }
            _ => false,
        }
    })
}

/// Dirichlet prior over a simplex feeding categorical observations.
fn all_children_categorical(site: SiteId, nodes: &[Node]) -> bool {
    nodes[site].children.iter().all(|&c| {
        let child = &nodes[c];
        child.family() == Some(Family::Cat) && child.params()[0].is_ref_to(site)
    })
}

/// Gamma prior used as the precision of Normal children whose means do not
/// feed back into this site.
fn all_children_normal_in_precision(site: SiteId, nodes: &[Node]) -> bool {
    nodes[site].children.iter().all(|&c| {
        let child = &nodes[c];
        child.family() == Some(Family::Norm)
            && child.params()[1].is_ref_to(site)
            && !expr_depends_on(nodes, &child.params()[0], site)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DataBindings, Graph};

    fn kernel_of(graph: &Graph, name: &str) -> KernelKind {
        let id = graph.site(name).unwrap();
        graph.node(id).kernel().unwrap()
    }

    #[test]
    fn normal_mean_is_conjugate() {
        let data = DataBindings::new().vector("y", vec![1.0, 2.0, 3.0]);
        let g = Graph::compile(
            "model {
                mu ~ dnorm(0, 1.0e-3)
                for (i in 1:3) { y[i] ~ dnorm(mu, 2.0) }
            }",
            &data,
        )
        .unwrap();
        assert_eq!(kernel_of(&g, "mu"), KernelKind::ConjugateNormal);
    }

    #[test]
    fn regression_coefficient_is_not_conjugate() {
        // The mean is `alpha + beta * w[i]`, not a bare reference.
        let data = DataBindings::new()
            .vector("y", vec![1.0, 2.0])
            .vector("w", vec![0.1, 0.2]);
        let g = Graph::compile(
            "model {
                alpha ~ dnorm(0, 1.0e-3)
                beta ~ dnorm(0, 1.0e-3)
                for (i in 1:2) { y[i] ~ dnorm(alpha + beta * w[i], 1) }
            }",
            &data,
        )
        .unwrap();
        assert_eq!(kernel_of(&g, "alpha"), KernelKind::MetropolisAdaptive);
        assert_eq!(kernel_of(&g, "beta"), KernelKind::MetropolisAdaptive);
    }

    #[test]
    fn uniform_sigma_through_precision_is_metropolis() {
        let data = DataBindings::new().vector("y", vec![1.0, 2.0]);
        let g = Graph::compile(
            "model {
                sigma ~ dunif(0, 10)
                tau <- 1 / (sigma * sigma)
                for (i in 1:2) { y[i] ~ dnorm(0, tau) }
            }",
            &data,
        )
        .unwrap();
        assert_eq!(kernel_of(&g, "sigma"), KernelKind::MetropolisAdaptive);
    }

    #[test]
    fn gamma_precision_is_conjugate() {
        let data = DataBindings::new().vector("y", vec![1.0, 2.0]);
        let g = Graph::compile(
            "model {
                tau ~ dgamma(0.001, 0.001)
                for (i in 1:2) { y[i] ~ dnorm(0, tau) }
            }",
            &data,
        )
        .unwrap();
        assert_eq!(kernel_of(&g, "tau"), KernelKind::ConjugateGamma);
    }

    #[test]
    fn dirichlet_over_categorical_is_conjugate() {
        let data = DataBindings::new()
            .vector("alpha", vec![1.0, 1.0, 1.0])
            .vector("z", vec![1.0, 2.0, 3.0, 2.0]);
        let g = Graph::compile(
            "model {
                p ~ ddirch(alpha)
                for (i in 1:4) { z[i] ~ dcat(p) }
            }",
            &data,
        )
        .unwrap();
        assert_eq!(kernel_of(&g, "p"), KernelKind::ConjugateDirichlet);
    }

    #[test]
    fn beta_over_bernoulli_is_conjugate() {
        let data = DataBindings::new().vector("z", vec![1.0, 0.0, 1.0]);
        let g = Graph::compile(
            "model {
                p ~ dbeta(1, 1)
                for (i in 1:3) { z[i] ~ dbern(p) }
            }",
            &data,
        )
        .unwrap();
        assert_eq!(kernel_of(&g, "p"), KernelKind::ConjugateBeta);
    }

    #[test]
    fn latent_discrete_sites_enumerate_their_support() {
        // None of z, k, c is bound in the data, so all three are sampled.
        let data = DataBindings::new().vector("p", vec![0.2, 0.3, 0.5]);
        let g = Graph::compile(
            "model {
                z ~ dbern(0.5)
                k ~ dbin(0.4, 6)
                c ~ dcat(p)
            }",
            &data,
        )
        .unwrap();
        for name in ["z", "k", "c"] {
            assert_eq!(kernel_of(&g, name), KernelKind::DiscreteEnumeration);
        }
    }

    #[test]
    fn leaf_site_with_no_children_keeps_its_prior_kernel() {
        // With no likelihood terms the conjugate update reduces to a draw
        // from the prior, which is still exact.
        let g = Graph::compile("model { mu ~ dnorm(0, 1) }", &DataBindings::new()).unwrap();
        assert_eq!(kernel_of(&g, "mu"), KernelKind::ConjugateNormal);
    }
}
