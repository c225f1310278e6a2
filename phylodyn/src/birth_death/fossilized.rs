//! Constant-rate fossilized birth-death process.
//!
//! Lineages speciate at rate λ, go extinct at rate μ and are sampled through
//! time at rate ψ without being removed, so a sampled lineage may go on to
//! leave sampled descendants (a sampled ancestor). Extant lineages are
//! sampled with probability ρ.

use phylodyn_core::{PhyloError, Result};
use rand::RngCore;

use super::constant::{ln_missing_lineage_prob, simulate_divergence_time, ConstantRateTerms};
use super::{BirthDeathModel, BirthDeathProcess, BirthDeathSettings, StartAge, TimesContext};
use crate::graph::{DagNodeId, Graph};
use crate::model::{ParameterSet, Role};
use crate::tree::{TimeTree, AGE_TOLERANCE};

/// Node-age density of the fossilized birth-death process.
#[derive(Debug, Clone, Copy, Default)]
pub struct FossilizedBirthDeath;

/// The fossilized birth-death tree prior.
pub type ConstantRateFossilizedBirthDeathProcess = BirthDeathProcess<FossilizedBirthDeath>;

impl BirthDeathProcess<FossilizedBirthDeath> {
    /// Fossilized birth-death prior with speciation `lambda`, extinction
    /// `mu`, fossilization `psi` and extant sampling fraction `rho`.
    pub fn fossilized(
        settings: BirthDeathSettings,
        lambda: DagNodeId,
        mu: DagNodeId,
        psi: DagNodeId,
        rho: DagNodeId,
    ) -> Result<Self> {
        let params = ParameterSet::new()
            .with(Role::Speciation, lambda)
            .with(Role::Extinction, mu)
            .with(Role::Fossilization, psi)
            .with(Role::SamplingFraction, rho);
        Self::with_model(settings, FossilizedBirthDeath, params)
    }
}

/// Counts of the sampled nodes of a tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SampleCounts {
    pub extant: usize,
    pub fossils: usize,
    pub sampled_ancestors: usize,
}

pub(crate) fn count_samples(tree: &TimeTree) -> SampleCounts {
    let mut counts = SampleCounts::default();
    for id in tree.tips() {
        let node = tree.node(id);
        if node.sampled_ancestor {
            counts.sampled_ancestors += 1;
        } else if node.age > AGE_TOLERANCE {
            counts.fossils += 1;
        } else {
            counts.extant += 1;
        }
    }
    counts
}

impl BirthDeathModel for FossilizedBirthDeath {
    fn name(&self) -> &'static str {
        "ConstantRateFossilizedBirthDeathProcess"
    }

    fn allows_sampled_ancestors(&self) -> bool {
        true
    }

    fn supports_incomplete_clades(&self) -> bool {
        true
    }

    fn ln_missing_in_clade(
        &self,
        params: &ParameterSet,
        graph: &Graph,
        clade_age: f64,
        start_age: f64,
    ) -> Result<f64> {
        let terms = ConstantRateTerms::from_parameters(params, graph)?;
        Ok(ln_missing_lineage_prob(terms.lambda, terms.mu, clade_age, start_age))
    }

    fn ln_prob_times(&self, ctx: &TimesContext<'_>) -> Result<f64> {
        let terms = ConstantRateTerms::from_parameters(ctx.params, ctx.graph)?;
        let tree = ctx.tree;
        let counts = count_samples(tree);
        let sampled = counts.fossils + counts.sampled_ancestors;
        if sampled > 0 && terms.psi <= 0.0 {
            return Err(PhyloError::InvalidInput(format!(
                "fossilization rate is zero but the tree holds {} serially sampled nodes",
                sampled
            )));
        }
        if ctx.start == StartAge::RootAge && tree.has_sampled_ancestor_child(tree.root()) {
            return Ok(f64::NEG_INFINITY);
        }

        let num_initial = ctx.start.num_initial_lineages() as f64;
        let mut ln_prob = -num_initial * terms.ln_q(ctx.start_age);
        if sampled > 0 {
            ln_prob += sampled as f64 * terms.psi.ln();
        }
        if counts.extant > 0 {
            ln_prob += counts.extant as f64 * (4.0 * terms.rho).ln();
        }

        let ln_lambda = terms.lambda.ln();
        for id in tree.internal_nodes() {
            if tree.has_sampled_ancestor_child(id) {
                continue;
            }
            if id == tree.root() && ctx.start == StartAge::RootAge {
                continue;
            }
            ln_prob += ln_lambda - terms.ln_q(tree.node(id).age);
        }

        for id in tree.tips() {
            let node = tree.node(id);
            if node.sampled_ancestor || node.age <= AGE_TOLERANCE {
                continue;
            }
            ln_prob += terms.p0(node.age).ln() + terms.ln_q(node.age);
        }
        Ok(ln_prob)
    }

    fn p_survival(&self, params: &ParameterSet, graph: &Graph, start: f64, end: f64) -> Result<f64> {
        let terms = ConstantRateTerms::from_parameters(params, graph)?;
        Ok(1.0 - terms.p0(end - start))
    }

    fn simulate_divergence_time(
        &self,
        params: &ParameterSet,
        graph: &Graph,
        start_age: f64,
        rng: &mut dyn RngCore,
    ) -> Result<f64> {
        let terms = ConstantRateTerms::from_parameters(params, graph)?;
        Ok(simulate_divergence_time(terms.lambda, terms.mu, terms.rho, start_age, rng))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::birth_death::{log_tree_topology_prob, Condition};
    use crate::model::TreeDistribution;
    use crate::tree::Taxon;

    struct Setup {
        graph: Graph,
        start: DagNodeId,
        lambda: DagNodeId,
        mu: DagNodeId,
        psi: DagNodeId,
        rho: DagNodeId,
    }

    fn setup(start_age: f64, lambda: f64, mu: f64, psi: f64, rho: f64) -> Setup {
        let mut graph = Graph::new();
        let start = graph.add_stochastic("start", start_age);
        let lambda = graph.add_stochastic("lambda", lambda);
        let mu = graph.add_stochastic("mu", mu);
        let psi = graph.add_stochastic("psi", psi);
        let rho = graph.add_constant("rho", rho);
        Setup {
            graph,
            start,
            lambda,
            mu,
            psi,
            rho,
        }
    }

    fn process(
        s: &Setup,
        tree: &TimeTree,
        origin: bool,
        condition: Condition,
    ) -> ConstantRateFossilizedBirthDeathProcess {
        let taxa = tree
            .tips()
            .filter_map(|id| tree.node(id).taxon.clone())
            .collect::<Vec<Taxon>>();
        let settings = BirthDeathSettings {
            origin: origin.then_some(s.start),
            root_age: (!origin).then_some(s.start),
            condition,
            taxa,
            constraints: Vec::new(),
        };
        BirthDeathProcess::fossilized(settings, s.lambda, s.mu, s.psi, s.rho).unwrap()
    }

    #[test]
    fn yule_cherry_from_origin() {
        let tree = TimeTree::from_newick("(A:0.5,B:0.5);").unwrap();
        let s = setup(2.0, 1.3, 0.0, 0.0, 1.0);
        let mut p = process(&s, &tree, true, Condition::Time);
        let lp = p.ln_probability(&s.graph, &tree).unwrap();
        let expected = 1.3f64.ln() - 1.3 * 2.0 - 1.3 * 0.5;
        assert!((lp - expected).abs() < 1e-10, "{} vs {}", lp, expected);
    }

    #[test]
    fn zero_fossilization_with_fossils_is_an_error() {
        let tree = TimeTree::from_newick("((A:1.0,F:0.6):0.5,B:1.5);").unwrap();
        let s = setup(2.0, 1.0, 0.3, 0.0, 1.0);
        let mut p = process(&s, &tree, true, Condition::Time);
        assert!(matches!(
            p.ln_probability(&s.graph, &tree),
            Err(PhyloError::InvalidInput(_))
        ));
    }

    #[test]
    fn fossil_tip_contributes_sampling_and_extinction() {
        // One fossil tip F at age 0.4 whose lineage joins A at 1.0.
        let tree = TimeTree::from_newick("((A:1.0,F:0.6):0.5,B:1.5);").unwrap();
        let (lambda, mu, psi, rho) = (1.0, 0.3, 0.2, 0.8);
        let s = setup(2.0, lambda, mu, psi, rho);
        let mut p = process(&s, &tree, true, Condition::Time);
        let lp = p.ln_probability(&s.graph, &tree).unwrap();

        let t = ConstantRateTerms::new(lambda, mu, psi, rho);
        let expected = psi.ln() + 2.0 * (4.0 * rho).ln() - t.ln_q(2.0)
            + (lambda.ln() - t.ln_q(1.0))
            + (lambda.ln() - t.ln_q(1.5))
            + t.p0(0.4).ln()
            + t.ln_q(0.4)
            + log_tree_topology_prob(3);
        assert!((lp - expected).abs() < 1e-10, "{} vs {}", lp, expected);
    }

    #[test]
    fn sampled_ancestor_node_is_not_a_speciation() {
        let with_sa = TimeTree::from_newick("((A:1.0,S:0.0):0.5,B:1.5);").unwrap();
        let s = setup(2.0, 1.0, 0.3, 0.2, 1.0);
        let mut p = process(&s, &with_sa, true, Condition::Time);
        let lp = p.ln_probability(&s.graph, &with_sa).unwrap();

        let t = ConstantRateTerms::new(1.0, 0.3, 0.2, 1.0);
        let expected = 0.2f64.ln() + 2.0 * 4f64.ln() - t.ln_q(2.0)
            + (1.0f64.ln() - t.ln_q(1.5))
            + log_tree_topology_prob(3);
        assert!((lp - expected).abs() < 1e-10, "{} vs {}", lp, expected);
    }

    #[test]
    fn sampled_ancestor_at_root_is_impossible_from_the_root() {
        let tree = TimeTree::from_newick("((A:1.0,B:1.0):0.5,S:0.0);").unwrap();
        let s = setup(1.5, 1.0, 0.3, 0.2, 1.0);
        let mut p = process(&s, &tree, false, Condition::Time);
        assert_eq!(p.ln_probability(&s.graph, &tree).unwrap(), f64::NEG_INFINITY);
    }

    #[test]
    fn survival_conditioning_subtracts_per_root_lineage() {
        let tree = TimeTree::from_newick("((A:0.8,B:0.8):0.7,(C:0.8,D:0.8):0.7);").unwrap();
        let s = setup(1.5, 1.0, 0.3, 0.1, 0.9);
        let mut time = process(&s, &tree, false, Condition::Time);
        let mut survival = process(&s, &tree, false, Condition::Survival);
        let a = time.ln_probability(&s.graph, &tree).unwrap();
        let b = survival.ln_probability(&s.graph, &tree).unwrap();
        let t = ConstantRateTerms::new(1.0, 0.3, 0.1, 0.9);
        let expected = a - 2.0 * (1.0 - t.p0(1.5)).ln();
        assert!((b - expected).abs() < 1e-10);
    }

    #[test]
    fn num_taxa_is_rejected_at_construction() {
        let s = setup(2.0, 1.0, 0.3, 0.1, 1.0);
        let settings = BirthDeathSettings {
            origin: Some(s.start),
            condition: Condition::NumTaxa,
            taxa: vec![Taxon::new("A"), Taxon::new("B")],
            ..Default::default()
        };
        assert!(BirthDeathProcess::fossilized(settings, s.lambda, s.mu, s.psi, s.rho).is_err());
    }

    #[test]
    fn counts_samples() {
        let tree = TimeTree::from_newick("(((A:1.0,S:0.0):0.2,F:0.7):0.3,B:1.5);").unwrap();
        let counts = count_samples(&tree);
        assert_eq!(
            counts,
            SampleCounts {
                extant: 2,
                fossils: 1,
                sampled_ancestors: 1
            }
        );
    }
}
