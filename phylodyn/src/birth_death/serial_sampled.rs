//! Constant-rate serially sampled birth-death process.
//!
//! Like the fossilized process, except that sampling through time removes
//! the lineage: every serial sample is a tip and sampled ancestors cannot
//! occur.

use phylodyn_core::{PhyloError, Result};
use rand::RngCore;

use super::constant::{ln_missing_lineage_prob, simulate_divergence_time, ConstantRateTerms};
use super::fossilized::count_samples;
use super::{BirthDeathModel, BirthDeathProcess, BirthDeathSettings, StartAge, TimesContext};
use crate::graph::{DagNodeId, Graph};
use crate::model::{ParameterSet, Role};
use crate::tree::AGE_TOLERANCE;

/// Node-age density of the serially sampled birth-death process.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialSampledBirthDeath;

/// The serially sampled birth-death tree prior.
pub type ConstantRateSerialSampledBirthDeathProcess = BirthDeathProcess<SerialSampledBirthDeath>;

impl BirthDeathProcess<SerialSampledBirthDeath> {
    /// Serially sampled prior with speciation `lambda`, extinction `mu`,
    /// sampling-with-removal `psi` and extant sampling fraction `rho`.
    pub fn serial_sampled(
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
        Self::with_model(settings, SerialSampledBirthDeath, params)
    }
}

/// Probability that one lineage leaves exactly one sampled extant
/// descendant after `t`, and the ratio `u` of the geometric distribution of
/// the number of sampled descendants.
fn geometric_terms(lambda: f64, mu: f64, rho: f64, t: f64) -> (f64, f64) {
    let r = lambda - mu;
    if r.abs() < 1e-12 {
        let x = rho * lambda * t;
        return (rho / (1.0 + x).powi(2), x / (1.0 + x));
    }
    let e = (-r * t).exp();
    let d = rho * lambda + (lambda * (1.0 - rho) - mu) * e;
    let p1 = rho * r * r * e / (d * d);
    let u = lambda * rho * (1.0 - e) / d;
    (p1, u)
}

impl BirthDeathModel for SerialSampledBirthDeath {
    fn name(&self) -> &'static str {
        "ConstantRateSerialSampledBirthDeathProcess"
    }

    fn allows_sampled_ancestors(&self) -> bool {
        false
    }

    fn supports_num_taxa(&self) -> bool {
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
        if counts.sampled_ancestors > 0 {
            return Ok(f64::NEG_INFINITY);
        }
        if counts.fossils > 0 && terms.psi <= 0.0 {
            return Err(PhyloError::InvalidInput(format!(
                "sampling rate is zero but the tree holds {} serially sampled tips",
                counts.fossils
            )));
        }

        let num_initial = ctx.start.num_initial_lineages() as f64;
        let mut ln_prob = -num_initial * terms.ln_q(ctx.start_age);
        if counts.extant > 0 {
            ln_prob += counts.extant as f64 * (4.0 * terms.rho).ln();
        }
        let ln_lambda = terms.lambda.ln();
        for id in tree.internal_nodes() {
            if id == tree.root() && ctx.start == StartAge::RootAge {
                continue;
            }
            ln_prob += ln_lambda - terms.ln_q(tree.node(id).age);
        }
        let ln_psi = terms.psi.ln();
        for id in tree.tips() {
            let age = tree.node(id).age;
            if age > AGE_TOLERANCE {
                ln_prob += ln_psi + terms.ln_q(age);
            }
        }
        Ok(ln_prob)
    }

    fn p_survival(&self, params: &ParameterSet, graph: &Graph, start: f64, end: f64) -> Result<f64> {
        let terms = ConstantRateTerms::from_parameters(params, graph)?;
        Ok(1.0 - terms.p0(end - start))
    }

    /// Geometric law of the reconstructed process. Serial sampling is not
    /// part of it: `n` counts extant samples only.
    fn ln_prob_num_taxa(
        &self,
        params: &ParameterSet,
        graph: &Graph,
        n: usize,
        start_age: f64,
        start: StartAge,
    ) -> Result<f64> {
        let terms = ConstantRateTerms::from_parameters(params, graph)?;
        let (p1, u) = geometric_terms(terms.lambda, terms.mu, terms.rho, start_age);
        let n = n as f64;
        Ok(match start {
            StartAge::Origin if n >= 1.0 => p1.ln() + (n - 1.0) * u.ln(),
            StartAge::RootAge if n >= 2.0 => (n - 1.0).ln() + 2.0 * p1.ln() + (n - 2.0) * u.ln(),
            _ => f64::NEG_INFINITY,
        })
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
    use crate::tree::{Taxon, TimeTree};

    fn setup(start_age: f64, lambda: f64, mu: f64, psi: f64, rho: f64) -> (Graph, [DagNodeId; 5]) {
        let mut graph = Graph::new();
        let ids = [
            graph.add_stochastic("start", start_age),
            graph.add_stochastic("lambda", lambda),
            graph.add_stochastic("mu", mu),
            graph.add_stochastic("psi", psi),
            graph.add_constant("rho", rho),
        ];
        (graph, ids)
    }

    fn process(
        ids: [DagNodeId; 5],
        tree: &TimeTree,
        origin: bool,
        condition: Condition,
    ) -> ConstantRateSerialSampledBirthDeathProcess {
        let taxa: Vec<Taxon> = tree
            .tips()
            .filter_map(|id| tree.node(id).taxon.clone())
            .collect();
        let settings = BirthDeathSettings {
            origin: origin.then_some(ids[0]),
            root_age: (!origin).then_some(ids[0]),
            condition,
            taxa,
            constraints: Vec::new(),
        };
        BirthDeathProcess::serial_sampled(settings, ids[1], ids[2], ids[3], ids[4]).unwrap()
    }

    #[test]
    fn serial_tip_term() {
        let tree = TimeTree::from_newick("((A:1.0,F:0.6):0.5,B:1.5);").unwrap();
        let (graph, ids) = setup(2.0, 1.0, 0.3, 0.2, 0.8);
        let mut p = process(ids, &tree, true, Condition::Time);
        let lp = p.ln_probability(&graph, &tree).unwrap();

        let t = ConstantRateTerms::new(1.0, 0.3, 0.2, 0.8);
        let expected = -t.ln_q(2.0)
            + 2.0 * (4.0 * 0.8f64).ln()
            + (0.0 - t.ln_q(1.0))
            + (0.0 - t.ln_q(1.5))
            + 0.2f64.ln()
            + t.ln_q(0.4)
            + log_tree_topology_prob(3);
        assert!((lp - expected).abs() < 1e-10, "{} vs {}", lp, expected);
    }

    #[test]
    fn sampled_ancestors_are_impossible() {
        let tree = TimeTree::from_newick("((A:1.0,S:0.0):0.5,B:1.5);").unwrap();
        let (graph, ids) = setup(2.0, 1.0, 0.3, 0.2, 1.0);
        let mut p = process(ids, &tree, true, Condition::Time);
        assert_eq!(p.ln_probability(&graph, &tree).unwrap(), f64::NEG_INFINITY);
    }

    #[test]
    fn zero_sampling_rate_with_serial_tips_is_an_error() {
        let tree = TimeTree::from_newick("((A:1.0,F:0.6):0.5,B:1.5);").unwrap();
        let (graph, ids) = setup(2.0, 1.0, 0.3, 0.0, 1.0);
        let mut p = process(ids, &tree, true, Condition::Time);
        assert!(matches!(
            p.ln_probability(&graph, &tree),
            Err(PhyloError::InvalidInput(_))
        ));

        let extant = TimeTree::from_newick("((A:1.0,F:1.0):0.5,B:1.5);").unwrap();
        let mut p = process(ids, &extant, true, Condition::Time);
        assert!(p.ln_probability(&graph, &extant).unwrap().is_finite());
    }

    #[test]
    fn yule_geometric_terms() {
        let (p1, u) = geometric_terms(1.5, 0.0, 1.0, 2.0);
        assert!((p1 - (-3.0f64).exp()).abs() < 1e-12);
        assert!((u - (1.0 - (-3.0f64).exp())).abs() < 1e-12);
    }

    #[test]
    fn taxon_counts_sum_to_survival() {
        let (graph, ids) = setup(2.0, 1.2, 0.5, 0.0, 0.7);
        let tree = TimeTree::from_newick("(A:1.0,B:1.0);").unwrap();
        let p = process(ids, &tree, true, Condition::Time);
        let params = p.parameters();
        let model = SerialSampledBirthDeath;

        let origin: f64 = (1..4000)
            .map(|n| model.ln_prob_num_taxa(params, &graph, n, 2.0, StartAge::Origin).unwrap().exp())
            .sum();
        let root: f64 = (2..4000)
            .map(|n| model.ln_prob_num_taxa(params, &graph, n, 2.0, StartAge::RootAge).unwrap().exp())
            .sum();
        let survival = model.p_survival(params, &graph, 0.0, 2.0).unwrap();
        assert!((origin - survival).abs() < 1e-9, "{} vs {}", origin, survival);
        assert!((root - survival * survival).abs() < 1e-9);
        assert_eq!(
            model.ln_prob_num_taxa(params, &graph, 1, 2.0, StartAge::RootAge).unwrap(),
            f64::NEG_INFINITY
        );
    }

    #[test]
    fn num_taxa_conditioning() {
        let tree = TimeTree::from_newick("((A:0.8,B:0.8):0.7,(C:0.8,D:0.8):0.7);").unwrap();
        let (graph, ids) = setup(1.5, 1.0, 0.3, 0.1, 1.0);
        let mut time = process(ids, &tree, false, Condition::Time);
        let mut n_taxa = process(ids, &tree, false, Condition::NumTaxa);
        let a = time.ln_probability(&graph, &tree).unwrap();
        let b = n_taxa.ln_probability(&graph, &tree).unwrap();
        let p_n = SerialSampledBirthDeath
            .ln_prob_num_taxa(time.parameters(), &graph, 4, 1.5, StartAge::RootAge)
            .unwrap();
        assert!((b - (a - p_n)).abs() < 1e-10);
    }
}
