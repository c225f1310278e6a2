//! Episodic birth-death-sampling-treatment process.
//!
//! Rates are piecewise constant over a timeline of ages
//! `s_0 < s_1 < … < s_l`, where `s_0` is the age of the youngest sample and
//! `s_1..s_l` are the breakpoints. Interval `i` covers `[s_i, s_{i+1})`
//! and has speciation λ_i, extinction μ_i, serial sampling ψ_i and
//! treatment r_i (the probability that a serial sample removes its lineage).
//! At each breakpoint `s_i` three events may hit every lineage: a burst of
//! speciation with probability Λ_i, a mass extinction with probability M_i
//! and event sampling with probability Φ_i (treated with probability r_i).
//! Sampling at the present, `Φ_0`, is the sampling fraction ρ.
//!
//! Per interval the extinction probability `E_i(t)` and the observation
//! density `D_i(t)` have closed forms in terms of
//!
//! ```text
//! A_i = sqrt((λ_i - μ_i - ψ_i)^2 + 4 λ_i ψ_i)
//! B_i = ((1 - 2 C_i) λ_i + μ_i + ψ_i) / A_i
//! ```
//!
//! with `C_i = E_i(s_i)` carried across each breakpoint. Every node of the
//! tree contributes one factor according to its kind: extant tip, serial
//! tip, event tip, serial or event sampled ancestor, ordinary or burst
//! bifurcation.

use phylodyn_core::{PhyloError, Result};
use rand::RngCore;
use tracing::debug;

use super::constant::simulate_divergence_time;
use super::{BirthDeathModel, BirthDeathProcess, BirthDeathSettings, StartAge, TimesContext};
use crate::graph::{DagNodeId, Graph};
use crate::model::{ParameterSet, Role};
use crate::tree::{TimeTree, AGE_TOLERANCE};

/// Graph nodes of an episodic process. Missing optional parameters default
/// to no breakpoints, no treatment and no events.
#[derive(Debug, Clone, Copy)]
pub struct EpisodicParameters {
    /// Breakpoint ages, ascending and older than every sample.
    pub timeline: Option<DagNodeId>,
    pub speciation: DagNodeId,
    pub extinction: DagNodeId,
    pub fossilization: DagNodeId,
    pub treatment: Option<DagNodeId>,
    pub sampling_fraction: DagNodeId,
    pub burst_speciation: Option<DagNodeId>,
    pub mass_extinction: Option<DagNodeId>,
    pub event_sampling: Option<DagNodeId>,
}

impl EpisodicParameters {
    fn into_parameter_set(self) -> ParameterSet {
        ParameterSet::new()
            .with_optional(Role::Timeline, self.timeline)
            .with(Role::Speciation, self.speciation)
            .with(Role::Extinction, self.extinction)
            .with(Role::Fossilization, self.fossilization)
            .with_optional(Role::Treatment, self.treatment)
            .with(Role::SamplingFraction, self.sampling_fraction)
            .with_optional(Role::BurstSpeciation, self.burst_speciation)
            .with_optional(Role::MassExtinction, self.mass_extinction)
            .with_optional(Role::EventSampling, self.event_sampling)
    }
}

/// Interval bookkeeping, rebuilt from the parameters on every evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Intervals {
    times: Vec<f64>,
    lambda: Vec<f64>,
    mu: Vec<f64>,
    psi: Vec<f64>,
    treatment: Vec<f64>,
    // Event probabilities per boundary; entry 0 is the present.
    burst: Vec<f64>,
    mass_extinction: Vec<f64>,
    event_sampling: Vec<f64>,
    a: Vec<f64>,
    b: Vec<f64>,
    c: Vec<f64>,
    e_previous: Vec<f64>,
    ln_d_previous: Vec<f64>,
}

fn check_probabilities(role: Role, values: &[f64]) -> Result<()> {
    match values.iter().find(|p| !(0.0..=1.0).contains(*p)) {
        Some(p) => Err(PhyloError::InvalidInput(format!(
            "{:?} value {} is not a probability",
            role, p
        ))),
        None => Ok(()),
    }
}

impl Intervals {
    /// Read and validate the parameters, then run the recurrence over the
    /// intervals from the youngest to the oldest.
    ///
    /// # Errors
    ///
    /// Returns an error if breakpoints are not ascending or not older than
    /// `offset`, if a vector has the wrong length, or if a rate or
    /// probability is out of range.
    pub fn new(params: &ParameterSet, graph: &Graph, offset: f64) -> Result<Self> {
        let breakpoints: Vec<f64> = match params.optional(Role::Timeline) {
            Some(id) => graph.vector(id)?.to_vec(),
            None => Vec::new(),
        };
        for (i, &s) in breakpoints.iter().enumerate() {
            if s <= offset {
                return Err(PhyloError::InvalidInput(format!(
                    "breakpoint {} is not older than the youngest sample ({})",
                    s, offset
                )));
            }
            if i > 0 && s <= breakpoints[i - 1] {
                return Err(PhyloError::InvalidInput(format!(
                    "breakpoints must be ascending, found {} after {}",
                    s,
                    breakpoints[i - 1]
                )));
            }
        }

        let n = breakpoints.len() + 1;
        let lambda = params.values(graph, Role::Speciation, n)?;
        let mu = params.values(graph, Role::Extinction, n)?;
        let psi = params.values(graph, Role::Fossilization, n)?;
        let treatment = params.values_or(graph, Role::Treatment, n, 0.0)?;
        let rho = params.real(graph, Role::SamplingFraction)?;
        if lambda.iter().any(|&x| x <= 0.0) {
            return Err(PhyloError::InvalidInput(
                "speciation rates must be positive".into(),
            ));
        }
        if mu.iter().chain(psi.iter()).any(|&x| x < 0.0) {
            return Err(PhyloError::InvalidInput(
                "extinction and sampling rates must be non-negative".into(),
            ));
        }

        let mut burst = vec![0.0];
        burst.extend(params.values_or(graph, Role::BurstSpeciation, n - 1, 0.0)?);
        let mut mass_extinction = vec![0.0];
        mass_extinction.extend(params.values_or(graph, Role::MassExtinction, n - 1, 0.0)?);
        let mut event_sampling = vec![rho];
        event_sampling.extend(params.values_or(graph, Role::EventSampling, n - 1, 0.0)?);
        check_probabilities(Role::Treatment, &treatment)?;
        check_probabilities(Role::BurstSpeciation, &burst)?;
        check_probabilities(Role::MassExtinction, &mass_extinction)?;
        check_probabilities(Role::EventSampling, &event_sampling)?;

        let mut times = Vec::with_capacity(n);
        times.push(offset);
        times.extend(breakpoints);

        let mut iv = Self {
            times,
            lambda,
            mu,
            psi,
            treatment,
            burst,
            mass_extinction,
            event_sampling,
            a: vec![0.0; n],
            b: vec![0.0; n],
            c: vec![0.0; n],
            e_previous: vec![1.0; n],
            ln_d_previous: vec![0.0; n],
        };
        for i in 0..n {
            if i == 0 {
                iv.c[0] = 1.0 - rho;
            } else {
                let s = iv.times[i];
                let e_minus = iv.extinction_in(i - 1, s);
                let (phi, m, l) = (iv.event_sampling[i], iv.mass_extinction[i], iv.burst[i]);
                iv.c[i] = (1.0 - phi) * (m + (1.0 - m) * ((1.0 - l) * e_minus + l * e_minus * e_minus));
                iv.e_previous[i] = e_minus;
                iv.ln_d_previous[i] = iv.ln_density_in(i - 1, s)
                    + ((1.0 - phi) * (1.0 - m) * (1.0 - l + 2.0 * l * e_minus)).ln();
            }
            let (lambda, mu, psi) = (iv.lambda[i], iv.mu[i], iv.psi[i]);
            iv.a[i] = ((lambda - mu - psi).powi(2) + 4.0 * lambda * psi).sqrt();
            iv.b[i] = ((1.0 - 2.0 * iv.c[i]) * lambda + mu + psi) / iv.a[i];
        }
        Ok(iv)
    }

    /// Number of intervals.
    pub fn len(&self) -> usize {
        self.times.len()
    }

    /// Always false: there is at least the present interval.
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Start ages `s_0..s_l` of the intervals.
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    /// Interval containing age `t`. Ages past the last breakpoint belong to
    /// the last interval; ages below `s_0` are clamped to the first.
    pub fn find_index(&self, t: f64) -> usize {
        debug_assert!(
            t >= self.times[0] - AGE_TOLERANCE,
            "age {} below the youngest sample {}",
            t,
            self.times[0]
        );
        self.times.iter().rposition(|&s| s <= t).unwrap_or(0)
    }

    /// Breakpoint index `i >= 1` with `s_i` equal to `t`, if any.
    fn boundary_at(&self, t: f64) -> Option<usize> {
        (1..self.times.len()).find(|&i| (t - self.times[i]).abs() <= AGE_TOLERANCE)
    }

    fn extinction_in(&self, i: usize, t: f64) -> f64 {
        let (a, b) = (self.a[i], self.b[i]);
        let x = (-a * (t - self.times[i])).exp();
        (self.lambda[i] + self.mu[i] + self.psi[i]
            - a * (1.0 + b - x * (1.0 - b)) / (1.0 + b + x * (1.0 - b)))
            / (2.0 * self.lambda[i])
    }

    fn ln_density_in(&self, i: usize, t: f64) -> f64 {
        let (a, b) = (self.a[i], self.b[i]);
        let dt = t - self.times[i];
        let x = (-a * dt).exp();
        self.ln_d_previous[i] + 4f64.ln() - a * dt - 2.0 * (1.0 + b + x * (1.0 - b)).ln()
    }

    /// Probability that a lineage alive at age `t` leaves no sample.
    pub fn extinction(&self, t: f64) -> f64 {
        self.extinction_in(self.find_index(t), t)
    }

    /// Log observation density at age `t`.
    pub fn ln_density(&self, t: f64) -> f64 {
        self.ln_density_in(self.find_index(t), t)
    }
}

/// Node-age density of the episodic process; caches the interval
/// bookkeeping of the latest evaluation.
#[derive(Debug, Clone, Default)]
pub struct EpisodicSamplingTreatment {
    intervals: Option<Intervals>,
}

impl EpisodicSamplingTreatment {
    /// Bookkeeping of the latest evaluation.
    pub fn intervals(&self) -> Option<&Intervals> {
        self.intervals.as_ref()
    }
}

/// The episodic birth-death-sampling-treatment tree prior.
pub type EpisodicBirthDeathSamplingTreatmentProcess = BirthDeathProcess<EpisodicSamplingTreatment>;

impl BirthDeathProcess<EpisodicSamplingTreatment> {
    /// Episodic prior over the given parameter nodes.
    pub fn episodic(settings: BirthDeathSettings, parameters: EpisodicParameters) -> Result<Self> {
        Self::with_model(
            settings,
            EpisodicSamplingTreatment::default(),
            parameters.into_parameter_set(),
        )
    }
}

fn youngest_age(tree: &TimeTree) -> f64 {
    tree.tips()
        .map(|id| tree.node(id).age)
        .fold(f64::INFINITY, f64::min)
}

/// NaN or −∞ ends the evaluation early.
fn early_exit(ln_prob: f64) -> Option<f64> {
    if ln_prob.is_nan() || ln_prob == f64::NEG_INFINITY {
        Some(ln_prob)
    } else {
        None
    }
}

impl BirthDeathModel for EpisodicSamplingTreatment {
    fn name(&self) -> &'static str {
        "EpisodicBirthDeathSamplingTreatmentProcess"
    }

    fn allows_sampled_ancestors(&self) -> bool {
        true
    }

    fn prepare(&mut self, params: &ParameterSet, graph: &Graph, tree: &TimeTree) -> Result<()> {
        let iv = Intervals::new(params, graph, youngest_age(tree))?;
        debug!(intervals = iv.len(), offset = iv.times[0], "episodic timeline prepared");
        self.intervals = Some(iv);
        Ok(())
    }

    fn ln_prob_times(&self, ctx: &TimesContext<'_>) -> Result<f64> {
        let tree = ctx.tree;
        let fresh;
        let iv = match &self.intervals {
            Some(iv) => iv,
            None => {
                fresh = Intervals::new(ctx.params, ctx.graph, youngest_age(tree))?;
                &fresh
            }
        };
        if ctx.start == StartAge::RootAge && tree.has_sampled_ancestor_child(tree.root()) {
            return Ok(f64::NEG_INFINITY);
        }

        let mut ln_prob = 0.0;
        for id in tree.tips() {
            let node = tree.node(id);
            if node.sampled_ancestor {
                continue;
            }
            let t = node.age;
            ln_prob += if (t - iv.times[0]).abs() <= AGE_TOLERANCE {
                iv.event_sampling[0].ln()
            } else if let Some(i) = iv.boundary_at(t).filter(|&i| iv.event_sampling[i] > 0.0) {
                let r = iv.treatment[i];
                iv.event_sampling[i].ln() + (r + (1.0 - r) * iv.e_previous[i]).ln()
                    - iv.ln_d_previous[i]
            } else {
                let i = iv.find_index(t);
                let r = iv.treatment[i];
                -iv.ln_density_in(i, t) + (iv.psi[i] * (r + (1.0 - r) * iv.extinction_in(i, t))).ln()
            };
        }
        if let Some(exit) = early_exit(ln_prob) {
            return Ok(exit);
        }

        for id in tree.internal_nodes() {
            if id == tree.root() && ctx.start == StartAge::RootAge {
                continue;
            }
            let t = tree.node(id).age;
            ln_prob += if tree.has_sampled_ancestor_child(id) {
                match iv.boundary_at(t).filter(|&i| iv.event_sampling[i] > 0.0) {
                    Some(i) => {
                        iv.event_sampling[i].ln() + (1.0 - iv.treatment[i]).ln()
                            + iv.ln_density_in(i - 1, t)
                            - iv.ln_d_previous[i]
                    }
                    None => {
                        let i = iv.find_index(t);
                        iv.psi[i].ln() + (1.0 - iv.treatment[i]).ln()
                    }
                }
            } else {
                match iv.boundary_at(t).filter(|&i| iv.burst[i] > 0.0) {
                    Some(i) => {
                        2.0 * iv.ln_density_in(i - 1, t) - iv.ln_d_previous[i] + iv.burst[i].ln()
                    }
                    None => {
                        let i = iv.find_index(t);
                        iv.ln_density_in(i, t) + iv.lambda[i].ln()
                    }
                }
            };
        }
        if let Some(exit) = early_exit(ln_prob) {
            return Ok(exit);
        }

        let start = iv.find_index(ctx.start_age);
        ln_prob += match ctx.start {
            StartAge::Origin => iv.ln_density_in(start, ctx.start_age),
            StartAge::RootAge => 2.0 * iv.ln_density_in(start, ctx.start_age),
        };
        Ok(early_exit(ln_prob).unwrap_or(ln_prob))
    }

    /// `1 - E(end)`; `start` is the age the timeline is anchored at when no
    /// evaluation has prepared it yet.
    fn p_survival(&self, params: &ParameterSet, graph: &Graph, start: f64, end: f64) -> Result<f64> {
        let fresh;
        let iv = match &self.intervals {
            Some(iv) => iv,
            None => {
                fresh = Intervals::new(params, graph, start)?;
                &fresh
            }
        };
        Ok(1.0 - iv.extinction(end))
    }

    /// Draws use the rates of the present interval only.
    fn simulate_divergence_time(
        &self,
        params: &ParameterSet,
        graph: &Graph,
        start_age: f64,
        rng: &mut dyn RngCore,
    ) -> Result<f64> {
        let present = |role: Role| -> Result<f64> {
            let id = params.get(role)?;
            match graph.vector(id) {
                Ok(v) => v.first().copied().ok_or_else(|| {
                    PhyloError::InvalidInput(format!("{:?} has no values", role))
                }),
                Err(_) => graph.real(id),
            }
        };
        let lambda = present(Role::Speciation)?;
        let mu = present(Role::Extinction)?;
        let rho = params.real(graph, Role::SamplingFraction)?;
        Ok(simulate_divergence_time(lambda, mu, rho, start_age, rng))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::birth_death::Condition;
    use crate::model::TreeDistribution;
    use crate::tree::{Clade, Taxon};

    struct Setup {
        graph: Graph,
        start: DagNodeId,
        params: EpisodicParameters,
    }

    fn setup(start_age: f64, lambda: f64, mu: f64, psi: f64, rho: f64) -> Setup {
        let mut graph = Graph::new();
        let start = graph.add_stochastic("start", start_age);
        let params = EpisodicParameters {
            timeline: None,
            speciation: graph.add_stochastic("lambda", lambda),
            extinction: graph.add_stochastic("mu", mu),
            fossilization: graph.add_stochastic("psi", psi),
            treatment: None,
            sampling_fraction: graph.add_constant("rho", rho),
            burst_speciation: None,
            mass_extinction: None,
            event_sampling: None,
        };
        Setup {
            graph,
            start,
            params,
        }
    }

    fn settings(
        s: &Setup,
        tree: &TimeTree,
        origin: bool,
        condition: Condition,
    ) -> BirthDeathSettings {
        BirthDeathSettings {
            origin: origin.then_some(s.start),
            root_age: (!origin).then_some(s.start),
            condition,
            taxa: tree
                .tips()
                .filter_map(|id| tree.node(id).taxon.clone())
                .collect::<Vec<Taxon>>(),
            constraints: Vec::new(),
        }
    }

    fn episodic(
        s: &Setup,
        tree: &TimeTree,
        origin: bool,
        condition: Condition,
    ) -> EpisodicBirthDeathSamplingTreatmentProcess {
        BirthDeathProcess::episodic(settings(s, tree, origin, condition), s.params).unwrap()
    }

    const TREES: [(&str, f64, bool); 4] = [
        ("((A:1.0,F:0.6):0.5,B:1.5);", 2.0, true),
        ("((A:1.0,S:0.0):0.5,B:1.5);", 2.0, true),
        ("((A:0.8,B:0.8):0.7,(C:0.8,D:0.8):0.7);", 1.5, false),
        ("(((A:0.5,F:0.2):0.4,C:0.9):0.6,(D:1.1,G:0.35):0.4);", 3.0, true),
    ];

    #[test]
    fn single_interval_matches_fossilized_process() {
        for &(newick, start_age, origin) in &TREES {
            for condition in [Condition::Time, Condition::Survival] {
                let tree = TimeTree::from_newick(newick).unwrap();
                let s = setup(start_age, 1.1, 0.4, 0.25, 0.7);
                let mut ep = episodic(&s, &tree, origin, condition);
                let mut fbd = BirthDeathProcess::fossilized(
                    settings(&s, &tree, origin, condition),
                    s.params.speciation,
                    s.params.extinction,
                    s.params.fossilization,
                    s.params.sampling_fraction,
                )
                .unwrap();
                let a = ep.ln_probability(&s.graph, &tree).unwrap();
                let b = fbd.ln_probability(&s.graph, &tree).unwrap();
                assert!(a.is_finite(), "{}", newick);
                assert!((a - b).abs() < 1e-9, "{}: {} vs {}", newick, a, b);
            }
        }
    }

    #[test]
    fn silent_breakpoint_changes_nothing() {
        let tree = TimeTree::from_newick(TREES[3].0).unwrap();
        let mut s = setup(3.0, 1.1, 0.4, 0.25, 0.7);
        let mut one = episodic(&s, &tree, true, Condition::Survival);
        let a = one.ln_probability(&s.graph, &tree).unwrap();

        s.params.timeline = Some(s.graph.add_constant("timeline", vec![0.7, 1.3]));
        let mut three = episodic(&s, &tree, true, Condition::Survival);
        let b = three.ln_probability(&s.graph, &tree).unwrap();
        assert!((a - b).abs() < 1e-9, "{} vs {}", a, b);
        assert_eq!(three.model().intervals().unwrap().len(), 3);
    }

    #[test]
    fn boundary_state_carries_over() {
        let mut s = setup(3.0, 1.0, 0.5, 0.3, 0.6);
        s.params.timeline = Some(s.graph.add_constant("timeline", vec![1.0]));
        s.params.event_sampling = Some(s.graph.add_constant("phi", vec![0.4]));
        s.params.mass_extinction = Some(s.graph.add_constant("m", vec![0.2]));
        s.params.burst_speciation = Some(s.graph.add_constant("burst", vec![0.1]));
        let params = s.params.into_parameter_set();
        let iv = Intervals::new(&params, &s.graph, 0.0).unwrap();

        let e_minus = iv.extinction_in(0, 1.0);
        let expected_c = 0.6 * (0.2 + 0.8 * (0.9 * e_minus + 0.1 * e_minus * e_minus));
        assert!((iv.c[1] - expected_c).abs() < 1e-12);
        assert!((iv.extinction(1.0) - expected_c).abs() < 1e-12);
        assert!((iv.extinction(0.0) - 0.4).abs() < 1e-12);
        let expected_d = iv.ln_density_in(0, 1.0) + (0.6 * 0.8 * (0.9 + 0.2 * e_minus)).ln();
        assert!((iv.ln_density(1.0) - expected_d).abs() < 1e-12);
    }

    #[test]
    fn event_sampled_tip_uses_the_event_probability() {
        // F sits exactly on the breakpoint at 0.5.
        let tree = TimeTree::from_newick("((A:1.0,F:0.5):0.5,B:1.5);").unwrap();
        let mut s = setup(2.0, 1.0, 0.3, 0.2, 1.0);
        s.params.timeline = Some(s.graph.add_constant("timeline", vec![0.5]));
        s.params.event_sampling = Some(s.graph.add_stochastic("phi", vec![0.3]));
        let mut p = episodic(&s, &tree, true, Condition::Time);
        let lp = p.ln_probability(&s.graph, &tree).unwrap();
        assert!(lp.is_finite());

        let iv = p.model().intervals().unwrap().clone();
        let inner = iv.ln_density(1.0) + 1f64.ln();
        let root = iv.ln_density(1.5);
        let tips = 2.0 * 1f64.ln() + 0.3f64.ln() + iv.e_previous[1].ln() - iv.ln_d_previous[1];
        let expected =
            tips + inner + root + iv.ln_density(2.0) + crate::birth_death::log_tree_topology_prob(3);
        assert!((lp - expected).abs() < 1e-10, "{} vs {}", lp, expected);
    }

    #[test]
    fn invalid_timelines_are_errors() {
        let tree = TimeTree::from_newick("((A:0.8,B:0.8):0.7,(C:0.8,D:0.8):0.7);").unwrap();

        let mut s = setup(1.5, 1.0, 0.3, 0.2, 1.0);
        s.params.timeline = Some(s.graph.add_constant("timeline", vec![1.0, 0.5]));
        let mut p = episodic(&s, &tree, false, Condition::Time);
        assert!(p.ln_probability(&s.graph, &tree).is_err());

        let mut s = setup(1.5, 1.0, 0.3, 0.2, 1.0);
        s.params.timeline = Some(s.graph.add_constant("timeline", vec![0.0]));
        let mut p = episodic(&s, &tree, false, Condition::Time);
        assert!(p.ln_probability(&s.graph, &tree).is_err());

        let mut s = setup(1.5, 1.0, 0.3, 0.2, 1.0);
        s.params.timeline = Some(s.graph.add_constant("timeline", vec![0.5]));
        s.params.speciation = s.graph.add_constant("lambda3", vec![1.0, 2.0, 3.0]);
        let mut p = episodic(&s, &tree, false, Condition::Time);
        assert!(matches!(
            p.ln_probability(&s.graph, &tree),
            Err(PhyloError::InvalidInput(_))
        ));
    }

    #[test]
    fn missing_clade_taxa_are_rejected() {
        let tree = TimeTree::from_newick("((A:0.8,B:0.8):0.7,(C:0.8,D:0.8):0.7);").unwrap();
        let s = setup(1.5, 1.0, 0.3, 0.2, 1.0);
        let mut with_missing = settings(&s, &tree, false, Condition::Time);
        with_missing.constraints = vec![Clade::new(["A", "B"]).unwrap().with_missing(3)];
        assert!(matches!(
            BirthDeathProcess::episodic(with_missing, s.params),
            Err(PhyloError::InvalidInput(_))
        ));
    }

    #[test]
    fn find_index_clamps_to_the_ends() {
        let mut s = setup(3.0, 1.0, 0.3, 0.2, 1.0);
        s.params.timeline = Some(s.graph.add_constant("timeline", vec![1.0, 2.0]));
        let iv = Intervals::new(&s.params.into_parameter_set(), &s.graph, 0.0).unwrap();
        assert_eq!(iv.find_index(0.0), 0);
        assert_eq!(iv.find_index(0.99), 0);
        assert_eq!(iv.find_index(1.0), 1);
        assert_eq!(iv.find_index(1.5), 1);
        assert_eq!(iv.find_index(2.0), 2);
        assert_eq!(iv.find_index(50.0), 2);
    }

    #[test]
    fn survival_is_one_minus_extinction() {
        let s = setup(2.0, 1.2, 0.4, 0.1, 0.5);
        let model = EpisodicSamplingTreatment::default();
        let params = s.params.into_parameter_set();
        let p = model.p_survival(&params, &s.graph, 0.0, 2.0).unwrap();
        let terms = crate::birth_death::constant::ConstantRateTerms::new(1.2, 0.4, 0.1, 0.5);
        assert!((p - (1.0 - terms.p0(2.0))).abs() < 1e-12);
    }
}
