//! Birth-death tree priors on an incremental parameter graph.
//!
//! - **Trees**: [`TimeTree`] with ages, sampled ancestors and Newick I/O
//! - **Parameter graph**: [`Graph`] with touch, keep and restore propagation
//! - **Tree variables**: [`Model`] dispatching parameter and tree changes to
//!   every [`TreeDistribution`]
//! - **Birth-death family**: fossilized, serially sampled and episodic
//!   processes sharing [`BirthDeathProcess`]
//! - **State-dependent diversification**: ODE functors in [`ode`] with the
//!   cached pruning of [`MultiRateBirthDeathProcess`] and
//!   [`CharacterDependentCladoBirthDeathProcess`]

pub mod birth_death;
pub mod clado;
pub mod graph;
pub mod model;
pub mod multi_rate;
pub mod newick;
pub mod ode;
pub mod tree;

pub use birth_death::{
    BirthDeathProcess, BirthDeathSettings, Condition, ConstantRateFossilizedBirthDeathProcess,
    ConstantRateSerialSampledBirthDeathProcess, EpisodicBirthDeathSamplingTreatmentProcess,
    EpisodicParameters, StartAge,
};
pub use clado::{CharacterDependentCladoBirthDeathProcess, CladoParameters};
pub use graph::{DagNodeId, Graph, ParamValue};
pub use model::{Model, ParameterSet, Role, TreeDistribution, TreeHandle};
pub use multi_rate::{MultiRateBirthDeathProcess, MultiRateParameters};
pub use phylodyn_core::{PhyloError, Result};
pub use tree::{Clade, NodeId, Taxon, TimeTree, TreeNode};
