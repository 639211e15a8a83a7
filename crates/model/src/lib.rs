pub mod adversary;
pub mod backbone;
pub mod block;
pub mod config;

pub use adversary::{Adversary, AdversaryOutput, AttributeAdversary};
pub use backbone::{Backbone, BackboneOutput, ExpressionBackbone};
pub use block::ResidualBlock;
pub use config::{AdversaryConfig, BackboneConfig};

use candle_core::Var;
use candle_nn::VarMap;

/// Suffixes of batch-norm running statistics. They live in the var map next to
/// the learnable weights but are buffers, not parameters.
pub const BUFFER_SUFFIXES: [&str; 2] = ["running_mean", "running_var"];

pub fn is_buffer(name: &str) -> bool {
    BUFFER_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

/// Named learnable variables of `varmap`, sorted by name.
pub(crate) fn named_parameters(varmap: &VarMap) -> Vec<(String, Var)> {
    let mut params = named_variables(varmap);
    params.retain(|(name, _)| !is_buffer(name));
    params
}

/// Every variable of `varmap` including buffers, sorted by name.
pub(crate) fn named_variables(varmap: &VarMap) -> Vec<(String, Var)> {
    let data = varmap
        .data()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut vars: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    vars
}
