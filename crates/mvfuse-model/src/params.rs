//! Named parameters with an explicit trainable flag.

use candle_core::Var;
use candle_nn::VarMap;
use std::sync::PoisonError;

/// One learnable tensor of a sub-model.
#[derive(Debug, Clone)]
pub struct Parameter {
    /// Fully qualified name, as stored in checkpoints.
    pub name: String,
    pub var: Var,
    /// Whether the optimizer may update this parameter.
    pub trainable: bool,
}

/// Snapshot the parameters of `varmap`, sorted by name, all carrying `trainable`.
pub(crate) fn collect(varmap: &VarMap, trainable: bool) -> Vec<Parameter> {
    let vars = varmap.data().lock().unwrap_or_else(PoisonError::into_inner);
    let mut params: Vec<Parameter> = vars
        .iter()
        .map(|(name, var)| Parameter {
            name: name.clone(),
            var: var.clone(),
            trainable,
        })
        .collect();
    params.sort_by(|a, b| a.name.cmp(&b.name));
    params
}

/// Vars the optimizer should see: all of them when trainable, none otherwise.
pub(crate) fn trainable_vars(varmap: &VarMap, trainable: bool) -> Vec<Var> {
    if trainable {
        collect(varmap, true).into_iter().map(|p| p.var).collect()
    } else {
        Vec::new()
    }
}

/// Total number of scalar elements across `params`.
#[must_use]
pub fn element_count(params: &[Parameter]) -> usize {
    params.iter().map(|p| p.var.elem_count()).sum()
}
